#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # mcpd
//!
//! Persistent session daemon for MCP tool servers.
//!
//! Short-lived CLI invocations hand tool calls off to this daemon so that
//! expensive backing processes — browser automation engines in particular —
//! keep their tabs, logins, and warmed caches across invocations instead of
//! restarting on every call.
//!
//! ## Subcommands
//!
//! - `mcpd daemon start [--foreground]` — run the daemon (detached by default)
//! - `mcpd daemon stop` — signal a running daemon to shut down
//! - `mcpd daemon status` — print the daemon status document
//! - `mcpd daemon restart` — stop (if running) and start detached
//!
//! ## Control channel
//!
//! | Method | Path                              | Description                |
//! |--------|-----------------------------------|----------------------------|
//! | GET    | `/`                               | Daemon status              |
//! | GET    | `/sessions`                       | List session summaries     |
//! | DELETE | `/sessions`                       | Stop every session         |
//! | POST   | `/sessions/{name}/start`          | Start a session            |
//! | POST   | `/sessions/{name}/tools`          | List a session's tools     |
//! | POST   | `/sessions/{name}/call-tool/{t}`  | Execute a tool             |
//! | GET    | `/sessions/{name}`                | One session summary        |
//! | DELETE | `/sessions/{name}`                | Stop a session             |

use clap::{Parser, Subcommand};

use mcpd::daemon;

/// Persistent session daemon for MCP tool servers.
#[derive(Parser)]
#[command(name = "mcpd", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the daemon process.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon (detached unless --foreground).
    Start {
        /// Run in the foreground, logging to the daemon log file.
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a running daemon.
    Stop,
    /// Print the daemon status document as JSON.
    Status,
    /// Stop (if running) and start detached.
    Restart,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start { foreground: true } => {
                // The daemon configures its own log-file subscriber.
                if let Err(e) = daemon::run_foreground().await {
                    eprintln!("mcpd: {e}");
                    std::process::exit(1);
                }
            }
            DaemonAction::Start { foreground: false } => {
                init_cli_logging();
                match daemon::start_background().await {
                    Ok(pid) => println!("Daemon started (pid {pid})"),
                    Err(e) => {
                        eprintln!("mcpd: {e}");
                        std::process::exit(1);
                    }
                }
            }
            DaemonAction::Stop => {
                init_cli_logging();
                match daemon::stop().await {
                    Ok(()) => println!("Daemon stopped"),
                    Err(e) => {
                        eprintln!("mcpd: {e}");
                        std::process::exit(1);
                    }
                }
            }
            DaemonAction::Status => {
                init_cli_logging();
                let status = daemon::status().await;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .unwrap_or_else(|_| status.to_string())
                );
            }
            DaemonAction::Restart => {
                init_cli_logging();
                match daemon::restart().await {
                    Ok(pid) => println!("Daemon restarted (pid {pid})"),
                    Err(e) => {
                        eprintln!("mcpd: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
    }
}

fn init_cli_logging() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
