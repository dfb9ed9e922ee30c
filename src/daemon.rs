//! Daemon lifecycle: foreground run, background start, stop, status.
//!
//! Exactly one daemon owns the control endpoint; ownership is recorded in
//! `<config-dir>/daemon.pid`. A stale pid file (recorded process dead) is
//! removed on sight. Background start re-executes the current binary with
//! the foreground flag and polls the pid file for liveness.

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{config_dir, Configuration, DaemonConfig};
use crate::endpoint::{self, Endpoint};
use crate::error::SessionError;
use crate::process;
use crate::routes;
use crate::sessions::{store::FileStore, SessionManager};
use crate::state::AppState;
use crate::supervisor;

/// How long `stop` waits after the graceful signal before force-killing.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// In-flight control handlers get this long after shutdown is signalled
/// before the listener is force-closed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How long a background start polls the pid file before giving up.
const BG_START_ATTEMPTS: u32 = 10;
const BG_START_POLL: Duration = Duration::from_millis(100);

/// The listener actually bound, plus its rendered endpoint.
enum Bound {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
    Tcp(tokio::net::TcpListener),
}

/// Run the daemon in the foreground until signalled.
pub async fn run_foreground() -> Result<(), SessionError> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| SessionError::Config(format!("failed to create config directory: {e}")))?;

    let daemon_config = DaemonConfig::load();
    init_logging(&daemon_config)?;

    if let (true, pid) = is_running() {
        return Err(SessionError::Config(format!(
            "daemon is already running (pid {pid})"
        )));
    }

    let catalog = Configuration::load_default()?;
    info!(
        "mcpd v{} starting, {} server(s) configured",
        env!("CARGO_PKG_VERSION"),
        catalog.mcp_servers.len()
    );

    let store = FileStore::new(endpoint::sessions_dir());
    let manager = SessionManager::new(store, catalog, daemon_config.max_sessions);
    manager.recover_and_autostart().await;

    let bound = bind_endpoint().await?;
    let rendered = match &bound {
        #[cfg(unix)]
        Bound::Unix(_, path) => path.display().to_string(),
        Bound::Tcp(listener) => listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| endpoint::FALLBACK_TCP.to_string()),
    };

    write_pid_file()?;
    info!(
        "Daemon listening on {rendered} (pid {})",
        std::process::id()
    );

    let state = AppState::new(
        daemon_config,
        manager.clone(),
        rendered,
        endpoint::platform(),
    );
    let app = routes::router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor_task = supervisor::spawn(manager.clone(), shutdown_rx.clone());

    // Signal listener: first SIGINT/SIGTERM broadcasts shutdown.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = shutdown_tx.send(true);
        });
    }

    let mut graceful_rx = shutdown_rx.clone();
    let graceful = async move {
        let _ = graceful_rx.changed().await;
    };

    let mut server = match bound {
        #[cfg(unix)]
        Bound::Unix(listener, path) => {
            let serve = axum::serve(listener, app).with_graceful_shutdown(graceful);
            tokio::spawn(async move {
                if let Err(e) = serve.await {
                    warn!("Control channel error: {e}");
                }
                let _ = std::fs::remove_file(path);
            })
        }
        Bound::Tcp(listener) => {
            let serve = axum::serve(listener, app).with_graceful_shutdown(graceful);
            tokio::spawn(async move {
                if let Err(e) = serve.await {
                    warn!("Control channel error: {e}");
                }
            })
        }
    };

    // Wait for the shutdown broadcast, then drain with a deadline.
    let mut rx = shutdown_rx;
    let _ = rx.changed().await;
    info!("Shutting down...");
    manager.begin_shutdown();

    if tokio::time::timeout(DRAIN_GRACE, &mut server).await.is_err() {
        warn!("Control handlers still busy after {DRAIN_GRACE:?}, force-closing");
        server.abort();
    }

    supervisor_task.abort();
    for (name, err) in manager.stop_all().await {
        warn!("Error stopping session {name}: {err}");
    }
    remove_pid_file();
    info!("Daemon stopped");
    Ok(())
}

/// Bind the platform endpoint: Unix socket with 0600 permissions, falling
/// back to loopback TCP when socket creation fails.
async fn bind_endpoint() -> Result<Bound, SessionError> {
    #[cfg(unix)]
    {
        if let Endpoint::Unix(path) = Endpoint::default_for_platform() {
            // A previous daemon may have left the socket file behind.
            let _ = std::fs::remove_file(&path);
            match tokio::net::UnixListener::bind(&path) {
                Ok(listener) => {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                        .map_err(|e| {
                            SessionError::Config(format!(
                                "failed to set socket permissions: {e}"
                            ))
                        })?;
                    return Ok(Bound::Unix(listener, path));
                }
                Err(e) => {
                    warn!(
                        "Unix socket bind failed ({e}), falling back to {}",
                        endpoint::FALLBACK_TCP
                    );
                }
            }
        }
    }

    let listener = tokio::net::TcpListener::bind(endpoint::FALLBACK_TCP)
        .await
        .map_err(|e| {
            SessionError::Config(format!(
                "failed to bind {}: {e}",
                endpoint::FALLBACK_TCP
            ))
        })?;
    Ok(Bound::Tcp(listener))
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

/// Logging for the foreground daemon: append to `daemon.log`, filter from
/// `RUST_LOG` falling back to the configured level.
fn init_logging(daemon_config: &DaemonConfig) -> Result<(), SessionError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(endpoint::log_file_path())
        .map_err(|e| SessionError::Config(format!("failed to open log file: {e}")))?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| daemon_config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// Start the daemon detached: re-execute this binary with the foreground
/// flag and poll the pid file until liveness is observed.
pub async fn start_background() -> Result<u32, SessionError> {
    if let (true, pid) = is_running() {
        return Err(SessionError::Config(format!(
            "daemon is already running (pid {pid})"
        )));
    }

    let exe = std::env::current_exe()
        .map_err(|e| SessionError::Config(format!("failed to resolve executable path: {e}")))?;

    std::process::Command::new(exe)
        .args(["daemon", "start", "--foreground"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| SessionError::Transport(format!("failed to start daemon process: {e}")))?;

    for _ in 0..BG_START_ATTEMPTS {
        tokio::time::sleep(BG_START_POLL).await;
        if let (true, pid) = is_running() {
            return Ok(pid);
        }
    }

    Err(SessionError::Transport(
        "daemon failed to start within timeout".into(),
    ))
}

/// Stop a running daemon: graceful signal, wait, force-kill.
pub async fn stop() -> Result<(), SessionError> {
    let (running, pid) = is_running();
    if !running {
        return Err(SessionError::NotFound("daemon is not running".into()));
    }

    info!("Stopping daemon (pid {pid})");

    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !process::is_alive(pid) {
                remove_pid_file();
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    {
        process::terminate(pid).await;
        let _ = STOP_GRACE;
    }

    remove_pid_file();
    Ok(())
}

/// Restart: stop if running, pause, start detached.
pub async fn restart() -> Result<u32, SessionError> {
    if let Err(e) = stop().await {
        if !matches!(e, SessionError::NotFound(_)) {
            warn!("Stop before restart failed: {e}");
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    start_background().await
}

/// Query the daemon's status document.
///
/// TCP endpoints are asked over HTTP; for a Unix socket endpoint only the
/// pid-file-derived basics are reported.
pub async fn status() -> serde_json::Value {
    let (running, pid) = is_running();
    let ep = Endpoint::default_for_platform();
    let basic = serde_json::json!({
        "running": running,
        "pid": pid,
        "endpoint": ep.to_string(),
        "platform": endpoint::platform(),
    });

    if !running {
        return basic;
    }

    let Endpoint::Tcp(addr) = ep else {
        return basic;
    };

    let url = format!("http://{addr}/");
    let resp = match reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            let mut basic = basic;
            basic["error"] = serde_json::json!(format!("daemon not responding: {e}"));
            return basic;
        }
    };

    match resp.json::<serde_json::Value>().await {
        Ok(envelope) if envelope["success"] == true => envelope["data"].clone(),
        Ok(envelope) => {
            let mut basic = basic;
            basic["error"] = envelope["error"].clone();
            basic
        }
        Err(e) => {
            let mut basic = basic;
            basic["error"] = serde_json::json!(format!("invalid status response: {e}"));
            basic
        }
    }
}

/// Whether the pid file names a live daemon. Stale files are removed.
pub fn is_running() -> (bool, u32) {
    is_running_at(&endpoint::pid_file_path())
}

fn is_running_at(pid_file: &Path) -> (bool, u32) {
    let Some(pid) = read_pid_file(pid_file) else {
        return (false, 0);
    };
    if process::is_alive(pid) {
        (true, pid)
    } else {
        // Stale: the recorded process is gone.
        let _ = std::fs::remove_file(pid_file);
        (false, 0)
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let data = std::fs::read_to_string(path).ok()?;
    data.trim().parse().ok()
}

fn write_pid_file() -> Result<(), SessionError> {
    let path = endpoint::pid_file_path();
    std::fs::write(&path, format!("{}\n", std::process::id()))
        .map_err(|e| SessionError::Config(format!("failed to write pid file: {e}")))
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(endpoint::pid_file_path());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "12345\n").expect("write");
        assert_eq!(read_pid_file(&path), Some(12345));
    }

    #[test]
    fn test_garbage_pid_file_reads_as_none() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not a pid\n").expect("write");
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn test_missing_pid_file_means_not_running() {
        let dir = TempDir::new().expect("tempdir");
        let (running, pid) = is_running_at(&dir.path().join("daemon.pid"));
        assert!(!running);
        assert_eq!(pid, 0);
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("daemon.pid");
        // Beyond any realistic pid_max, so certainly dead.
        std::fs::write(&path, "2147483632\n").expect("write");

        let (running, _) = is_running_at(&path);
        assert!(!running);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_pid_file_reports_running() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, format!("{}\n", std::process::id())).expect("write");

        let (running, pid) = is_running_at(&path);
        assert!(running);
        assert_eq!(pid, std::process::id());
        assert!(path.exists());
    }
}
