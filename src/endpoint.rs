//! Platform endpoint selection and state-file paths.
//!
//! The control channel binds a Unix domain socket under the per-user config
//! directory on POSIX, falling back to loopback TCP when socket creation
//! fails. Windows would use a named pipe; that constant is kept for the
//! status contract, but non-unix builds go straight to the TCP fallback.

use std::path::PathBuf;

use crate::config::config_dir;

/// Named-pipe endpoint on Windows (interface contract).
pub const NAMED_PIPE: &str = r"\\.\pipe\mcp-cli-ent-daemon";

/// Loopback TCP endpoint used when no Unix socket can be bound.
pub const FALLBACK_TCP: &str = "127.0.0.1:8080";

/// Where the daemon's control endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// Loopback TCP address.
    Tcp(String),
}

impl Endpoint {
    /// The platform's preferred endpoint (before any bind fallback).
    pub fn default_for_platform() -> Self {
        #[cfg(unix)]
        {
            Endpoint::Unix(config_dir().join("daemon.sock"))
        }
        #[cfg(not(unix))]
        {
            Endpoint::Tcp(FALLBACK_TCP.to_string())
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => f.write_str(addr),
        }
    }
}

/// Platform tag reported in status responses. WSL is worth distinguishing
/// because its socket and process semantics straddle both worlds.
pub fn platform() -> String {
    if is_wsl() {
        return "wsl".to_string();
    }
    std::env::consts::OS.to_string()
}

fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| v.contains("Microsoft") || v.contains("WSL"))
        .unwrap_or(false)
}

/// `<config-dir>/daemon.pid` — ASCII pid of the daemon owning the endpoint.
pub fn pid_file_path() -> PathBuf {
    config_dir().join("daemon.pid")
}

/// `<config-dir>/daemon.log` — append-only daemon log.
pub fn log_file_path() -> PathBuf {
    config_dir().join("daemon.log")
}

/// `<config-dir>/sessions` — one metadata document per session.
pub fn sessions_dir() -> PathBuf {
    config_dir().join("sessions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            Endpoint::Tcp(FALLBACK_TCP.to_string()).to_string(),
            "127.0.0.1:8080"
        );
        assert_eq!(
            Endpoint::Unix(PathBuf::from("/tmp/daemon.sock")).to_string(),
            "/tmp/daemon.sock"
        );
    }

    #[test]
    fn test_state_paths_share_the_config_dir() {
        let dir = config_dir();
        assert_eq!(pid_file_path(), dir.join("daemon.pid"));
        assert_eq!(log_file_path(), dir.join("daemon.log"));
        assert_eq!(sessions_dir(), dir.join("sessions"));
    }

    #[test]
    fn test_named_pipe_constant() {
        assert!(NAMED_PIPE.starts_with(r"\\.\pipe\"));
    }
}
