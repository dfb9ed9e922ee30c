//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::DaemonConfig;
use crate::sessions::SessionManager;

/// Shared state for the control channel.
#[derive(Clone)]
pub struct AppState {
    /// Daemon knobs loaded at startup.
    pub daemon_config: Arc<DaemonConfig>,
    /// The session registry.
    pub manager: SessionManager,
    /// Wall-clock start time (reported as RFC 3339 in status responses).
    pub start_time: DateTime<Utc>,
    /// This daemon's pid.
    pub pid: u32,
    /// Rendered endpoint the control channel is bound to.
    pub endpoint: String,
    /// Platform tag (`linux`, `macos`, `wsl`, ...).
    pub platform: String,
}

impl AppState {
    pub fn new(
        daemon_config: DaemonConfig,
        manager: SessionManager,
        endpoint: String,
        platform: String,
    ) -> Self {
        Self {
            daemon_config: Arc::new(daemon_config),
            manager,
            start_time: Utc::now(),
            pid: std::process::id(),
            endpoint,
            platform,
        }
    }
}
