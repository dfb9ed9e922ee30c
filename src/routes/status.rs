//! `GET /` — daemon status.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ApiResponse;
use crate::sessions::session::SessionSummary;
use crate::state::AppState;

/// Wire shape of the daemon status document.
#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    pub version: String,
    #[serde(rename = "sessionCount")]
    pub session_count: usize,
    #[serde(rename = "activeSessions")]
    pub active_sessions: Vec<SessionSummary>,
    pub pid: u32,
    pub endpoint: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /` — health and session overview.
pub async fn status(State(state): State<AppState>) -> Json<ApiResponse> {
    let active_sessions = state.manager.summaries().await;
    ApiResponse::ok(DaemonStatus {
        running: true,
        start_time: state.start_time,
        version: env!("CARGO_PKG_VERSION").to_string(),
        session_count: active_sessions.len(),
        active_sessions,
        pid: state.pid,
        endpoint: state.endpoint.clone(),
        platform: state.platform.clone(),
        error: None,
    })
}
