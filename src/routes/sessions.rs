//! REST endpoints for session management.
//!
//! - `GET    /sessions`                         — list session summaries
//! - `DELETE /sessions`                         — stop every session
//! - `POST   /sessions/{name}/start`            — start a session
//! - `POST   /sessions/{name}/tools`            — list a session's tools
//! - `POST   /sessions/{name}/call-tool/{tool}` — execute a tool
//! - `GET    /sessions/{name}`                  — one session summary
//! - `DELETE /sessions/{name}`                  — stop a session

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::ApiResponse;
use crate::config::ServerSpec;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub config: ServerSpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// `GET /sessions` — summaries of every known session.
pub async fn list(State(state): State<AppState>) -> Json<ApiResponse> {
    ApiResponse::ok(state.manager.summaries().await)
}

/// `DELETE /sessions` — stop all sessions. Per-session failures are logged,
/// never abort the sweep.
pub async fn stop_all(State(state): State<AppState>) -> Json<ApiResponse> {
    for (name, err) in state.manager.stop_all().await {
        warn!("Error stopping session {name}: {err}");
    }
    ApiResponse::ok(json!({"message": "All sessions stopped"}))
}

/// `POST /sessions/{name}/start` — create and bring up a session from the
/// spec in the request body.
pub async fn start_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Json<ApiResponse> {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ApiResponse::fail(format!("Invalid request body: {rejection}"))
        }
    };

    match state.manager.start_session(&name, req.config).await {
        Ok(()) => ApiResponse::ok(json!({"message": "Session starting", "server": name})),
        Err(e) => ApiResponse::fail(e),
    }
}

/// `DELETE /sessions/{name}` — stop one session.
pub async fn stop_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<ApiResponse> {
    match state.manager.stop_session(&name).await {
        Ok(()) => ApiResponse::ok(json!({"message": "Session stopped", "server": name})),
        Err(e) => ApiResponse::fail(e),
    }
}

/// `GET /sessions/{name}` — one session summary.
pub async fn get_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<ApiResponse> {
    match state.manager.get(&name).await {
        Some(handle) => ApiResponse::ok(handle.summary().await),
        None => ApiResponse::fail(format!("session not found: {name}")),
    }
}

/// `POST /sessions/{name}/tools` — the session's tool directory.
pub async fn list_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<ApiResponse> {
    match state.manager.list_tools(&name).await {
        Ok(tools) => ApiResponse::ok(tools),
        Err(e) => ApiResponse::fail(e),
    }
}

/// `POST /sessions/{name}/call-tool/{tool}` — execute a tool with the args
/// map from the request body.
pub async fn call_tool(
    State(state): State<AppState>,
    Path((name, tool)): Path<(String, String)>,
    body: Result<Json<CallRequest>, JsonRejection>,
) -> Json<ApiResponse> {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ApiResponse::fail(format!("Invalid request body: {rejection}"))
        }
    };

    match state.manager.call_tool(&name, &tool, &req.args).await {
        Ok(result) => ApiResponse::ok(result),
        Err(e) => ApiResponse::fail(e),
    }
}
