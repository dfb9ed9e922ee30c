//! Control-channel HTTP handlers.
//!
//! Every response uses the envelope `{success, data?, error?}` with HTTP
//! status 200 — the `success` field is authoritative, so clients have a
//! single decoding path. Only transport-level problems (unknown route,
//! wrong method) use 4xx, which the router produces on its own.

pub mod sessions;
pub mod status;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// The uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    /// Success envelope around any serializable payload.
    pub fn ok(data: impl Serialize) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            error: None,
        })
    }

    /// Business-error envelope (still HTTP 200).
    pub fn fail(error: impl std::fmt::Display) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        })
    }
}

/// Assemble the control-channel router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status::status))
        .route(
            "/sessions",
            get(sessions::list).delete(sessions::stop_all),
        )
        .route(
            "/sessions/{name}",
            get(sessions::get_session).delete(sessions::stop_session),
        )
        .route("/sessions/{name}/start", post(sessions::start_session))
        .route("/sessions/{name}/tools", post(sessions::list_tools))
        .route(
            "/sessions/{name}/call-tool/{tool}",
            post(sessions::call_tool),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
