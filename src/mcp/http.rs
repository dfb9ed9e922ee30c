//! HTTP POST transport.
//!
//! Each JSON-RPC request is one `POST` to the server's base URL with
//! `Content-Type: application/json` and `Accept: application/json,
//! text/event-stream`, the spec's header overlay merged over those defaults.
//! Connection pooling and keep-alive are whatever the underlying client
//! provides; there is no pipelining. Cancellation rides on the per-request
//! timeout. There is nothing to release on shutdown beyond the pooled
//! client's own connections.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use super::{
    call_tool_params, http_headers, initialize_params, parse_response, parse_tool_result,
    parse_tools, unwrap_response, JsonRpcRequest, Tool, ToolResult,
};
use crate::error::SessionError;

/// Connect timeout applied to the pooled client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A pooled JSON-RPC-over-HTTP client for one MCP server.
#[derive(Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    headers: Vec<(String, String)>,
    next_id: u64,
}

impl HttpTransport {
    /// Capture the base URL and header overlay and allocate the pooled client.
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SessionError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            headers: http_headers(headers),
            next_id: 0,
        })
    }

    /// The server's base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, SessionError> {
        self.next_id += 1;
        let req = JsonRpcRequest::new(self.next_id, method, params);

        let mut builder = self
            .http
            .post(&self.base_url)
            .timeout(deadline)
            .json(&req);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SessionError::Timeout(format!(
                    "{method} did not complete within {}s",
                    deadline.as_secs_f64()
                ))
            } else {
                SessionError::Transport(format!("HTTP request failed: {e}"))
            }
        })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SessionError::Transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(SessionError::Transport(format!(
                "HTTP error {status}: {body}"
            )));
        }

        unwrap_response(parse_response(&body)?)
    }

    /// `initialize` handshake; the raw result is returned for logging.
    pub async fn initialize(&mut self, deadline: Duration) -> Result<Value, SessionError> {
        self.request("initialize", Some(initialize_params()), deadline)
            .await
    }

    /// `tools/list` round-trip.
    pub async fn list_tools(&mut self, deadline: Duration) -> Result<Vec<Tool>, SessionError> {
        let result = self.request("tools/list", None, deadline).await?;
        parse_tools(result)
    }

    /// `tools/call` round-trip.
    pub async fn call_tool(
        &mut self,
        tool: &str,
        args: &serde_json::Map<String, Value>,
        deadline: Duration,
    ) -> Result<ToolResult, SessionError> {
        let result = self
            .request("tools/call", Some(call_tool_params(tool, args)), deadline)
            .await?;
        parse_tool_result(result)
    }
}
