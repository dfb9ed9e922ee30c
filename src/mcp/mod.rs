//! MCP (Model Context Protocol) JSON-RPC 2.0 wire types.
//!
//! The daemon talks JSON-RPC 2.0 to tool servers over two transports:
//! line-framed stdio to a spawned child ([`stdio::StdioTransport`]) and
//! HTTP POST ([`http::HttpTransport`]). Methods used: `initialize`,
//! `tools/list`, `tools/call`, plus one-way notifications (no id).
//!
//! Tool arguments stay schemaless ([`serde_json::Value`]) inside the daemon;
//! the only introspection performed is [`Tool::validate_arguments`].

pub mod http;
pub mod stdio;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::SessionError;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC 2.0 request. Notifications carry `id: None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    /// A one-way notification (no id, no response expected).
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Unwrap a parsed response into its `result`, mapping the `error` member to
/// [`SessionError::Protocol`].
pub fn unwrap_response(resp: JsonRpcResponse) -> Result<Value, SessionError> {
    if let Some(err) = resp.error {
        return Err(SessionError::Protocol {
            code: err.code,
            message: err.message,
        });
    }
    Ok(resp.result.unwrap_or(Value::Null))
}

/// Parse raw bytes as a JSON-RPC response. Unparseable replies surface as
/// [`SessionError::Protocol`] with the parse-error code.
pub fn parse_response(raw: &str) -> Result<JsonRpcResponse, SessionError> {
    serde_json::from_str(raw).map_err(|e| SessionError::Protocol {
        code: PARSE_ERROR,
        message: format!("unparseable JSON-RPC response: {e}"),
    })
}

/// An MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "inputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

/// Result of a `tools/call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Tool {
    /// Validate an argument map against this tool's input schema.
    ///
    /// Checks the two constraints the daemon enforces: every name in the
    /// schema's `required` array is present, and when the schema declares
    /// `additionalProperties: false` every argument key is declared under
    /// `properties`. Anything deeper is the server's business.
    pub fn validate_arguments(&self, args: &Map<String, Value>) -> Result<(), SessionError> {
        let Some(schema) = &self.input_schema else {
            return Ok(());
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !args.contains_key(name) {
                    return Err(SessionError::Config(format!(
                        "missing required argument: {name}"
                    )));
                }
            }
        }

        if schema.get("additionalProperties").and_then(Value::as_bool) == Some(false) {
            let properties = schema.get("properties").and_then(Value::as_object);
            for key in args.keys() {
                let declared = properties.is_some_and(|p| p.contains_key(key));
                if !declared {
                    return Err(SessionError::Config(format!("unknown argument: {key}")));
                }
            }
        }

        Ok(())
    }
}

/// The `tools` array inside a `tools/list` result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

/// Build the params object for `initialize`.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcpd",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Build the params object for `tools/call`.
pub fn call_tool_params(tool: &str, args: &Map<String, Value>) -> Value {
    json!({
        "name": tool,
        "arguments": args,
    })
}

/// Parse a raw `tools/list` result value into the tool directory.
pub fn parse_tools(result: Value) -> Result<Vec<Tool>, SessionError> {
    let parsed: ListToolsResult =
        serde_json::from_value(result).map_err(|e| SessionError::Protocol {
            code: PARSE_ERROR,
            message: format!("malformed tools/list result: {e}"),
        })?;
    Ok(parsed.tools)
}

/// Parse a raw `tools/call` result value.
pub fn parse_tool_result(result: Value) -> Result<ToolResult, SessionError> {
    serde_json::from_value(result).map_err(|e| SessionError::Protocol {
        code: PARSE_ERROR,
        message: format!("malformed tools/call result: {e}"),
    })
}

/// A session's byte-level channel: a spawned child process or a pooled HTTP
/// client. The owning worker serializes all access, so methods take `&mut`.
#[derive(Debug)]
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    /// `initialize` handshake.
    pub async fn initialize(&mut self, deadline: Duration) -> Result<Value, SessionError> {
        match self {
            Transport::Stdio(t) => t.initialize(deadline).await,
            Transport::Http(t) => t.initialize(deadline).await,
        }
    }

    /// `tools/list` round-trip.
    pub async fn list_tools(&mut self, deadline: Duration) -> Result<Vec<Tool>, SessionError> {
        match self {
            Transport::Stdio(t) => t.list_tools(deadline).await,
            Transport::Http(t) => t.list_tools(deadline).await,
        }
    }

    /// `tools/call` round-trip.
    pub async fn call_tool(
        &mut self,
        tool: &str,
        args: &Map<String, Value>,
        deadline: Duration,
    ) -> Result<ToolResult, SessionError> {
        match self {
            Transport::Stdio(t) => t.call_tool(tool, args, deadline).await,
            Transport::Http(t) => t.call_tool(tool, args, deadline).await,
        }
    }

    /// Child pid for stdio transports; 0 for HTTP.
    pub fn pid(&self) -> u32 {
        match self {
            Transport::Stdio(t) => t.pid(),
            Transport::Http(_) => 0,
        }
    }

    /// Release the transport: reap the child for stdio, nothing for HTTP.
    pub async fn shutdown(self) {
        match self {
            Transport::Stdio(t) => t.shutdown().await,
            Transport::Http(_) => {}
        }
    }
}

/// Merge default + overlay headers for the HTTP transport.
pub fn http_headers(overlay: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        (
            "Accept".to_string(),
            "application/json, text/event-stream".to_string(),
        ),
    ];
    for (key, value) in overlay {
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        headers.push((key.clone(), value.clone()));
    }
    headers
}

/// Clamp a spec-level timeout (seconds, 0 = unset) to a hard ceiling.
pub fn effective_deadline(spec_timeout_secs: u64, ceiling: Duration) -> Duration {
    if spec_timeout_secs == 0 {
        ceiling
    } else {
        ceiling.min(Duration::from_secs(spec_timeout_secs))
    }
}
