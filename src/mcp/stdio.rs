//! Child-process stdio transport.
//!
//! Framing is one JSON-RPC object per line: UTF-8 JSON terminated by `\n` on
//! the child's stdin, one response object per line on its stdout. The child's
//! stderr is drained into `tracing::debug` so it never backs up the pipe.
//!
//! Requests are strictly sequential — the owning worker serializes access —
//! so responses are paired positionally: one line read per request. Outgoing
//! ids still increase monotonically per transport. After a deadline expiry
//! the transport is marked dirty and refuses further traffic; a stale line
//! from the timed-out request can then never be paired with a later one. The
//! session's health-check/restart path recycles dirty transports.
//!
//! Shutdown closes stdin, sends the graceful terminate signal, waits up to
//! 2 s, then force-kills and awaits reaping.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use super::{
    call_tool_params, initialize_params, parse_response, parse_tool_result, parse_tools,
    unwrap_response, JsonRpcRequest, Tool, ToolResult,
};
use crate::error::SessionError;

/// How long shutdown waits after the graceful signal before force-killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A spawned MCP server and its line-framed JSON-RPC pipe.
#[derive(Debug)]
pub struct StdioTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
    /// Persistent line buffer: a timed-out read leaves its partial frame
    /// here, so the framing never tears even across cancellation.
    line_buf: String,
    next_id: u64,
    dirty: bool,
    pid: u32,
}

impl StdioTransport {
    /// Spawn the server with the daemon's environment plus `env` overlaid
    /// (overlay wins on conflict) and wire up the pipes.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, SessionError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::Transport(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Transport("failed to take stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Transport("failed to take stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Transport("failed to take stderr pipe".into()))?;

        let pid = child.id().unwrap_or(0);

        // Drain stderr so the child can't block on a full pipe. Lines show up
        // under RUST_LOG=debug, otherwise they're discarded.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "mcpd::stdio", pid, "server stderr: {line}");
            }
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            reader: BufReader::new(stdout),
            line_buf: String::new(),
            next_id: 0,
            dirty: false,
            pid,
        })
    }

    /// OS pid of the spawned child (0 if unavailable).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether a previous deadline expiry poisoned this transport.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Perform one request/response round-trip within `deadline`.
    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, SessionError> {
        if self.dirty {
            return Err(SessionError::Transport(
                "transport is dirty after a timed-out request".into(),
            ));
        }

        self.next_id += 1;
        let req = JsonRpcRequest::new(self.next_id, method, params);
        self.write_frame(&req).await?;

        let read = tokio::time::timeout(deadline, self.reader.read_line(&mut self.line_buf)).await;
        match read {
            Err(_) => {
                self.dirty = true;
                Err(SessionError::Timeout(format!(
                    "{method} did not complete within {}s",
                    deadline.as_secs_f64()
                )))
            }
            Ok(Err(e)) => Err(SessionError::Transport(format!(
                "failed to read response: {e}"
            ))),
            Ok(Ok(0)) => Err(SessionError::Transport(
                "server closed its stdout".into(),
            )),
            Ok(Ok(_)) => {
                let line = std::mem::take(&mut self.line_buf);
                let resp = parse_response(line.trim())?;
                unwrap_response(resp)
            }
        }
    }

    async fn write_frame(&mut self, req: &JsonRpcRequest) -> Result<(), SessionError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SessionError::Transport("stdin already closed".into()))?;
        let mut frame = serde_json::to_vec(req)
            .map_err(|e| SessionError::Transport(format!("failed to encode request: {e}")))?;
        frame.push(b'\n');
        stdin
            .write_all(&frame)
            .await
            .map_err(|e| SessionError::Transport(format!("failed to write request: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| SessionError::Transport(format!("failed to flush request: {e}")))?;
        Ok(())
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

    /// Send a one-way notification (no response is read).
    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        let req = JsonRpcRequest::notification(method, params);
        self.write_frame(&req).await
    }

    /// Close stdin, terminate gracefully, force-kill after the grace period,
    /// and await reaping.
    pub async fn shutdown(mut self) {
        // Dropping stdin closes the pipe; well-behaved servers exit on EOF.
        drop(self.stdin.take());

        #[cfg(unix)]
        if self.pid > 0 {
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(self.pid as i32, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: "mcpd::stdio", pid = self.pid, "server exited: {status}");
            }
            Ok(Err(e)) => {
                debug!(target: "mcpd::stdio", pid = self.pid, "wait failed: {e}");
            }
            Err(_) => {
                // Browser servers fork helpers; take the whole tree down.
                crate::process::terminate_tree(self.pid).await;
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                debug!(target: "mcpd::stdio", pid = self.pid, "server required force-kill");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_fixture(script: &str) -> StdioTransport {
        StdioTransport::spawn("sh", &["-c".to_string(), script.to_string()], &HashMap::new())
            .expect("spawn fixture")
    }

    /// Answers every stdin line with an empty tool directory.
    const ECHO_TOOLS: &str = r#"while read line; do printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'; done"#;

    #[tokio::test]
    async fn test_list_tools_round_trip() {
        let mut transport = sh_fixture(ECHO_TOOLS);
        let tools = transport
            .list_tools(Duration::from_secs(5))
            .await
            .expect("list tools");
        assert!(tools.is_empty());
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_sequential_requests_reuse_the_pipe() {
        let mut transport = sh_fixture(ECHO_TOOLS);
        for _ in 0..3 {
            transport
                .list_tools(Duration::from_secs(5))
                .await
                .expect("list tools");
        }
        assert!(!transport.is_dirty());
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_env_overlay_reaches_child() {
        let mut env = HashMap::new();
        env.insert("MCPD_FIXTURE".to_string(), "hello".to_string());
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"value":"%s"}}\n' "$MCPD_FIXTURE"; while read line; do :; done"#;
        let mut transport =
            StdioTransport::spawn("sh", &["-c".to_string(), script.to_string()], &env)
                .expect("spawn fixture");
        let result = transport
            .initialize(Duration::from_secs(5))
            .await
            .expect("initialize");
        assert_eq!(result["value"], "hello");
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_marks_transport_dirty() {
        let mut transport = sh_fixture("read line; sleep 30");
        let err = transport
            .list_tools(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(transport.is_dirty());

        // Further traffic is refused until the session recycles the transport.
        let err = transport
            .list_tools(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_json_rpc_error_surfaces_with_code() {
        let script = r#"while read line; do printf '%s\n' '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}'; done"#;
        let mut transport = sh_fixture(script);
        let err = transport
            .list_tools(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol { code: -32601, .. }
        ));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_a_protocol_error() {
        let script = r"while read line; do printf 'not json\n'; done";
        let mut transport = sh_fixture(script);
        let err = transport
            .list_tools(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol { code: -32700, .. }
        ));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_reaps_child_within_grace() {
        let transport = sh_fixture(ECHO_TOOLS);
        let pid = transport.pid();
        assert!(pid > 0);
        let started = Instant::now();
        transport.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!crate::process::is_alive(pid));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_transport_error() {
        let err = StdioTransport::spawn("/nonexistent/mcpd-test-binary", &[], &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
