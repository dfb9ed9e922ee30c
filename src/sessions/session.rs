//! The session record and its worker.
//!
//! A [`SessionHandle`] is both the registry record and the worker that owns
//! the transport. The state machine lives in a `tokio::sync::watch` channel
//! so concurrent tool calls can await the outcome of an in-flight start.
//! The transport sits behind a `tokio::sync::Mutex` — the only lock held
//! across I/O; every JSON-RPC round-trip holds it for exactly one
//! request/response exchange, which serializes requests and keeps ids
//! monotonic on the wire. Record fields (timestamps, error, pid) and the
//! tool cache sit behind their own locks, held briefly and never across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use super::detection::{
    idle_timeout_secs, SessionKind, CALL_CEILING, HEALTH_CEILING, LIST_CEILING, START_CEILING,
};
use super::store::{FileStore, SessionMetadata};
use crate::config::ServerSpec;
use crate::error::SessionError;
use crate::mcp::{effective_deadline, HttpTransport, StdioTransport, Tool, ToolResult, Transport};
use crate::process;

/// Delay between stop and start during a restart, letting the OS reclaim
/// pipes and sockets.
const RESTART_DELAY: Duration = Duration::from_millis(100);

/// Key under which the tool directory is cached.
const TOOL_CACHE_KEY: &str = "list";

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Starting,
    Active,
    Stopping,
    Stopped,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Inactive => "inactive",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable record fields, guarded briefly.
#[derive(Debug)]
struct RecordFields {
    start_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    error: String,
    pid: u32,
    /// Whether this record ever reached Active. Metadata exists on disk
    /// only for sessions that did; a failed first bring-up stays in-memory.
    ever_active: bool,
}

/// Wire shape of a session in status responses.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub status: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "lastUsed")]
    pub last_used: DateTime<Utc>,
    /// Nanoseconds since the session started.
    pub duration: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// One session: registry record plus the worker owning its transport.
#[derive(Debug)]
pub struct SessionHandle {
    server_name: String,
    session_id: String,
    kind: SessionKind,
    /// Immutable spec snapshot; reconfiguration requires stop + recreate.
    spec: ServerSpec,
    /// Environment overlay resolved at creation (stdio only).
    resolved_env: HashMap<String, String>,
    store: FileStore,
    state_tx: watch::Sender<SessionState>,
    transport: Mutex<Option<Transport>>,
    fields: RwLock<RecordFields>,
    /// Replaced atomically under key `"list"`. Invalidated only on session
    /// stop/restart — there is no TTL inside the daemon.
    tool_cache: RwLock<HashMap<String, Vec<Tool>>>,
}

impl SessionHandle {
    /// Create a fresh record in state Inactive. The stdio env overlay is
    /// resolved here; an unresolved reference fails before anything spawns.
    pub fn new(
        server_name: &str,
        spec: ServerSpec,
        kind: SessionKind,
        session_id: String,
        store: FileStore,
    ) -> Result<Arc<Self>, SessionError> {
        let resolved_env = if spec.is_http() {
            HashMap::new()
        } else {
            spec.resolved_env()?
        };
        let (state_tx, _) = watch::channel(SessionState::Inactive);
        let now = Utc::now();
        Ok(Arc::new(Self {
            server_name: server_name.to_string(),
            session_id,
            kind,
            spec,
            resolved_env,
            store,
            state_tx,
            transport: Mutex::new(None),
            fields: RwLock::new(RecordFields {
                start_time: now,
                last_activity: now,
                error: String::new(),
                pid: 0,
                ever_active: false,
            }),
            tool_cache: RwLock::new(HashMap::new()),
        }))
    }

    /// Rebuild a record from on-disk metadata, preserving its identity.
    pub async fn from_metadata(
        meta: &SessionMetadata,
        store: FileStore,
    ) -> Result<Arc<Self>, SessionError> {
        let handle = Self::new(
            &meta.name,
            meta.config.clone(),
            meta.kind,
            meta.session_id.clone(),
            store,
        )?;
        {
            let mut fields = handle.fields.write().await;
            fields.start_time = meta.start_time;
            fields.last_activity = meta.last_activity;
            // Metadata on disk means the session was Active at some point.
            fields.ever_active = true;
        }
        Ok(handle)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub async fn last_error(&self) -> String {
        self.fields.read().await.error.clone()
    }

    pub async fn pid(&self) -> u32 {
        self.fields.read().await.pid
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.fields.read().await.last_activity
    }

    /// Idle bound from the spec (0 = never reaped).
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(idle_timeout_secs(&self.spec))
    }

    /// Record activity now.
    pub async fn touch(&self) {
        self.fields.write().await.last_activity = Utc::now();
    }

    /// Block until the state is anything other than Starting.
    pub async fn wait_until_settled(&self) {
        let mut rx = self.state_tx.subscribe();
        while *rx.borrow_and_update() == SessionState::Starting {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start the session: spawn/open the transport and gate Active on a
    /// `tools/list` probe. Idempotent on Active; refuses a second concurrent
    /// attempt. Bring-up must finish within the spec timeout capped at 30 s.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.start_with_ceiling(START_CEILING).await
    }

    /// Start with an explicit bring-up ceiling (reattachment probes use the
    /// 10-second health ceiling).
    pub async fn start_with_ceiling(&self, ceiling: Duration) -> Result<(), SessionError> {
        enum Gate {
            Proceed,
            AlreadyActive,
            AlreadyStarting,
        }
        let mut gate = Gate::Proceed;
        self.state_tx.send_if_modified(|state| match *state {
            SessionState::Active => {
                gate = Gate::AlreadyActive;
                false
            }
            SessionState::Starting => {
                gate = Gate::AlreadyStarting;
                false
            }
            _ => {
                *state = SessionState::Starting;
                true
            }
        });
        match gate {
            Gate::AlreadyActive => return Ok(()),
            Gate::AlreadyStarting => {
                return Err(SessionError::AlreadyStarting(self.server_name.clone()))
            }
            Gate::Proceed => {}
        }

        info!("Starting session: {}", self.server_name);
        let deadline = effective_deadline(self.spec.timeout, ceiling);

        match self.bring_up(deadline).await {
            Ok((transport, tools)) => {
                let pid = transport.pid();
                *self.transport.lock().await = Some(transport);
                {
                    let mut fields = self.fields.write().await;
                    let now = Utc::now();
                    fields.start_time = now;
                    fields.last_activity = now;
                    fields.error.clear();
                    fields.pid = pid;
                }
                self.replace_tool_cache(tools).await;

                // A stop may have raced the bring-up; only publish Active if
                // the record is still Starting, otherwise release what we
                // just built.
                let mut activated = false;
                self.state_tx.send_if_modified(|state| {
                    if *state == SessionState::Starting {
                        *state = SessionState::Active;
                        activated = true;
                        true
                    } else {
                        false
                    }
                });
                if !activated {
                    if let Some(transport) = self.transport.lock().await.take() {
                        transport.shutdown().await;
                    }
                    return Err(SessionError::Transport(format!(
                        "session {} was stopped during startup",
                        self.server_name
                    )));
                }

                self.fields.write().await.ever_active = true;
                self.persist().await;
                info!("Session started: {} (pid {pid})", self.server_name);
                Ok(())
            }
            Err(e) => {
                self.record_error(&e).await;
                // Metadata exists only for sessions that were Active at some
                // point; a failed first bring-up leaves nothing to recover.
                if self.fields.read().await.ever_active {
                    self.persist().await;
                }
                warn!("Session {} failed to start: {e}", self.server_name);
                Err(e)
            }
        }
    }

    /// Kind-specific bring-up. The `tools/list` probe doubles as the health
    /// gate; on failure any spawned child is killed before returning.
    async fn bring_up(&self, deadline: Duration) -> Result<(Transport, Vec<Tool>), SessionError> {
        let mut transport = if self.spec.is_http() {
            Transport::Http(HttpTransport::new(&self.spec.url, &self.spec.headers)?)
        } else {
            Transport::Stdio(StdioTransport::spawn(
                &self.spec.command,
                &self.spec.args,
                &self.resolved_env,
            )?)
        };

        match transport.list_tools(deadline).await {
            Ok(tools) => Ok((transport, tools)),
            Err(e) => {
                transport.shutdown().await;
                Err(e)
            }
        }
    }

    /// Forward one `tools/call`. Arguments are validated against the cached
    /// descriptor before any bytes reach the transport; without a cached
    /// descriptor the call passes through unvalidated.
    pub async fn call_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolResult, SessionError> {
        if let Some(descriptor) = self.cached_tool(tool).await {
            descriptor.validate_arguments(args)?;
        }
        self.touch().await;

        let deadline = effective_deadline(self.spec.timeout, CALL_CEILING);
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or_else(|| {
            SessionError::Transport(format!("session {} is no longer active", self.server_name))
        })?;
        let result = transport.call_tool(tool, args, deadline).await;
        drop(guard);

        match result {
            Ok(result) => {
                self.touch().await;
                Ok(result)
            }
            Err(e) => {
                self.fail_on(&e).await;
                Err(e)
            }
        }
    }

    /// Return the tool directory, from cache unless `force`. A cache miss
    /// issues `tools/list` and replaces the cache atomically.
    pub async fn list_tools(&self, force: bool) -> Result<Vec<Tool>, SessionError> {
        if !force {
            let cached = self
                .tool_cache
                .read()
                .await
                .get(TOOL_CACHE_KEY)
                .cloned();
            if let Some(tools) = cached {
                self.touch().await;
                return Ok(tools);
            }
        }

        let deadline = effective_deadline(self.spec.timeout, LIST_CEILING);
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or_else(|| {
            SessionError::Transport(format!("session {} is no longer active", self.server_name))
        })?;
        let result = transport.list_tools(deadline).await;
        drop(guard);

        match result {
            Ok(tools) => {
                self.replace_tool_cache(tools.clone()).await;
                self.touch().await;
                Ok(tools)
            }
            Err(e) => {
                self.fail_on(&e).await;
                Err(e)
            }
        }
    }

    /// Probe liveness. A persistent session with a dead child goes straight
    /// to Stopped; otherwise a `tools/list` under the 10-second ceiling
    /// decides, and failure moves the record to Error.
    pub async fn health_check(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(SessionError::Transport(format!(
                "session {} is not active (status: {state})",
                self.server_name
            )));
        }

        if self.kind == SessionKind::Persistent {
            let pid = self.pid().await;
            if pid > 0 && !process::is_alive(pid) {
                self.teardown(SessionState::Stopped).await;
                self.persist().await;
                return Err(SessionError::Transport(format!(
                    "session process (pid {pid}) is no longer alive"
                )));
            }
        }

        let deadline = effective_deadline(self.spec.timeout, HEALTH_CEILING);
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or_else(|| {
            SessionError::Transport(format!("session {} is no longer active", self.server_name))
        })?;
        let result = transport.list_tools(deadline).await;
        drop(guard);

        match result {
            Ok(_) => {
                self.touch().await;
                Ok(())
            }
            Err(e) => {
                self.record_error(&SessionError::Transport(format!(
                    "health check failed: {e}"
                )))
                .await;
                self.persist().await;
                Err(e)
            }
        }
    }

    /// Stop the session: release the transport, reap any child, clear the
    /// cache. Idempotent on Inactive/Stopped.
    pub async fn stop(&self) {
        let mut proceed = false;
        self.state_tx.send_if_modified(|state| match *state {
            SessionState::Inactive | SessionState::Stopped | SessionState::Stopping => false,
            _ => {
                *state = SessionState::Stopping;
                proceed = true;
                true
            }
        });
        if !proceed {
            return;
        }

        self.teardown(SessionState::Stopped).await;
        info!("Session stopped: {}", self.server_name);
    }

    /// Restart: stop, give the OS a moment, start.
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.stop().await;
        tokio::time::sleep(RESTART_DELAY).await;
        self.start().await
    }

    /// Release the transport and move to `final_state`. The record leaves
    /// Active before the transport is taken, so no reader can observe an
    /// Active record with a nil transport.
    async fn teardown(&self, final_state: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Stopping {
                false
            } else {
                *state = SessionState::Stopping;
                true
            }
        });
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        self.fields.write().await.pid = 0;
        self.tool_cache.write().await.clear();
        let _ = self.state_tx.send(final_state);
    }

    /// Copy out one tool descriptor from the cache.
    async fn cached_tool(&self, name: &str) -> Option<Tool> {
        self.tool_cache
            .read()
            .await
            .get(TOOL_CACHE_KEY)?
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Swap in a fresh tool directory; readers never observe a partial list.
    async fn replace_tool_cache(&self, tools: Vec<Tool>) {
        self.tool_cache
            .write()
            .await
            .insert(TOOL_CACHE_KEY.to_string(), tools);
    }

    async fn record_error(&self, err: &SessionError) {
        self.fields.write().await.error = err.to_string();
        self.state_tx.send_if_modified(|state| match *state {
            SessionState::Stopping | SessionState::Stopped => false,
            _ => {
                *state = SessionState::Error;
                true
            }
        });
    }

    /// State policy after a failed transport operation: transport and
    /// protocol failures move the record to Error; a timeout leaves it
    /// Active (the dirty transport fails the next call, which then lands
    /// here as a Transport error).
    async fn fail_on(&self, err: &SessionError) {
        match err {
            SessionError::Transport(_) | SessionError::Protocol { .. } => {
                self.record_error(err).await;
            }
            _ => {}
        }
    }

    /// Snapshot for status responses.
    pub async fn summary(&self) -> SessionSummary {
        let fields = self.fields.read().await;
        let pid = if fields.pid > 0 { Some(fields.pid) } else { None };
        SessionSummary {
            server_name: self.server_name.clone(),
            status: self.state().to_string(),
            start_time: fields.start_time,
            last_used: fields.last_activity,
            duration: (Utc::now() - fields.start_time)
                .num_nanoseconds()
                .unwrap_or(i64::MAX),
            error: fields.error.clone(),
            pid,
        }
    }

    /// On-disk projection of this record.
    pub async fn metadata(&self) -> SessionMetadata {
        let fields = self.fields.read().await;
        let process_path = if fields.pid > 0 {
            process::executable_path(fields.pid)
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };
        SessionMetadata {
            session_id: self.session_id.clone(),
            name: self.server_name.clone(),
            kind: self.kind,
            status: self.state().to_string(),
            pid: fields.pid,
            process_path,
            start_time: fields.start_time,
            last_activity: fields.last_activity,
            error: fields.error.clone(),
            config: self.spec.clone(),
        }
    }

    /// Mirror the record to disk; failures are logged, never fatal.
    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.metadata().await).await {
            warn!(
                "Failed to save session metadata for {}: {e}",
                self.server_name
            );
        }
    }
}
