//! Session lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, routing to, and
//! destroying MCP sessions. It owns the `server-name → record` map and
//! implements:
//!
//! - **Routing** — a tool call for name N uses the active record, else
//!   attempts reattachment from on-disk metadata, else creates a fresh
//!   record derived from the configured spec.
//! - **Kinds** — persistent and hybrid sessions multiplex calls through one
//!   long-lived worker; stateless sessions open a one-shot transport per
//!   call. A hybrid whose start failed silently degrades to one-shot.
//! - **Sweep** — periodic idle reaping and health probing of persistent
//!   workers, driven by the supervisor loop.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock` held only for lookups and mutations —
//! never across transport I/O. Slow work (bring-up, round-trips, teardown)
//! happens on a cloned `Arc<SessionHandle>` after the lock is dropped;
//! results are reconciled by re-taking the lock. Each worker serializes its
//! own transport internally.

pub mod detection;
pub mod session;
pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{Configuration, ServerSpec};
use crate::error::SessionError;
use crate::mcp::{effective_deadline, HttpTransport, StdioTransport, Tool, ToolResult, Transport};

use detection::{
    detect_kind, should_auto_start, SessionKind, CALL_CEILING, HEALTH_CEILING, LIST_CEILING,
};
use session::{SessionHandle, SessionState, SessionSummary};
use store::FileStore;

/// What a sweep did to a session; returned for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepEvent {
    /// Session exceeded its idle bound and was stopped.
    IdleReaped(String),
    /// A persistent session failed its health probe and was removed.
    HealthFailed(String, String),
}

/// How a request should reach the server.
enum Dispatch {
    /// Through the long-lived worker.
    Worker,
    /// Through a one-shot transport (stateless kind, or degraded hybrid).
    OneShot,
}

/// Manages the pool of MCP sessions.
///
/// Cloneable — all clones share the same registry and store.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    store: FileStore,
    /// Server catalog loaded at daemon start; specs are immutable snapshots
    /// (reconfiguration is stop + recreate).
    catalog: Arc<Configuration>,
    max_sessions: usize,
    /// Set once daemon shutdown begins; new work is refused cleanly.
    shutting_down: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(store: FileStore, catalog: Configuration, max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            catalog: Arc::new(catalog),
            max_sessions,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Refuse new sessions and calls from here on; existing ones are torn
    /// down by the caller via [`Self::stop_all`].
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn check_shutdown(&self) -> Result<(), SessionError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SessionError::Shutdown);
        }
        Ok(())
    }

    /// Startup pass: prune invalid/stale metadata, then eagerly start every
    /// configured server that wants auto-start.
    pub async fn recover_and_autostart(&self) {
        self.store.recover().await;

        for (name, spec) in &self.catalog.mcp_servers {
            if spec.enabled && !spec.is_http() && should_auto_start(spec) {
                if let Err(e) = self.start_session(name, spec.clone()).await {
                    warn!("Auto-start of session {name} failed: {e}");
                }
            }
        }
    }

    /// Explicit start. Creates (or reuses) the record and brings it up in
    /// the background; concurrent tool calls await the outcome. Idempotent
    /// on Active, refuses while Starting.
    pub async fn start_session(&self, name: &str, spec: ServerSpec) -> Result<(), SessionError> {
        self.check_shutdown()?;
        spec.validate()?;

        let handle = {
            let mut sessions = self.sessions.write().await;

            if let Some(existing) = sessions.get(name) {
                match existing.state() {
                    SessionState::Active => return Ok(()),
                    SessionState::Starting => {
                        return Err(SessionError::AlreadyStarting(name.to_string()))
                    }
                    _ => {}
                }
                if *existing.spec() == spec {
                    Arc::clone(existing)
                } else {
                    // Spec changed: the snapshot is immutable, so recreate.
                    let stale = sessions.remove(name);
                    drop(sessions);
                    if let Some(stale) = stale {
                        stale.stop().await;
                        let _ = self.store.delete(stale.session_id()).await;
                    }
                    let handle = self.fresh_handle(name, spec)?;
                    let mut sessions = self.sessions.write().await;
                    if sessions.contains_key(name) {
                        // Someone recreated the record while we were tearing
                        // the old one down; let theirs win.
                        return Err(SessionError::AlreadyStarting(name.to_string()));
                    }
                    sessions.insert(name.to_string(), Arc::clone(&handle));
                    handle
                }
            } else {
                if sessions.len() >= self.max_sessions {
                    return Err(SessionError::Config(format!(
                        "session limit reached (max {})",
                        self.max_sessions
                    )));
                }
                let handle = self.fresh_handle(name, spec)?;
                sessions.insert(name.to_string(), Arc::clone(&handle));
                handle
            }
        };

        // Bring-up happens off the control handler; failures land in the
        // record's state and metadata.
        tokio::spawn(async move {
            let _ = handle.start().await;
        });

        Ok(())
    }

    fn fresh_handle(&self, name: &str, spec: ServerSpec) -> Result<Arc<SessionHandle>, SessionError> {
        let kind = detect_kind(&spec);
        let session_id = self.store.generate_session_id(name);
        SessionHandle::new(name, spec, kind, session_id, self.store.clone())
    }

    /// Look up a live record.
    pub async fn get(&self, name: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(name).map(Arc::clone)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot summaries of every record.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().map(Arc::clone).collect();
        let mut items = Vec::with_capacity(handles.len());
        for handle in handles {
            items.push(handle.summary().await);
        }
        items
    }

    /// Stop one session, remove it from the registry, and unlink its
    /// metadata. Unknown names are an error; a record that is already
    /// Inactive/Stopped stops idempotently.
    pub async fn stop_session(&self, name: &str) -> Result<(), SessionError> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(name)
                .ok_or_else(|| SessionError::NotFound(format!("session not found: {name}")))?
        };

        handle.stop().await;
        self.store.delete(handle.session_id()).await?;
        Ok(())
    }

    /// Stop every session. Per-session errors are collected, never abort
    /// the sweep.
    pub async fn stop_all(&self) -> Vec<(String, SessionError)> {
        let drained: Vec<(String, Arc<SessionHandle>)> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };

        let mut errors = Vec::new();
        for (name, handle) in drained {
            handle.stop().await;
            if let Err(e) = self.store.delete(handle.session_id()).await {
                errors.push((name, e));
            }
        }
        errors
    }

    /// List tools for a server, routing through the session policy.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<Tool>, SessionError> {
        let handle = self.ensure_session(name, None).await?;
        match self.ensure_active(&handle).await? {
            Dispatch::Worker => handle.list_tools(false).await,
            Dispatch::OneShot => self.one_shot(handle.spec(), LIST_CEILING, |t, d| async move {
                let mut t = t;
                t.list_tools(d).await.map(|tools| (t, tools))
            })
            .await,
        }
    }

    /// Call a tool on a server, routing through the session policy.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolResult, SessionError> {
        let handle = self.ensure_session(name, None).await?;
        match self.ensure_active(&handle).await? {
            Dispatch::Worker => handle.call_tool(tool, args).await,
            Dispatch::OneShot => {
                let tool = tool.to_string();
                let args = args.clone();
                self.one_shot(handle.spec(), CALL_CEILING, move |t, d| async move {
                    let mut t = t;
                    t.call_tool(&tool, &args, d).await.map(|r| (t, r))
                })
                .await
            }
        }
    }

    /// Find or create the record for `name`, consulting on-disk metadata
    /// before falling back to a fresh record. `spec_override` lets the
    /// start route carry an explicit spec; otherwise the catalog is used.
    pub async fn ensure_session(
        &self,
        name: &str,
        spec_override: Option<ServerSpec>,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        self.check_shutdown()?;
        if let Some(handle) = self.get(name).await {
            return Ok(handle);
        }

        let spec = match spec_override {
            Some(spec) => spec,
            None => self
                .catalog
                .enabled_server(name)
                .cloned()
                .ok_or_else(|| SessionError::NotFound(format!("session not found: {name}")))?,
        };
        spec.validate()?;

        // Reattachment: compatible on-disk metadata may resurrect the
        // session without respawning anything.
        let recovered = match self.store.find_reattachable(name, &spec).await {
            Ok(found) => found,
            Err(SessionError::Invalidated(reason)) => {
                info!("Discarded stale session metadata for {name}: {reason}");
                None
            }
            Err(e) => return Err(e),
        };

        let handle = match recovered {
            Some(meta)
                if meta.config.is_http() && detect_kind(&spec) != SessionKind::Stateless =>
            {
                info!(
                    "Reattaching to session {} via {}",
                    meta.session_id, meta.config.url
                );
                let handle = SessionHandle::from_metadata(&meta, self.store.clone()).await?;
                // A fresh transport plus a probe under the health ceiling;
                // success goes straight to Active without respawning.
                match handle.start_with_ceiling(HEALTH_CEILING).await {
                    Ok(()) => handle,
                    Err(e) => {
                        info!("Reattachment probe failed for {}: {e}", meta.session_id);
                        let _ = self.store.delete(&meta.session_id).await;
                        self.fresh_handle(name, spec)?
                    }
                }
            }
            Some(meta) => {
                // Stdio reattachment is unsupported (the old process is not
                // inherited); the metadata only told us a session existed.
                info!(
                    "Superseding session metadata {} with a fresh session",
                    meta.session_id
                );
                let _ = self.store.delete(&meta.session_id).await;
                self.fresh_handle(name, spec)?
            }
            None => self.fresh_handle(name, spec)?,
        };

        let mut sessions = self.sessions.write().await;
        if let Some(raced) = sessions.get(name) {
            // Another handler created the record first; theirs wins.
            return Ok(Arc::clone(raced));
        }
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::Config(format!(
                "session limit reached (max {})",
                self.max_sessions
            )));
        }
        sessions.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Drive a record to Active (implicitly starting persistent/hybrid
    /// kinds) and decide how to dispatch. Stateless records never hold a
    /// transport; hybrid records degrade to one-shot when their start
    /// fails.
    async fn ensure_active(&self, handle: &Arc<SessionHandle>) -> Result<Dispatch, SessionError> {
        if handle.kind() == SessionKind::Stateless {
            handle.touch().await;
            return Ok(Dispatch::OneShot);
        }

        // Two rounds cover the lost-the-start-race case.
        for _ in 0..2 {
            handle.wait_until_settled().await;
            match handle.state() {
                SessionState::Active => return Ok(Dispatch::Worker),
                SessionState::Inactive | SessionState::Stopped => {
                    match handle.start().await {
                        Ok(()) => return Ok(Dispatch::Worker),
                        Err(SessionError::AlreadyStarting(_)) => {} // raced; wait again
                        Err(e) => return self.degrade_or(handle, e),
                    }
                }
                SessionState::Error => {
                    let stored = handle.last_error().await;
                    return self.degrade_or(handle, SessionError::Transport(stored));
                }
                SessionState::Stopping => {
                    return Err(SessionError::Transport(format!(
                        "session {} is no longer active",
                        handle.server_name()
                    )))
                }
                SessionState::Starting => {} // settled loop races are rare; retry
            }
        }

        Err(SessionError::Transport(format!(
            "session {} did not settle",
            handle.server_name()
        )))
    }

    /// Hybrid sessions degrade silently to one-shot dispatch; everything
    /// else surfaces the error.
    fn degrade_or(
        &self,
        handle: &Arc<SessionHandle>,
        err: SessionError,
    ) -> Result<Dispatch, SessionError> {
        if handle.kind() == SessionKind::Hybrid {
            warn!(
                "Hybrid session {} degrading to stateless: {err}",
                handle.server_name()
            );
            Ok(Dispatch::OneShot)
        } else {
            Err(err)
        }
    }

    /// Open a transport, run one operation, tear the transport down.
    async fn one_shot<F, Fut, T>(
        &self,
        spec: &ServerSpec,
        ceiling: std::time::Duration,
        op: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(Transport, std::time::Duration) -> Fut,
        Fut: std::future::Future<Output = Result<(Transport, T), SessionError>>,
    {
        let transport = if spec.is_http() {
            Transport::Http(HttpTransport::new(&spec.url, &spec.headers)?)
        } else {
            let env = spec.resolved_env()?;
            Transport::Stdio(StdioTransport::spawn(&spec.command, &spec.args, &env)?)
        };

        let deadline = effective_deadline(spec.timeout, ceiling);
        match op(transport, deadline).await {
            Ok((transport, result)) => {
                transport.shutdown().await;
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    /// One supervisor tick: reap idle sessions, then health-probe the
    /// persistent ones. Per-session errors are logged and ignored.
    pub async fn sweep(&self) -> Vec<SweepEvent> {
        let snapshot: Vec<(String, Arc<SessionHandle>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
                .collect()
        };

        let mut events = Vec::new();
        let now = Utc::now();

        for (name, handle) in snapshot {
            if handle.state() != SessionState::Active {
                continue;
            }

            let idle_timeout = handle.idle_timeout();
            if !idle_timeout.is_zero() {
                let idle = (now - handle.last_activity().await)
                    .to_std()
                    .unwrap_or_default();
                if idle > idle_timeout {
                    info!("Reaping idle session: {name} (idle {}s)", idle.as_secs());
                    self.remove_and_stop(&name, &handle).await;
                    events.push(SweepEvent::IdleReaped(name));
                    continue;
                }
            }

            if handle.kind() == SessionKind::Persistent {
                if let Err(e) = handle.health_check().await {
                    warn!("Health check failed for session {name}: {e}");
                    self.remove_and_stop(&name, &handle).await;
                    events.push(SweepEvent::HealthFailed(name, e.to_string()));
                }
            }
        }

        events
    }

    /// Remove a specific record (guarding against a replacement racing in)
    /// and release its resources.
    async fn remove_and_stop(&self, name: &str, handle: &Arc<SessionHandle>) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(current) = sessions.get(name) {
                if Arc::ptr_eq(current, handle) {
                    sessions.remove(name);
                }
            }
        }
        handle.stop().await;
        if let Err(e) = self.store.delete(handle.session_id()).await {
            warn!("Failed to delete metadata for {name}: {e}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    use super::store::SessionMetadata;

    /// Answers every stdin line with an empty tool directory.
    const ECHO_SCRIPT: &str = r#"while read line; do printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'; done"#;

    /// Answers only the first line, then stays alive but silent.
    const ANSWER_ONCE_SCRIPT: &str = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'; while read line; do :; done"#;

    /// Answers the first line with a schema-carrying descriptor, then goes
    /// silent.
    const SCHEMA_ONCE_SCRIPT: &str = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"t","inputSchema":{"required":["q"],"additionalProperties":false,"properties":{"q":{}}}}]}}'; while read line; do :; done"#;

    fn sh_spec(script: &str) -> ServerSpec {
        let mut spec = ServerSpec {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout: 2,
            ..ServerSpec::default()
        };
        spec.session.kind = "persistent".into();
        spec
    }

    fn manager_with(servers: Vec<(&str, ServerSpec)>) -> (TempDir, SessionManager) {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::new(dir.path().join("sessions"));
        let mut catalog = Configuration::default();
        for (name, spec) in servers {
            catalog.mcp_servers.insert(name.to_string(), spec);
        }
        let manager = SessionManager::new(store, catalog, 10);
        (dir, manager)
    }

    async fn wait_for_state(handle: &Arc<SessionHandle>, wanted: SessionState) {
        for _ in 0..100 {
            if handle.state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "session {} never reached {wanted}, stuck at {}",
            handle.server_name(),
            handle.state()
        );
    }

    async fn spawn_http_fixture(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve fixture");
        });
        format!("http://{addr}/mcp")
    }

    #[tokio::test]
    async fn test_start_session_is_idempotent_when_active() {
        let (_dir, manager) = manager_with(vec![("x", sh_spec(ECHO_SCRIPT))]);
        manager
            .start_session("x", sh_spec(ECHO_SCRIPT))
            .await
            .expect("first start");
        let handle = manager.get("x").await.expect("record");
        wait_for_state(&handle, SessionState::Active).await;

        manager
            .start_session("x", sh_spec(ECHO_SCRIPT))
            .await
            .expect("idempotent start");
        let same = manager.get("x").await.expect("record");
        assert!(Arc::ptr_eq(&handle, &same));
        assert_eq!(same.state(), SessionState::Active);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_start_while_starting_is_refused() {
        let slow = sh_spec(
            r#"read line; sleep 1; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'; while read line; do :; done"#,
        );
        let (_dir, manager) = manager_with(vec![("x", slow.clone())]);
        manager.start_session("x", slow.clone()).await.expect("start");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = manager.start_session("x", slow).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarting(_)));

        let handle = manager.get("x").await.expect("record");
        wait_for_state(&handle, SessionState::Active).await;
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_list_tools_is_served_from_cache_after_probe() {
        // The fixture answers exactly one request — the bring-up probe. Both
        // list calls succeeding proves they never hit the transport again.
        let (_dir, manager) = manager_with(vec![("x", sh_spec(ANSWER_ONCE_SCRIPT))]);

        let tools = manager.list_tools("x").await.expect("first list");
        assert!(tools.is_empty());
        let tools = manager.list_tools("x").await.expect("cached list");
        assert!(tools.is_empty());

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_argument_validation_never_reaches_the_transport() {
        // The fixture only ever answers the probe; a tools/call would hang
        // until the 2 s deadline. Immediate failures prove no bytes moved.
        let (_dir, manager) = manager_with(vec![("x", sh_spec(SCHEMA_ONCE_SCRIPT))]);
        manager.list_tools("x").await.expect("seed cache");

        let started = std::time::Instant::now();
        let err = manager
            .call_tool("x", "t", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::Config("missing required argument: q".into())
        );

        let mut args = Map::new();
        args.insert("q".into(), json!("x"));
        args.insert("extra".into(), json!(1));
        let err = manager.call_tool("x", "t", &args).await.unwrap_err();
        assert_eq!(err, SessionError::Config("unknown argument: extra".into()));
        assert!(started.elapsed() < Duration::from_millis(500));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_idle_session_is_reaped_and_metadata_unlinked() {
        let mut spec = sh_spec(ECHO_SCRIPT);
        spec.session.max_idle = Some(1);
        let (_dir, manager) = manager_with(vec![("x", spec.clone())]);

        manager.start_session("x", spec).await.expect("start");
        let handle = manager.get("x").await.expect("record");
        wait_for_state(&handle, SessionState::Active).await;
        assert!(manager.store().load_by_name("x").await.is_some());

        tokio::time::sleep(Duration::from_millis(1300)).await;
        let events = manager.sweep().await;
        assert_eq!(events, vec![SweepEvent::IdleReaped("x".into())]);
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(manager.get("x").await.is_none());
        assert!(manager.store().load_by_name("x").await.is_none());
    }

    #[tokio::test]
    async fn test_zero_idle_timeout_is_never_reaped() {
        let mut spec = sh_spec(ECHO_SCRIPT);
        spec.session.max_idle = Some(0);
        let (_dir, manager) = manager_with(vec![("x", spec.clone())]);

        manager.start_session("x", spec).await.expect("start");
        let handle = manager.get("x").await.expect("record");
        wait_for_state(&handle, SessionState::Active).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let events = manager.sweep().await;
        assert!(events.is_empty());
        assert_eq!(handle.state(), SessionState::Active);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_stop_and_call_settle_cleanly() {
        let (_dir, manager) = manager_with(vec![("a", sh_spec(ECHO_SCRIPT))]);
        manager
            .start_session("a", sh_spec(ECHO_SCRIPT))
            .await
            .expect("start");
        let handle = manager.get("a").await.expect("record");
        wait_for_state(&handle, SessionState::Active).await;

        let empty_args = Map::new();
        let (call, stop) = tokio::join!(
            handle.call_tool("t", &empty_args),
            manager.stop_session("a"),
        );
        stop.expect("stop succeeds");

        match call {
            Ok(_) => {}
            Err(SessionError::Transport(_)) => {}
            Err(other) => panic!("unexpected call outcome: {other:?}"),
        }
        assert!(manager.get("a").await.is_none());
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stateless_http_lists_are_fresh_posts() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_handler = Arc::clone(&hits);
        let router = Router::new().route(
            "/mcp",
            post(move || {
                let hits = Arc::clone(&hits_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "result": {"tools": [{"name": "echo"}]}
                    }))
                }
            }),
        );
        let url = spawn_http_fixture(router).await;

        let spec = ServerSpec {
            kind: "http".into(),
            url,
            timeout: 5,
            ..ServerSpec::default()
        };
        let (_dir, manager) = manager_with(vec![("y", spec)]);

        for _ in 0..2 {
            let tools = manager.list_tools("y").await.expect("list");
            assert_eq!(tools.len(), 1);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_http_reattachment_preserves_session_identity() {
        let router = Router::new().route(
            "/mcp",
            post(|| async {
                Json(json!({"jsonrpc":"2.0","id":1,"result":{"tools":[]}}))
            }),
        );
        let url = spawn_http_fixture(router).await;

        let mut spec = ServerSpec {
            kind: "http".into(),
            url,
            timeout: 5,
            ..ServerSpec::default()
        };
        spec.session.kind = "persistent".into();
        let (_dir, manager) = manager_with(vec![("y", spec.clone())]);

        let meta = SessionMetadata {
            session_id: manager.store().generate_session_id("y"),
            name: "y".into(),
            kind: SessionKind::Persistent,
            status: "active".into(),
            pid: 0,
            process_path: String::new(),
            start_time: Utc::now(),
            last_activity: Utc::now(),
            error: String::new(),
            config: spec,
        };
        manager.store().save(&meta).await.expect("seed metadata");

        manager.list_tools("y").await.expect("list via reattach");
        let handle = manager.get("y").await.expect("record");
        assert_eq!(handle.session_id(), meta.session_id);
        assert_eq!(handle.state(), SessionState::Active);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_mismatched_metadata_is_invalidated() {
        let router = Router::new().route(
            "/mcp",
            post(|| async {
                Json(json!({"jsonrpc":"2.0","id":1,"result":{"tools":[]}}))
            }),
        );
        let url = spawn_http_fixture(router).await;

        let mut catalog_spec = ServerSpec {
            kind: "http".into(),
            url,
            timeout: 5,
            ..ServerSpec::default()
        };
        catalog_spec.session.kind = "persistent".into();
        let (_dir, manager) = manager_with(vec![("y", catalog_spec)]);

        let mut stale_spec = ServerSpec {
            kind: "http".into(),
            url: "http://127.0.0.1:1/mcp".into(),
            ..ServerSpec::default()
        };
        stale_spec.session.kind = "persistent".into();
        let meta = SessionMetadata {
            session_id: manager.store().generate_session_id("y"),
            name: "y".into(),
            kind: SessionKind::Persistent,
            status: "active".into(),
            pid: 0,
            process_path: String::new(),
            start_time: Utc::now(),
            last_activity: Utc::now(),
            error: String::new(),
            config: stale_spec,
        };
        manager.store().save(&meta).await.expect("seed metadata");

        manager.list_tools("y").await.expect("fresh session");
        let handle = manager.get("y").await.expect("record");
        assert_ne!(handle.session_id(), meta.session_id);
        assert!(manager.store().load(&meta.session_id).await.is_err());

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stdio_reattachment_supersedes_metadata() {
        let spec = sh_spec(ECHO_SCRIPT);
        let (_dir, manager) = manager_with(vec![("z", spec.clone())]);

        let meta = SessionMetadata {
            session_id: manager.store().generate_session_id("z"),
            name: "z".into(),
            kind: SessionKind::Persistent,
            status: "stopped".into(),
            pid: 0,
            process_path: String::new(),
            start_time: Utc::now(),
            last_activity: Utc::now(),
            error: String::new(),
            config: spec,
        };
        manager.store().save(&meta).await.expect("seed metadata");

        let handle = manager.ensure_session("z", None).await.expect("record");
        assert_ne!(handle.session_id(), meta.session_id);
        assert!(manager.store().load(&meta.session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_hybrid_degrades_to_one_shot_after_failed_start() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("marker");
        let script = r#"if [ -e "$MCPD_MARKER" ]; then while read line; do printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'; done; else exit 1; fi"#;
        let mut spec = ServerSpec {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout: 2,
            ..ServerSpec::default()
        };
        spec.env.insert(
            "MCPD_MARKER".into(),
            marker.display().to_string(),
        );
        spec.session.kind = "hybrid".into();
        let (_store_dir, manager) = manager_with(vec![("h", spec)]);

        // First call: persistent start fails (no marker), degrade path also
        // fails for the same reason. The session was never Active, so no
        // metadata may hit the disk.
        assert!(manager.list_tools("h").await.is_err());
        let handle = manager.get("h").await.expect("record");
        assert_eq!(handle.state(), SessionState::Error);
        assert!(manager.store().load_by_name("h").await.is_none());

        // Once the server is healthy again the degraded one-shot path works
        // without a successful persistent start.
        std::fs::write(&marker, b"").expect("create marker");
        let tools = manager.list_tools("h").await.expect("degraded list");
        assert!(tools.is_empty());
        assert_eq!(handle.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_failed_first_start_writes_no_metadata() {
        // A session that never reached Active must leave nothing to recover:
        // its Error state lives only in memory.
        let spec = sh_spec("exit 1");
        let (_dir, manager) = manager_with(vec![("x", spec.clone())]);

        manager.start_session("x", spec).await.expect("start accepted");
        let handle = manager.get("x").await.expect("record");
        wait_for_state(&handle, SessionState::Error).await;

        assert!(manager.store().load_by_name("x").await.is_none());

        // A call against the Error record fails with the stored diagnostic
        // and still writes nothing.
        let err = manager.list_tools("x").await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert!(manager.store().load_by_name("x").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_server_is_not_found() {
        let (_dir, manager) = manager_with(vec![]);
        let err = manager
            .call_tool("nope", "t", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_disabled_server_is_not_found() {
        let mut spec = sh_spec(ECHO_SCRIPT);
        spec.enabled = false;
        let (_dir, manager) = manager_with(vec![("x", spec)]);
        let err = manager.list_tools("x").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_registry_holds_one_record_per_name() {
        let (_dir, manager) = manager_with(vec![("x", sh_spec(ECHO_SCRIPT))]);
        let first = manager.ensure_session("x", None).await.expect("first");
        let second = manager.ensure_session("x", None).await.expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_session_is_not_found() {
        let (_dir, manager) = manager_with(vec![]);
        let err = manager.stop_session("ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_all_clears_registry_and_metadata() {
        let (_dir, manager) = manager_with(vec![
            ("a", sh_spec(ECHO_SCRIPT)),
            ("b", sh_spec(ECHO_SCRIPT)),
        ]);
        for name in ["a", "b"] {
            manager
                .start_session(name, sh_spec(ECHO_SCRIPT))
                .await
                .expect("start");
            let handle = manager.get(name).await.expect("record");
            wait_for_state(&handle, SessionState::Active).await;
        }

        let errors = manager.stop_all().await;
        assert!(errors.is_empty());
        assert_eq!(manager.session_count().await, 0);
        assert!(manager.store().load_by_name("a").await.is_none());
        assert!(manager.store().load_by_name("b").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let (_dir, manager) = manager_with(vec![("x", sh_spec(ECHO_SCRIPT))]);
        manager.begin_shutdown();

        let err = manager.list_tools("x").await.unwrap_err();
        assert_eq!(err, SessionError::Shutdown);
        let err = manager
            .start_session("x", sh_spec(ECHO_SCRIPT))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Shutdown);
    }

    #[tokio::test]
    async fn test_session_limit_is_enforced() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::new(dir.path().join("sessions"));
        let mut catalog = Configuration::default();
        catalog
            .mcp_servers
            .insert("a".to_string(), sh_spec(ECHO_SCRIPT));
        catalog
            .mcp_servers
            .insert("b".to_string(), sh_spec(ECHO_SCRIPT));
        let manager = SessionManager::new(store, catalog, 1);

        manager.ensure_session("a", None).await.expect("first");
        let err = manager.ensure_session("b", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }
}
