//! On-disk session metadata store.
//!
//! One pretty-printed JSON document per session under
//! `<config-dir>/sessions/<session-id>.json`. Writes go through a temp file
//! and a rename so readers see either the old record or the new one, never
//! a torn one. The store is what makes idle sessions recoverable across a
//! daemon restart: metadata that still matches an incoming spec, whose
//! recorded process (if any) is alive and whose executable is compatible,
//! is offered for reattachment; everything else is deleted on sight.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use super::detection::SessionKind;
use crate::config::ServerSpec;
use crate::error::SessionError;
use crate::process;

/// Metadata older than this is dropped by the recovery pass.
const STALE_AFTER: Duration = Duration::from_secs(24 * 3600);
/// Error-state metadata gets a shorter retention.
const STALE_ERROR_AFTER: Duration = Duration::from_secs(3600);

/// The on-disk projection of a session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub name: String,
    pub kind: SessionKind,
    pub status: String,
    #[serde(default, skip_serializing_if = "pid_is_zero")]
    pub pid: u32,
    #[serde(rename = "processPath", default, skip_serializing_if = "String::is_empty")]
    pub process_path: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub config: ServerSpec,
}

fn pid_is_zero(pid: &u32) -> bool {
    *pid == 0
}

/// File-based session persistence. Cloneable; clones share the directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    sessions_dir: PathBuf,
}

impl FileStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    /// Generate a unique session id:
    /// `<name>-<yyyy-mm-dd-hh-mm-ss>-<6 lowercase alphanumerics>`.
    pub fn generate_session_id(&self, server_name: &str) -> String {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let suffix: String = (0..6)
            .map(|_| CHARSET[OsRng.gen_range(0..CHARSET.len())] as char)
            .collect();
        format!(
            "{server_name}-{}-{suffix}",
            Utc::now().format("%Y-%m-%d-%H-%M-%S")
        )
    }

    /// Write a record atomically (temp file + rename).
    pub async fn save(&self, meta: &SessionMetadata) -> Result<(), SessionError> {
        fs::create_dir_all(&self.sessions_dir).await.map_err(|e| {
            SessionError::Transport(format!("failed to create sessions directory: {e}"))
        })?;

        let data = serde_json::to_vec_pretty(meta)
            .map_err(|e| SessionError::Transport(format!("failed to encode metadata: {e}")))?;

        let path = self.path_for(&meta.session_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data)
            .await
            .map_err(|e| SessionError::Transport(format!("failed to write metadata: {e}")))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SessionError::Transport(format!("failed to commit metadata: {e}")))?;
        Ok(())
    }

    /// Load one record by session id.
    pub async fn load(&self, session_id: &str) -> Result<SessionMetadata, SessionError> {
        let path = self.path_for(session_id);
        let data = fs::read_to_string(&path)
            .await
            .map_err(|_| SessionError::NotFound(format!("session file not found: {session_id}")))?;
        serde_json::from_str(&data)
            .map_err(|e| SessionError::Transport(format!("failed to parse {session_id}: {e}")))
    }

    /// All parseable records on disk. Unreadable files are skipped.
    pub async fn list(&self) -> Vec<SessionMetadata> {
        let mut records = Vec::new();
        let Ok(mut read_dir) = fs::read_dir(&self.sessions_dir).await else {
            return records;
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<SessionMetadata>(&data) {
                Ok(meta) => records.push(meta),
                Err(e) => warn!("Skipping unparseable session file {}: {e}", path.display()),
            }
        }
        records
    }

    /// Most recent record for a server name, if any.
    pub async fn load_by_name(&self, server_name: &str) -> Option<SessionMetadata> {
        self.list()
            .await
            .into_iter()
            .filter(|m| m.name == server_name)
            .max_by_key(|m| m.last_activity)
    }

    /// Remove a record. Missing files are fine.
    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        match fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Transport(format!(
                "failed to delete session file: {e}"
            ))),
        }
    }

    /// Check that a record is still worth recovering: required fields
    /// present, and for records stored Active with a pid, the process is
    /// alive and its executable is compatible with the recorded one.
    pub fn validate(&self, meta: &SessionMetadata) -> Result<(), SessionError> {
        if meta.name.is_empty() {
            return Err(SessionError::Invalidated("session name is required".into()));
        }
        if meta.session_id.is_empty() {
            return Err(SessionError::Invalidated("session id is required".into()));
        }

        if meta.status == "active" && meta.pid > 0 {
            if !process::is_alive(meta.pid) {
                return Err(SessionError::Invalidated(format!(
                    "session process (pid {}) is no longer alive",
                    meta.pid
                )));
            }
            if !meta.process_path.is_empty() {
                if let Some(actual) = process::executable_path(meta.pid) {
                    if !process::executables_compatible(&meta.process_path, &actual) {
                        return Err(SessionError::Invalidated(format!(
                            "process executable mismatch: expected {}, got {}",
                            meta.process_path,
                            actual.display()
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Whether an on-disk spec snapshot is compatible with an incoming spec.
    /// HTTP: identical base URLs. Stdio: identical command and argv.
    pub fn spec_compatible(existing: &ServerSpec, incoming: &ServerSpec) -> bool {
        if existing.is_http() && incoming.is_http() {
            return existing.url == incoming.url;
        }
        if !existing.command.is_empty() && !incoming.command.is_empty() {
            return existing.command == incoming.command && existing.args == incoming.args;
        }
        false
    }

    /// Find a record for `server_name` that can be reattached to under the
    /// incoming spec. A mismatched or invalid record is deleted and surfaced
    /// as [`SessionError::Invalidated`] so the caller falls through to fresh
    /// creation.
    pub async fn find_reattachable(
        &self,
        server_name: &str,
        incoming: &ServerSpec,
    ) -> Result<Option<SessionMetadata>, SessionError> {
        let Some(meta) = self.load_by_name(server_name).await else {
            return Ok(None);
        };

        if !Self::spec_compatible(&meta.config, incoming) {
            let _ = self.delete(&meta.session_id).await;
            return Err(SessionError::Invalidated(
                "server configuration mismatch".into(),
            ));
        }

        if let Err(e) = self.validate(&meta) {
            let _ = self.delete(&meta.session_id).await;
            return Err(e);
        }

        Ok(Some(meta))
    }

    /// Startup recovery pass: drop records that are invalid or stale, keep
    /// the rest on disk for on-demand reattachment.
    pub async fn recover(&self) {
        let records = self.list().await;
        if records.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut valid = 0usize;
        let mut removed = 0usize;

        for meta in records {
            let age = (now - meta.last_activity)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let stale = if meta.status == "error" {
                age > STALE_ERROR_AFTER
            } else {
                age > STALE_AFTER
            };

            if stale || self.validate(&meta).is_err() {
                removed += 1;
                if let Err(e) = self.delete(&meta.session_id).await {
                    warn!("Failed to delete invalid session {}: {e}", meta.session_id);
                }
            } else {
                valid += 1;
            }
        }

        info!("Session recovery: {valid} valid record(s) kept, {removed} removed");
    }
}
