//! Configuration loading and defaults.
//!
//! Two JSON documents live under the per-user config directory
//! (`~/.config/mcpd` on Linux):
//!
//! - `mcp_servers.json` — the server catalog: a top-level `mcpServers`
//!   mapping from name to [`ServerSpec`].
//! - `daemon.json` — optional daemon knobs ([`DaemonConfig`]); compiled
//!   defaults apply when the file is absent or invalid.
//!
//! `${VAR}` and `$VAR` tokens inside `url`, `command`, `args`, and header
//! values are expanded from the daemon's environment at load time; unknown
//! references are left untouched. The stdio `env` overlay is kept raw and
//! expanded at session creation, where an unresolved reference is a hard
//! error raised before any process is spawned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// The MCP server catalog, deserialized from `mcp_servers.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, ServerSpec>,
}

/// Immutable description of how to reach one MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSpec {
    /// Transport kind: `"http"` or empty for stdio.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Base URL for http transports.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Command for stdio transports.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// Argument vector for stdio transports.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment overlay for the spawned child (stdio only). Values may
    /// contain `${VAR}` references resolved at session creation.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Header overlay for http transports.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds. 0 means "apply the hard ceiling".
    #[serde(skip_serializing_if = "is_zero")]
    pub timeout: u64,
    /// Hint that this server should get a persistent session.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub persistent: bool,
    /// Disabled servers are invisible to the routing policy.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Session behavior overrides; an explicit `type` here always wins over
    /// the derived kind.
    #[serde(skip_serializing_if = "SessionOverrides::is_empty")]
    pub session: SessionOverrides,
}

/// Per-server session policy overrides (`session` sub-object).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOverrides {
    /// `"persistent"`, `"stateless"`, `"hybrid"`, or empty (derive).
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "autoStart", skip_serializing_if = "std::ops::Not::not")]
    pub auto_start: bool,
    /// Session timeout in seconds (reserved; the request deadline comes from
    /// the spec-level `timeout`).
    #[serde(skip_serializing_if = "is_zero")]
    pub timeout: u64,
    /// Idle seconds before the supervisor reaps the session. `Some(0)` means
    /// never reap; `None` applies the per-kind default.
    #[serde(rename = "maxIdle", skip_serializing_if = "Option::is_none")]
    pub max_idle: Option<u64>,
    #[serde(rename = "healthCheck", skip_serializing_if = "std::ops::Not::not")]
    pub health_check: bool,
}

impl SessionOverrides {
    fn is_empty(&self) -> bool {
        self.kind.is_empty()
            && !self.auto_start
            && self.timeout == 0
            && self.max_idle.is_none()
            && !self.health_check
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn default_enabled() -> bool {
    true
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            kind: String::new(),
            url: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            headers: HashMap::new(),
            timeout: 0,
            persistent: false,
            enabled: true,
            description: String::new(),
            session: SessionOverrides::default(),
        }
    }
}

impl ServerSpec {
    /// Whether this spec describes an HTTP transport.
    pub fn is_http(&self) -> bool {
        self.kind == "http" || !self.url.is_empty()
    }

    /// Validate that the spec names a reachable transport.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.kind == "http" && self.url.is_empty() {
            return Err(SessionError::Config(
                "HTTP server type requires url".into(),
            ));
        }
        if !self.is_http() && self.command.is_empty() {
            return Err(SessionError::Config(
                "server must have either url (for http) or command (for stdio)".into(),
            ));
        }
        Ok(())
    }

    /// Expand `${VAR}`/`$VAR` references in url, command, args, and headers
    /// from the daemon environment, leaving unknown references untouched.
    /// The stdio `env` overlay is deliberately not expanded here.
    pub fn expand(&mut self) {
        self.url = expand_lenient(&self.url);
        self.command = expand_lenient(&self.command);
        for arg in &mut self.args {
            *arg = expand_lenient(arg);
        }
        for value in self.headers.values_mut() {
            *value = expand_lenient(value);
        }
    }

    /// Resolve the stdio environment overlay against the daemon environment.
    /// An unresolved reference is a [`SessionError::Config`], raised before
    /// any process is spawned.
    pub fn resolved_env(&self) -> Result<HashMap<String, String>, SessionError> {
        let mut resolved = HashMap::with_capacity(self.env.len());
        for (key, value) in &self.env {
            let expanded = shellexpand::env(value).map_err(|e| {
                SessionError::Config(format!(
                    "unresolved environment variable in env.{key}: {e}"
                ))
            })?;
            resolved.insert(key.clone(), expanded.into_owned());
        }
        Ok(resolved)
    }
}

/// Expand environment references, keeping unknown variables as written.
fn expand_lenient(input: &str) -> String {
    shellexpand::env_with_context_no_errors(input, |var| std::env::var(var).ok()).into_owned()
}

impl Configuration {
    /// Load the server catalog from a JSON file, expanding environment
    /// references and validating every enabled spec.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config: Configuration = serde_json::from_str(&data).map_err(|e| {
            SessionError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;

        for (name, spec) in &mut config.mcp_servers {
            spec.expand();
            spec.validate()
                .map_err(|e| SessionError::Config(format!("server '{name}': {e}")))?;
        }
        Ok(config)
    }

    /// Load from the standard location, returning an empty catalog when no
    /// config file exists yet.
    pub fn load_default() -> Result<Self, SessionError> {
        let path = config_dir().join("mcp_servers.json");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Configuration::default())
        }
    }

    /// Look up an enabled server spec by name.
    pub fn enabled_server(&self, name: &str) -> Option<&ServerSpec> {
        self.mcp_servers.get(name).filter(|s| s.enabled)
    }
}

/// Daemon knobs, deserialized from `daemon.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub enabled: bool,
    #[serde(rename = "autoStart")]
    pub auto_start: bool,
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(rename = "logLevel")]
    pub log_level: String,
    /// Fallback idle bound in seconds for sessions with no per-kind default.
    #[serde(rename = "maxIdleTime")]
    pub max_idle_time: u64,
    /// Upper bound on concurrent registry records.
    #[serde(rename = "maxSessions")]
    pub max_sessions: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: true,
            log_level: "info".to_string(),
            max_idle_time: 3600,
            max_sessions: 10,
        }
    }
}

impl DaemonConfig {
    /// Load `daemon.json`, falling back to defaults when absent or invalid.
    pub fn load() -> Self {
        let path = config_dir().join("daemon.json");
        match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Invalid daemon config {}, using defaults: {e}", path.display());
                DaemonConfig::default()
            }),
            Err(_) => DaemonConfig::default(),
        }
    }
}

/// The per-user configuration directory (created lazily by callers).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mcpd")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Configuration {
        serde_json::from_str(json).expect("parse config")
    }

    #[test]
    fn test_parse_minimal_stdio_server() {
        let config = parse(
            r#"{"mcpServers":{"files":{"command":"npx","args":["-y","server-files"]}}}"#,
        );
        let spec = &config.mcp_servers["files"];
        assert_eq!(spec.command, "npx");
        assert_eq!(spec.args, vec!["-y", "server-files"]);
        assert!(spec.enabled);
        assert!(!spec.is_http());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_parse_http_server_with_session_overrides() {
        let config = parse(
            r#"{"mcpServers":{"ctx":{
                "type":"http","url":"https://mcp.example.com/mcp","timeout":30,
                "session":{"type":"persistent","autoStart":true,"maxIdle":120}
            }}}"#,
        );
        let spec = &config.mcp_servers["ctx"];
        assert!(spec.is_http());
        assert_eq!(spec.timeout, 30);
        assert_eq!(spec.session.kind, "persistent");
        assert!(spec.session.auto_start);
        assert_eq!(spec.session.max_idle, Some(120));
    }

    #[test]
    fn test_validate_rejects_http_without_url() {
        let spec = ServerSpec {
            kind: "http".into(),
            ..ServerSpec::default()
        };
        assert!(matches!(spec.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_spec() {
        assert!(matches!(
            ServerSpec::default().validate(),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_expand_resolves_known_variables() {
        std::env::set_var("MCPD_TEST_TOKEN", "sekrit");
        let mut spec = ServerSpec {
            kind: "http".into(),
            url: "https://api.example.com/mcp".into(),
            ..ServerSpec::default()
        };
        spec.headers
            .insert("Authorization".into(), "Bearer ${MCPD_TEST_TOKEN}".into());
        spec.expand();
        assert_eq!(spec.headers["Authorization"], "Bearer sekrit");
    }

    #[test]
    fn test_expand_keeps_unknown_variables() {
        let mut spec = ServerSpec {
            command: "run-${MCPD_TEST_DEFINITELY_UNSET}".into(),
            ..ServerSpec::default()
        };
        spec.expand();
        assert_eq!(spec.command, "run-${MCPD_TEST_DEFINITELY_UNSET}");
    }

    #[test]
    fn test_resolved_env_errors_on_unresolved_reference() {
        let mut spec = ServerSpec {
            command: "srv".into(),
            ..ServerSpec::default()
        };
        spec.env
            .insert("API_KEY".into(), "${MCPD_TEST_DEFINITELY_UNSET}".into());
        let err = spec.resolved_env().unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_resolved_env_expands_values() {
        std::env::set_var("MCPD_TEST_HOME", "/srv/data");
        let mut spec = ServerSpec {
            command: "srv".into(),
            ..ServerSpec::default()
        };
        spec.env.insert("DATA".into(), "$MCPD_TEST_HOME/cache".into());
        let env = spec.resolved_env().expect("resolve");
        assert_eq!(env["DATA"], "/srv/data/cache");
    }

    #[test]
    fn test_enabled_server_filters_disabled() {
        let config = parse(
            r#"{"mcpServers":{
                "on":{"command":"a"},
                "off":{"command":"b","enabled":false}
            }}"#,
        );
        assert!(config.enabled_server("on").is_some());
        assert!(config.enabled_server("off").is_none());
        assert!(config.enabled_server("missing").is_none());
    }

    #[test]
    fn test_daemon_config_defaults() {
        let dc = DaemonConfig::default();
        assert!(dc.enabled);
        assert_eq!(dc.max_idle_time, 3600);
        assert_eq!(dc.max_sessions, 10);
        assert_eq!(dc.log_level, "info");
    }

    #[test]
    fn test_spec_round_trips_through_json() {
        let config = parse(
            r#"{"mcpServers":{"z":{"command":"/usr/bin/node","args":["srv.js"],"timeout":15}}}"#,
        );
        let spec = &config.mcp_servers["z"];
        let json = serde_json::to_string(spec).expect("serialize");
        let back: ServerSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(*spec, back);
    }
}
