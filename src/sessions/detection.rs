//! Session-kind derivation and timeout policy.
//!
//! An explicit `session.type` override always wins. Otherwise http servers
//! are stateless, stdio servers whose command line smells like browser
//! automation are persistent (their state is the whole point of keeping the
//! process around), and everything else is hybrid: try persistent, degrade
//! to stateless when the start fails.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ServerSpec;

/// Hard ceilings for transport deadlines.
pub const CALL_CEILING: Duration = Duration::from_secs(60);
pub const LIST_CEILING: Duration = Duration::from_secs(30);
pub const HEALTH_CEILING: Duration = Duration::from_secs(10);
/// Bring-up (spawn + probe) ceiling.
pub const START_CEILING: Duration = Duration::from_secs(30);

/// Command/argv substrings that mark a server as browser automation.
const BROWSER_MARKERS: [&str; 6] = [
    "chrome-devtools",
    "playwright",
    "selenium",
    "puppeteer",
    "webdriver",
    "browser",
];

/// How a session multiplexes tool calls onto its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// A new transport per call, torn down after the reply.
    Stateless,
    /// One transport, opened once and reused until stopped or reaped.
    Persistent,
    /// Persistent on first use; a failed start degrades to stateless.
    Hybrid,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Stateless => "stateless",
            SessionKind::Persistent => "persistent",
            SessionKind::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the session kind for a server spec.
pub fn detect_kind(spec: &ServerSpec) -> SessionKind {
    // An explicit override beats every heuristic.
    match spec.session.kind.as_str() {
        "persistent" => return SessionKind::Persistent,
        "stateless" => return SessionKind::Stateless,
        "hybrid" => return SessionKind::Hybrid,
        _ => {}
    }

    if spec.persistent {
        return SessionKind::Persistent;
    }

    if spec.is_http() {
        return SessionKind::Stateless;
    }

    let haystack = format!("{} {}", spec.command, spec.args.join(" ")).to_lowercase();
    if BROWSER_MARKERS.iter().any(|m| haystack.contains(m)) {
        return SessionKind::Persistent;
    }

    SessionKind::Hybrid
}

/// Whether a session for this spec should be started eagerly.
pub fn should_auto_start(spec: &ServerSpec) -> bool {
    spec.session.auto_start || detect_kind(spec) == SessionKind::Persistent
}

/// Idle seconds before the supervisor reaps the session. 0 means never.
/// An explicit `session.maxIdle` wins; otherwise the per-kind default.
pub fn idle_timeout_secs(spec: &ServerSpec) -> u64 {
    if let Some(max_idle) = spec.session.max_idle {
        return max_idle;
    }
    match detect_kind(spec) {
        SessionKind::Persistent => 300,
        SessionKind::Hybrid => 180,
        SessionKind::Stateless => 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_spec(command: &str, args: &[&str]) -> ServerSpec {
        ServerSpec {
            command: command.into(),
            args: args.iter().map(ToString::to_string).collect(),
            ..ServerSpec::default()
        }
    }

    fn http_spec(url: &str) -> ServerSpec {
        ServerSpec {
            kind: "http".into(),
            url: url.into(),
            ..ServerSpec::default()
        }
    }

    #[test]
    fn test_http_defaults_to_stateless() {
        assert_eq!(
            detect_kind(&http_spec("https://mcp.example.com/mcp")),
            SessionKind::Stateless
        );
    }

    #[test]
    fn test_url_without_type_counts_as_http() {
        let spec = ServerSpec {
            url: "https://mcp.example.com/mcp".into(),
            ..ServerSpec::default()
        };
        assert_eq!(detect_kind(&spec), SessionKind::Stateless);
    }

    #[test]
    fn test_browser_markers_force_persistent() {
        for fixture in [
            stdio_spec("npx", &["-y", "@playwright/mcp"]),
            stdio_spec("chrome-devtools-mcp", &[]),
            stdio_spec("node", &["Puppeteer-server.js"]),
            stdio_spec("node", &["webdriver-bridge.js"]),
        ] {
            assert_eq!(detect_kind(&fixture), SessionKind::Persistent, "{fixture:?}");
        }
    }

    #[test]
    fn test_plain_stdio_defaults_to_hybrid() {
        assert_eq!(
            detect_kind(&stdio_spec("npx", &["-y", "server-filesystem"])),
            SessionKind::Hybrid
        );
    }

    #[test]
    fn test_explicit_override_beats_browser_detection() {
        let mut spec = stdio_spec("npx", &["-y", "@playwright/mcp"]);
        spec.session.kind = "stateless".into();
        assert_eq!(detect_kind(&spec), SessionKind::Stateless);
    }

    #[test]
    fn test_explicit_override_beats_http_default() {
        let mut spec = http_spec("https://mcp.example.com/mcp");
        spec.session.kind = "persistent".into();
        assert_eq!(detect_kind(&spec), SessionKind::Persistent);
    }

    #[test]
    fn test_persistent_hint_promotes_stdio() {
        let mut spec = stdio_spec("npx", &["-y", "server-filesystem"]);
        spec.persistent = true;
        assert_eq!(detect_kind(&spec), SessionKind::Persistent);
    }

    #[test]
    fn test_auto_start_for_persistent_and_opted_in() {
        assert!(should_auto_start(&stdio_spec("playwright-mcp", &[])));
        assert!(!should_auto_start(&stdio_spec("npx", &["server-files"])));

        let mut spec = stdio_spec("npx", &["server-files"]);
        spec.session.auto_start = true;
        assert!(should_auto_start(&spec));
    }

    #[test]
    fn test_idle_timeout_defaults_by_kind() {
        assert_eq!(idle_timeout_secs(&stdio_spec("playwright-mcp", &[])), 300);
        assert_eq!(idle_timeout_secs(&stdio_spec("npx", &["files"])), 180);
        assert_eq!(idle_timeout_secs(&http_spec("http://h/mcp")), 60);
    }

    #[test]
    fn test_idle_timeout_explicit_override() {
        let mut spec = stdio_spec("playwright-mcp", &[]);
        spec.session.max_idle = Some(1);
        assert_eq!(idle_timeout_secs(&spec), 1);

        // Zero means "never reap", not "use the default".
        spec.session.max_idle = Some(0);
        assert_eq!(idle_timeout_secs(&spec), 0);
    }
}
