//! Structured errors shared across the daemon.
//!
//! Every fallible operation surfaces a [`SessionError`] whose variant is the
//! error *kind* from the daemon's error model. Callers dispatch on the
//! variant — never on message substrings. The diagnostic string inside each
//! variant is for humans and log lines only.

/// Error kinds surfaced by the session subsystem and transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Malformed spec or unresolved environment reference. Not recoverable;
    /// reported to the caller verbatim.
    Config(String),
    /// Unknown session name or unknown tool.
    NotFound(String),
    /// Start requested while another start attempt is in flight.
    AlreadyStarting(String),
    /// Connect/spawn/HTTP/stdio I/O failure. The session transitions to
    /// Error; the next call may retry via a fresh start.
    Transport(String),
    /// A deadline expired. Callers may retry; the stdio transport marks
    /// itself dirty and is recycled on the next health check.
    Timeout(String),
    /// The server returned a JSON-RPC error object, or its reply was not
    /// parseable JSON-RPC. `code` is the JSON-RPC error code (`-32700` for
    /// unparseable replies).
    Protocol { code: i64, message: String },
    /// On-disk session metadata failed the reattach match; the record was
    /// deleted and a fresh session will be created.
    Invalidated(String),
    /// The daemon is shutting down.
    Shutdown,
}

impl SessionError {
    /// Whether this error is a deadline expiry (retryable by the caller).
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }

    /// Short kind tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Config(_) => "config",
            SessionError::NotFound(_) => "not-found",
            SessionError::AlreadyStarting(_) => "already-starting",
            SessionError::Transport(_) => "transport",
            SessionError::Timeout(_) => "timeout",
            SessionError::Protocol { .. } => "protocol",
            SessionError::Invalidated(_) => "invalidated",
            SessionError::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Config(msg) => write!(f, "configuration error: {msg}"),
            SessionError::NotFound(msg) => write!(f, "not found: {msg}"),
            SessionError::AlreadyStarting(name) => {
                write!(f, "session {name} is already starting")
            }
            SessionError::Transport(msg) => write!(f, "transport error: {msg}"),
            SessionError::Timeout(msg) => write!(f, "request timeout: {msg}"),
            SessionError::Protocol { code, message } => {
                write!(f, "JSON-RPC error {code}: {message}")
            }
            SessionError::Invalidated(msg) => write!(f, "session invalidated: {msg}"),
            SessionError::Shutdown => write!(f, "daemon is shutting down"),
        }
    }
}

impl std::error::Error for SessionError {}
