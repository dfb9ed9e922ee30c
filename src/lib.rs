#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! mcpd library — exposes the daemon's building blocks for the binary and
//! for integration tests.
//!
//! - `config` — `mcpServers` JSON configuration and daemon knobs
//! - `daemon` — daemon lifecycle (pid file, foreground/background start, stop)
//! - `endpoint` — platform endpoint selection and state-file paths
//! - `error` — structured error kinds shared across the crate
//! - `mcp` — JSON-RPC 2.0 protocol types and the stdio/HTTP transports
//! - `process` — process liveness probes and tree termination
//! - `routes` — control-channel HTTP handlers
//! - `sessions` — session registry, workers, on-disk metadata store
//! - `supervisor` — periodic idle reaping and health probing

pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod mcp;
pub mod process;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod supervisor;

// Re-export key types at crate root for convenience.
pub use config::{Configuration, DaemonConfig, ServerSpec};
pub use error::SessionError;
pub use sessions::SessionManager;
pub use state::AppState;
