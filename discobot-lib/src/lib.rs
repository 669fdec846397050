//! Control plane for per-session AI sandboxes.
//!
//! The pieces, bottom up: a transactional store over Postgres or SQLite, a
//! durable resource-serialized job queue with a single-leader dispatcher, a
//! persist-then-publish project event broker, the session state machine,
//! the chat completion proxy, and three client surfaces (JSON/SSE HTTP API,
//! subdomain reverse proxy, SSH gateway).

pub mod api;
pub mod completion;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod id;
pub mod jobs;
pub mod message;
pub mod model;
pub mod session;
pub mod ssh;
pub mod store;
pub mod subdomain;

pub use config::{Config, SandboxBackend};
pub use error::{Error, Result};
pub use store::Store;

/// Cookie carrying the user session token.
pub const SESSION_COOKIE: &str = "discobot_session";

/// Marker header for the AI-SDK UI message stream protocol.
pub const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";

/// Credential header stripped by the subdomain proxy.
pub const CREDENTIALS_HEADER: &str = "x-discobot-credentials";

/// Reserved identity used when authentication is disabled.
pub const ANONYMOUS_USER_ID: &str = "00000000000000000000000000";
pub const ANONYMOUS_PROJECT_SLUG: &str = "default";

/// Millisecond Unix timestamp; every persisted instant uses this clock.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
