//! Upstream MCP client pool.
//!
//! One long-lived client per configured upstream server. Each client owns
//! its transport (stdio child process, streamable HTTP, or SSE), performs
//! the MCP handshake, eagerly lists tools/resources/prompts, forwards
//! `*/list_changed` notifications, and reconnects with capped exponential
//! back-off. Auth headers come from the auth manager; a 401 triggers at
//! most one silent refresh before `auth-required` is surfaced.

mod client;
mod config;
mod error;
mod notifications;
mod pool;

pub use client::UpstreamClient;
pub use client::UpstreamSnapshot;
pub use client::convert_call_result;
pub use config::TransportConfig;
pub use config::UpstreamSpec;
pub use error::UpstreamError;
pub use notifications::ListChanged;
pub use notifications::NotificationForwarder;
pub use pool::PoolEvent;
pub use pool::UpstreamManager;
pub use pool::UpstreamStatus;

/// Default per-call deadline when an upstream spec does not override it.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Reconnect back-off bounds.
pub const BACKOFF_INITIAL_MS: u64 = 250;
pub const BACKOFF_CAP_MS: u64 = 30_000;
