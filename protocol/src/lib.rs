//! Shared types for the muster control plane.
//!
//! This crate is the seam between the aggregator (which owns tool dispatch)
//! and everything that needs to call tools without depending on the
//! aggregator itself: the orchestrator drives service lifecycles through
//! [`ToolInvoker`], and the agent renders [`AuthStatusPayload`] from the
//! `auth://status` resource.

mod auth_status;
mod events;
mod exit_code;
mod invoker;
pub mod mcp;

pub use auth_status::AuthState;
pub use auth_status::AuthStatusPayload;
pub use auth_status::ServerAuthStatus;
pub use auth_status::ServerStatus;
pub use events::EventLog;
pub use events::MusterEvent;
pub use exit_code::ExitCode;
pub use invoker::ToolCallError;
pub use invoker::ToolInvoker;

/// Resource URI under which the aggregator publishes per-upstream auth
/// status.
pub const AUTH_STATUS_URI: &str = "auth://status";

/// Synthetic tool exposed while the aggregator (or agent) is waiting for the
/// user to authenticate.
pub const AUTHENTICATE_TOOL: &str = "authenticate_muster";

/// Header used to correlate multiple transports from the same logical
/// client.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
