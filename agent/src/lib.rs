//! The agent client: stdio MCP bridge between an IDE and a (possibly
//! protected) muster aggregator.
//!
//! Until the aggregator accepts us, the bridge exposes a single synthetic
//! `authenticate_muster` tool. The moment the token store holds a valid
//! token (from that tool or from an external login) the bridge connects,
//! swaps in the full aggregated tool set, and emits exactly one
//! `tools/list_changed` so the attached IDE refreshes.

mod proxy;
mod walk;

pub use proxy::AgentProxy;
pub use proxy::serve_stdio_proxy;
pub use walk::logins_needed;
pub use walk::walk_upstream_auth;

use muster_auth::AuthError;
use muster_protocol::ExitCode;

/// How long each per-upstream login in the auth walk may take.
pub const UPSTREAM_LOGIN_TIMEOUT_SECS: u64 = 120;

/// Map an agent-run outcome onto the process exit-code contract.
pub fn exit_code_for(result: &Result<(), AuthError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::Success,
        Err(AuthError::PendingAuth { .. } | AuthError::Expired401 { .. }) => ExitCode::AuthRequired,
        Err(
            AuthError::CallbackTimeout
            | AuthError::PkceMismatch
            | AuthError::InvalidGrant { .. }
            | AuthError::Revoked401 { .. }
            | AuthError::OidcDiscoveryFailed { .. },
        ) => ExitCode::AuthFlowFailed,
        Err(_) => ExitCode::GeneralError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code_for(&Ok(())), ExitCode::Success);
        assert_eq!(
            exit_code_for(&Err(AuthError::PendingAuth {
                endpoint: "e".into()
            })),
            ExitCode::AuthRequired
        );
        assert_eq!(
            exit_code_for(&Err(AuthError::CallbackTimeout)),
            ExitCode::AuthFlowFailed
        );
        assert_eq!(
            exit_code_for(&Err(AuthError::Network("boom".into()))),
            ExitCode::GeneralError
        );
    }
}
