//! Post-connect auth walk: after the aggregator accepts us, drive login for
//! each upstream still waiting on authentication. Logins run sequentially
//! through the aggregator's `core_auth_login` tool so a single IdP session
//! cookie carries SSO to the rest.

use std::sync::Arc;
use std::time::Duration;

use rmcp::model::CallToolRequestParam;
use rmcp::model::ReadResourceRequestParam;
use rmcp::model::ResourceContents;
use rmcp::service::RoleClient;
use rmcp::service::RunningService;
use serde_json::json;
use tracing::info;
use tracing::warn;

use muster_protocol::AUTH_STATUS_URI;
use muster_protocol::AuthStatusPayload;
use muster_protocol::ServerStatus;

use crate::UPSTREAM_LOGIN_TIMEOUT_SECS;

/// Upstreams the status payload reports as waiting for login, in payload
/// order.
pub fn logins_needed(payload: &AuthStatusPayload) -> Vec<String> {
    payload
        .servers
        .iter()
        .filter(|server| server.status == ServerStatus::AuthRequired)
        .map(|server| server.name.clone())
        .collect()
}

/// Read `auth://status` from the aggregator and trigger `core_auth_login`
/// for each upstream still pending. Each login gets a bounded window;
/// failures are logged and skipped, never aborting the chain.
pub async fn walk_upstream_auth(aggregator: &Arc<RunningService<RoleClient, ()>>) {
    let status = match aggregator
        .read_resource(ReadResourceRequestParam {
            uri: AUTH_STATUS_URI.to_string(),
        })
        .await
    {
        Ok(result) => result,
        Err(err) => {
            warn!(%err, "could not read auth status; skipping upstream auth walk");
            return;
        }
    };

    let Some(payload) = status.contents.iter().find_map(|contents| match contents {
        ResourceContents::TextResourceContents { text, .. } => {
            serde_json::from_str::<AuthStatusPayload>(text).ok()
        }
        _ => None,
    }) else {
        warn!("auth status resource had no parseable payload");
        return;
    };

    for name in logins_needed(&payload) {
        info!(upstream = %name, "upstream requires authentication; starting login");
        let arguments = match json!({ "server": name }) {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        };
        let login = aggregator.call_tool(CallToolRequestParam {
            name: "core_auth_login".into(),
            arguments,
        });
        match tokio::time::timeout(Duration::from_secs(UPSTREAM_LOGIN_TIMEOUT_SECS), login).await
        {
            Ok(Ok(result)) if result.is_error != Some(true) => {
                info!(upstream = %name, "upstream login complete");
            }
            Ok(Ok(_)) => warn!(upstream = %name, "upstream login failed; continuing"),
            Ok(Err(err)) => warn!(upstream = %name, %err, "upstream login errored; continuing"),
            Err(_) => warn!(upstream = %name, "upstream login timed out; continuing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_protocol::ServerAuthStatus;
    use pretty_assertions::assert_eq;

    fn server(name: &str, status: ServerStatus) -> ServerAuthStatus {
        ServerAuthStatus {
            name: name.to_string(),
            status,
            auth_tool: Some(format!("authenticate_{name}")),
            issuer: Some("https://idp.example".to_string()),
            token_forwarding_enabled: false,
            token_exchange_enabled: false,
            sso_attempt_failed: false,
        }
    }

    #[test]
    fn only_auth_required_upstreams_are_walked() {
        let payload = AuthStatusPayload {
            servers: vec![
                server("a", ServerStatus::Connected),
                server("b", ServerStatus::AuthRequired),
                server("c", ServerStatus::Disconnected),
                server("d", ServerStatus::AuthRequired),
            ],
        };
        assert_eq!(
            logins_needed(&payload),
            vec!["b".to_string(), "d".to_string()]
        );
    }
}
