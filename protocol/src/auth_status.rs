use serde::Deserialize;
use serde::Serialize;

/// Authentication state of one endpoint as tracked by the auth manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    NoAuthRequired,
    Authenticated,
    PendingAuth,
    Expired,
    /// The aggregator's ID token is injected verbatim.
    Forwarded,
    /// An RFC 8693 exchange produced a token for the upstream's audience.
    Exchanged,
    Failed,
    /// Endpoint could not be reached; orthogonal to the auth states and
    /// never persisted.
    Unreachable,
}

/// Connection-level status reported per upstream in `auth://status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Connected,
    AuthRequired,
    Disconnected,
    Error,
    Unreachable,
}

/// One upstream's entry in the `auth://status` resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAuthStatus {
    pub name: String,
    pub status: ServerStatus,
    /// Remediation tool (`authenticate_<name>`) when status is
    /// `auth_required`.
    pub auth_tool: Option<String>,
    pub issuer: Option<String>,
    pub token_forwarding_enabled: bool,
    pub token_exchange_enabled: bool,
    pub sso_attempt_failed: bool,
}

/// JSON body of the `auth://status` resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatusPayload {
    pub servers: Vec<ServerAuthStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn status_payload_uses_wire_field_names() {
        let payload = AuthStatusPayload {
            servers: vec![ServerAuthStatus {
                name: "github".to_string(),
                status: ServerStatus::AuthRequired,
                auth_tool: Some("authenticate_github".to_string()),
                issuer: Some("https://idp.example".to_string()),
                token_forwarding_enabled: true,
                token_exchange_enabled: false,
                sso_attempt_failed: true,
            }],
        };

        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(
            value,
            json!({
                "servers": [{
                    "name": "github",
                    "status": "auth_required",
                    "authTool": "authenticate_github",
                    "issuer": "https://idp.example",
                    "tokenForwardingEnabled": true,
                    "tokenExchangeEnabled": false,
                    "ssoAttemptFailed": true,
                }]
            })
        );

        let parsed: AuthStatusPayload = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, payload);
    }
}
