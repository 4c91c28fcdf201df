//! RFC 8693 token exchange.
//!
//! The token endpoint is asked to swap the aggregator's ID token for an
//! access token valid at an upstream's audience. This is a plain form POST:
//! the grant is not modelled by the `oauth2` crate.

use serde::Deserialize;

use crate::error::AuthError;

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";
const REQUESTED_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangedToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchange `subject_id_token` for a token addressed to `audience`.
pub async fn exchange_token(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    subject_id_token: &str,
    audience: &str,
) -> Result<ExchangedToken, AuthError> {
    let response = http
        .post(token_endpoint)
        .form(&[
            ("grant_type", GRANT_TYPE),
            ("client_id", client_id),
            ("subject_token", subject_id_token),
            ("subject_token_type", SUBJECT_TOKEN_TYPE),
            ("requested_token_type", REQUESTED_TOKEN_TYPE),
            ("audience", audience),
        ])
        .send()
        .await?;

    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        let status = response.status();
        let detail = match response.json::<TokenEndpointError>().await {
            Ok(body) => body
                .error_description
                .unwrap_or(body.error),
            Err(_) => status.to_string(),
        };
        Err(AuthError::Protocol(format!(
            "token exchange rejected: {detail}"
        )))
    }
}
