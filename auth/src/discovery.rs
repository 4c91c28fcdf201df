//! Issuer discovery and auth-requirement probing.
//!
//! Discovery order for a protected upstream: the `WWW-Authenticate: Bearer`
//! challenge may carry `resource_metadata=<url>`; that document names the
//! authorization server; the OIDC discovery document under the issuer then
//! yields the endpoints. A `401` without a usable challenge still means
//! pending-auth, just with the configured issuer.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::AuthError;

/// Endpoints from an OIDC discovery document.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

/// OAuth 2.0 protected resource metadata (RFC 9728), reduced to what the
/// manager consumes.
#[derive(Debug, Clone, Deserialize)]
struct ResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// Outcome of probing whether an endpoint requires authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    NoAuthRequired,
    /// `401` observed; issuer is the discovered one when the challenge
    /// carried `resource_metadata`, otherwise `None` (caller falls back to
    /// configuration).
    PendingAuth { issuer: Option<String> },
    /// Network-level failure, distinct from pending-auth.
    Unreachable { reason: String },
}

/// Parse the parameters of a `WWW-Authenticate: Bearer k1="v1", k2=v2`
/// challenge. Returns `None` when the scheme is not Bearer.
pub fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer")?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        params.insert(key.trim().to_string(), value.to_string());
    }
    Some(params)
}

/// Probe `endpoint` and classify its auth requirement.
pub async fn check_required(http: &reqwest::Client, endpoint: &str) -> CheckOutcome {
    let response = match http.get(endpoint).send().await {
        Ok(response) => response,
        Err(err) => {
            return CheckOutcome::Unreachable {
                reason: err.to_string(),
            };
        }
    };

    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
        return CheckOutcome::NoAuthRequired;
    }

    let challenge = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_challenge);

    let Some(params) = challenge else {
        return CheckOutcome::PendingAuth { issuer: None };
    };

    let issuer = match params.get("resource_metadata") {
        Some(metadata_url) => discover_issuer_from_metadata(http, metadata_url).await.ok(),
        None => None,
    };
    CheckOutcome::PendingAuth { issuer }
}

/// Resolve the issuer advertised through a bearer challenge, if any.
pub async fn discover_issuer_from_challenge(
    http: &reqwest::Client,
    challenge: &str,
) -> Result<Option<String>, AuthError> {
    let Some(params) = parse_bearer_challenge(challenge) else {
        return Ok(None);
    };
    match params.get("resource_metadata") {
        Some(url) => Ok(Some(discover_issuer_from_metadata(http, url).await?)),
        None => Ok(None),
    }
}

async fn discover_issuer_from_metadata(
    http: &reqwest::Client,
    metadata_url: &str,
) -> Result<String, AuthError> {
    let metadata: ResourceMetadata = http
        .get(metadata_url)
        .send()
        .await?
        .error_for_status()
        .map_err(|err| AuthError::OidcDiscoveryFailed {
            issuer: metadata_url.to_string(),
            reason: err.to_string(),
        })?
        .json()
        .await
        .map_err(|err| AuthError::OidcDiscoveryFailed {
            issuer: metadata_url.to_string(),
            reason: err.to_string(),
        })?;

    metadata
        .authorization_servers
        .into_iter()
        .next()
        .ok_or_else(|| AuthError::OidcDiscoveryFailed {
            issuer: metadata_url.to_string(),
            reason: "resource metadata lists no authorization servers".to_string(),
        })
}

/// Fetch the OIDC discovery document for `issuer`.
pub async fn discover_provider(
    http: &reqwest::Client,
    issuer: &str,
) -> Result<ProviderMetadata, AuthError> {
    let discovery_url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let metadata: ProviderMetadata = http
        .get(&discovery_url)
        .send()
        .await
        .map_err(|err| AuthError::OidcDiscoveryFailed {
            issuer: issuer.to_string(),
            reason: err.to_string(),
        })?
        .error_for_status()
        .map_err(|err| AuthError::OidcDiscoveryFailed {
            issuer: issuer.to_string(),
            reason: err.to_string(),
        })?
        .json()
        .await
        .map_err(|err| AuthError::OidcDiscoveryFailed {
            issuer: issuer.to_string(),
            reason: err.to_string(),
        })?;
    Ok(metadata)
}
