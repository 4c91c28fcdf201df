use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The upstream rejected the token and a refresh may recover it.
    #[error("access token for `{endpoint}` is expired")]
    Expired401 { endpoint: String },

    /// The upstream rejected the token and refresh was also rejected; an
    /// interactive login is required.
    #[error("token for `{endpoint}` was revoked")]
    Revoked401 { endpoint: String },

    #[error("OIDC discovery against `{issuer}` failed: {reason}")]
    OidcDiscoveryFailed { issuer: String, reason: String },

    /// Authorization callback carried an unexpected `state` or the code
    /// exchange failed PKCE verification.
    #[error("authorization response failed PKCE/state verification")]
    PkceMismatch,

    #[error("timed out waiting for the OAuth callback")]
    CallbackTimeout,

    /// Non-fatal: the URL was printed for manual copy.
    #[error("could not open a browser for the authorization URL")]
    BrowserOpenFailed,

    /// The IdP rejected the refresh token (`invalid_grant`); the stored
    /// token is deleted and the endpoint returns to pending-auth.
    #[error("refresh token for `{endpoint}` was rejected")]
    InvalidGrant { endpoint: String },

    /// No token is stored and interactive login has not happened yet.
    #[error("authentication required for `{endpoint}`")]
    PendingAuth { endpoint: String },

    #[error("silent authorization is not available: {reason}")]
    SilentUnavailable { reason: String },

    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Store(#[from] muster_token_store::TokenStoreError),

    #[error("{0}")]
    Protocol(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(err.to_string())
    }
}
