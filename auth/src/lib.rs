//! OAuth 2.0 / OIDC authentication for the aggregator and its upstreams.
//!
//! Interactive logins run authorization-code + PKCE against a loopback
//! callback; refreshes are silent. Issuers are discovered from
//! `WWW-Authenticate` challenges when an upstream advertises
//! `resource_metadata`, falling back to configuration. For SSO the manager
//! can forward the aggregator's ID token verbatim or exchange it (RFC 8693)
//! for a token scoped to the upstream's audience.

mod callback;
mod discovery;
mod error;
mod exchange;
mod manager;

pub use callback::CallbackServer;
pub use discovery::CheckOutcome;
pub use discovery::ProviderMetadata;
pub use discovery::check_required;
pub use discovery::discover_issuer_from_challenge;
pub use discovery::discover_provider;
pub use discovery::parse_bearer_challenge;
pub use error::AuthError;
pub use exchange::ExchangedToken;
pub use exchange::exchange_token;
pub use manager::AuthConfig;
pub use manager::AuthManager;
pub use manager::LoginOptions;
pub use manager::SsoMode;

/// Default loopback port for the OAuth redirect.
pub const DEFAULT_CALLBACK_PORT: u16 = 3000;

/// How long a login waits for the browser redirect before giving up.
pub const CALLBACK_TIMEOUT_SECS: u64 = 300;
