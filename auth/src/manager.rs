use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use chrono::Utc;
use oauth2::AuthUrl;
use oauth2::AuthorizationCode;
use oauth2::ClientId;
use oauth2::CsrfToken;
use oauth2::EndpointNotSet;
use oauth2::EndpointSet;
use oauth2::ExtraTokenFields;
use oauth2::PkceCodeChallenge;
use oauth2::RedirectUrl;
use oauth2::RefreshToken;
use oauth2::RequestTokenError;
use oauth2::Scope;
use oauth2::StandardRevocableToken;
use oauth2::StandardTokenResponse;
use oauth2::TokenResponse;
use oauth2::TokenUrl;
use oauth2::basic::BasicErrorResponse;
use oauth2::basic::BasicErrorResponseType;
use oauth2::basic::BasicRevocationErrorResponse;
use oauth2::basic::BasicTokenIntrospectionResponse;
use oauth2::basic::BasicTokenType;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;

use muster_protocol::AuthState;
use muster_token_store::Token;
use muster_token_store::TokenStore;
use muster_token_store::TokenStoreError;

use crate::CALLBACK_TIMEOUT_SECS;
use crate::DEFAULT_CALLBACK_PORT;
use crate::callback::CallbackServer;
use crate::discovery::CheckOutcome;
use crate::discovery::ProviderMetadata;
use crate::discovery::check_required;
use crate::discovery::discover_provider;
use crate::error::AuthError;
use crate::exchange::exchange_token;

/// `id_token` rides along with the standard token response fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

type OidcTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

type OidcClient = oauth2::Client<
    BasicErrorResponse,
    OidcTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// How an upstream participates in SSO.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SsoMode {
    /// Upstream handles its own auth (or none).
    #[default]
    None,
    /// Inject the aggregator's ID token verbatim.
    Forward,
    /// RFC 8693 exchange for the given audience.
    Exchange { audience: String },
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth client id registered at the IdP.
    pub client_id: String,
    pub scopes: Vec<String>,
    pub callback_port: u16,
    /// Fallback issuer when an endpoint's challenge carries no
    /// `resource_metadata`.
    pub issuer: Option<String>,
    /// Endpoint of the aggregator itself; its ID token feeds SSO.
    pub aggregator_endpoint: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: "muster".to_string(),
            scopes: ["openid", "profile", "email", "offline_access"]
                .map(str::to_string)
                .to_vec(),
            callback_port: DEFAULT_CALLBACK_PORT,
            issuer: None,
            aggregator_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// Attempt `prompt=none` instead of opening a browser. Off by default:
    /// common IdPs (Dex among them) reject it.
    pub silent: bool,
    pub issuer_override: Option<String>,
}

/// Auth bookkeeping for one endpoint, rendered into `auth://status`.
#[derive(Debug, Clone)]
pub struct EndpointAuthEntry {
    pub state: AuthState,
    pub issuer: Option<String>,
    pub sso: SsoMode,
    pub sso_attempt_failed: bool,
}

impl Default for EndpointAuthEntry {
    fn default() -> Self {
        Self {
            state: AuthState::NoAuthRequired,
            issuer: None,
            sso: SsoMode::None,
            sso_attempt_failed: false,
        }
    }
}

/// OAuth/OIDC manager scoped to one token store.
pub struct AuthManager {
    store: Arc<TokenStore>,
    http: reqwest::Client,
    config: AuthConfig,
    endpoints: RwLock<HashMap<String, EndpointAuthEntry>>,
}

impl AuthManager {
    pub fn new(store: Arc<TokenStore>, config: AuthConfig) -> Self {
        // Redirects stay visible to us: the token endpoint must never be
        // followed across hosts, and check_required counts 3xx as reachable.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            store,
            http,
            config,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn session_id(&self) -> &str {
        self.store.session_id()
    }

    /// The aggregator's own endpoint, when configured for SSO.
    pub fn configured_aggregator_endpoint(&self) -> Option<&str> {
        self.config.aggregator_endpoint.as_deref()
    }

    /// Declare an endpoint and its SSO mode. Idempotent.
    pub async fn configure_endpoint(&self, endpoint: &str, sso: SsoMode, issuer: Option<String>) {
        let mut endpoints = self.endpoints.write().await;
        let entry = endpoints.entry(endpoint.to_string()).or_default();
        entry.sso = sso;
        if issuer.is_some() {
            entry.issuer = issuer;
        }
    }

    pub async fn entry(&self, endpoint: &str) -> EndpointAuthEntry {
        self.endpoints
            .read()
            .await
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn state(&self, endpoint: &str) -> AuthState {
        self.entry(endpoint).await.state
    }

    /// Probe `endpoint` and record whether it needs auth. `unreachable` is
    /// reported but never stored as the endpoint's auth state.
    pub async fn check_required(&self, endpoint: &str) -> CheckOutcome {
        let outcome = check_required(&self.http, endpoint).await;
        match &outcome {
            CheckOutcome::NoAuthRequired => {
                self.set_state(endpoint, AuthState::NoAuthRequired).await;
            }
            CheckOutcome::PendingAuth { issuer } => {
                let issuer = issuer.clone().or_else(|| self.config.issuer.clone());
                let mut endpoints = self.endpoints.write().await;
                let entry = endpoints.entry(endpoint.to_string()).or_default();
                // A valid stored token keeps the endpoint authenticated even
                // though an unauthenticated probe sees 401.
                if entry.state != AuthState::Authenticated {
                    entry.state = AuthState::PendingAuth;
                }
                entry.issuer = issuer;
            }
            CheckOutcome::Unreachable { .. } => {}
        }
        outcome
    }

    /// Interactive (or silent) authorization-code login for `endpoint`.
    pub async fn login(&self, endpoint: &str, opts: LoginOptions) -> Result<Token, AuthError> {
        let issuer = self.resolve_issuer(endpoint, &opts).await?;
        let provider = discover_provider(&self.http, &issuer).await?;

        let mut server = CallbackServer::bind(self.config.callback_port)?;
        let client = self.oauth_client(&provider, Some(server.redirect_uri()))?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut auth_request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in &self.config.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.clone()));
        }
        if opts.silent {
            auth_request = auth_request.add_extra_param("prompt", "none");
        }
        let (auth_url, csrf) = auth_request.url();

        let (code, returned_state) = if opts.silent {
            self.silent_authorize(auth_url.as_str(), server.redirect_uri())
                .await?
        } else {
            // Browser launch is best effort; the URL is always printed so
            // the user can copy it into any browser.
            eprintln!("Open this URL in your browser to authenticate:\n{auth_url}\n");
            if webbrowser::open(auth_url.as_str()).is_err() {
                warn!("browser launch failed; waiting for manual completion");
            }
            let callback = server
                .wait(Duration::from_secs(CALLBACK_TIMEOUT_SECS))
                .await?;
            (callback.code, callback.state)
        };

        if returned_state != *csrf.secret() {
            return Err(AuthError::PkceMismatch);
        }

        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(&self.http)
            .await
            .map_err(|err| self.map_token_error(endpoint, err))?;

        let token = self.token_from_response(&provider, &response);
        self.store.put(endpoint, &token).await?;
        self.set_state(endpoint, AuthState::Authenticated).await;
        info!(endpoint, issuer = %provider.issuer, "login complete");
        Ok(token)
    }

    /// Return a currently valid token, refreshing silently when needed.
    pub async fn ensure_fresh(&self, endpoint: &str) -> Result<Token, AuthError> {
        let token = match self.store.get(endpoint).await {
            Ok(token) => token,
            Err(TokenStoreError::NotFound { .. }) => {
                self.set_state(endpoint, AuthState::PendingAuth).await;
                return Err(AuthError::PendingAuth {
                    endpoint: endpoint.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        if !token.needs_refresh() {
            self.set_state(endpoint, AuthState::Authenticated).await;
            return Ok(token);
        }

        self.set_state(endpoint, AuthState::Expired).await;
        if !token.can_refresh() {
            self.set_state(endpoint, AuthState::PendingAuth).await;
            return Err(AuthError::PendingAuth {
                endpoint: endpoint.to_string(),
            });
        }
        self.refresh(endpoint, &token).await
    }

    /// Exchange the refresh token for a new access token, no interaction.
    pub async fn refresh(&self, endpoint: &str, token: &Token) -> Result<Token, AuthError> {
        let refresh_token = token.refresh_token.clone().ok_or_else(|| {
            AuthError::Expired401 {
                endpoint: endpoint.to_string(),
            }
        })?;
        let provider = discover_provider(&self.http, &token.issuer).await?;
        let client = self.oauth_client(&provider, None)?;

        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .request_async(&self.http)
            .await
            .map_err(|err| self.map_token_error(endpoint, err));

        match response {
            Ok(response) => {
                let mut refreshed = self.token_from_response(&provider, &response);
                // IdPs may omit the rotated refresh token; keep the old one.
                if refreshed.refresh_token.is_none() {
                    refreshed.refresh_token = token.refresh_token.clone();
                }
                if refreshed.id_token.is_none() {
                    refreshed.id_token = token.id_token.clone();
                }
                self.store.put(endpoint, &refreshed).await?;
                self.set_state(endpoint, AuthState::Authenticated).await;
                Ok(refreshed)
            }
            Err(AuthError::InvalidGrant { .. }) => {
                // The grant is dead; drop the token so status reporting and
                // the next login start clean.
                if let Err(err) = self.store.delete(endpoint).await
                    && !matches!(err, TokenStoreError::NotFound { .. })
                {
                    warn!(endpoint, %err, "failed to delete rejected token");
                }
                self.set_state(endpoint, AuthState::PendingAuth).await;
                Err(AuthError::InvalidGrant {
                    endpoint: endpoint.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Handle a 401 from an upstream call. `Ok(token)` means the caller may
    /// retry exactly once with the returned token.
    pub async fn on_unauthorized(&self, endpoint: &str) -> Result<Token, AuthError> {
        let entry = self.entry(endpoint).await;
        if !matches!(entry.sso, SsoMode::None) {
            self.mark_sso_failed(endpoint).await;
            return Err(AuthError::Revoked401 {
                endpoint: endpoint.to_string(),
            });
        }

        match self.store.get(endpoint).await {
            Ok(token) if token.can_refresh() => self.refresh(endpoint, &token).await,
            Ok(_) => {
                if let Err(err) = self.store.delete(endpoint).await
                    && !matches!(err, TokenStoreError::NotFound { .. })
                {
                    warn!(endpoint, %err, "failed to delete rejected token");
                }
                self.set_state(endpoint, AuthState::PendingAuth).await;
                Err(AuthError::Revoked401 {
                    endpoint: endpoint.to_string(),
                })
            }
            Err(TokenStoreError::NotFound { .. }) => {
                self.set_state(endpoint, AuthState::PendingAuth).await;
                Err(AuthError::PendingAuth {
                    endpoint: endpoint.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bearer value to inject for `endpoint`, honouring its SSO mode.
    /// `Ok(None)` means connect unauthenticated.
    pub async fn bearer_for(&self, endpoint: &str) -> Result<Option<String>, AuthError> {
        let entry = self.entry(endpoint).await;
        match entry.sso {
            SsoMode::None => match self.ensure_fresh(endpoint).await {
                Ok(token) => Ok(Some(token.access_token)),
                Err(AuthError::PendingAuth { .. }) => Ok(None),
                Err(err) => Err(err),
            },
            SsoMode::Forward => {
                let id_token = self.aggregator_id_token().await?;
                self.set_state(endpoint, AuthState::Forwarded).await;
                Ok(Some(id_token))
            }
            SsoMode::Exchange { audience } => {
                let aggregator_endpoint = self.aggregator_endpoint()?;
                let id_token = self.aggregator_id_token().await?;
                let aggregator_token = self.store.get(&aggregator_endpoint).await?;
                let provider =
                    discover_provider(&self.http, &aggregator_token.issuer).await?;
                let exchanged = exchange_token(
                    &self.http,
                    &provider.token_endpoint,
                    &self.config.client_id,
                    &id_token,
                    &audience,
                )
                .await?;
                self.set_state(endpoint, AuthState::Exchanged).await;
                Ok(Some(exchanged.access_token))
            }
        }
    }

    pub async fn mark_sso_failed(&self, endpoint: &str) {
        let mut endpoints = self.endpoints.write().await;
        let entry = endpoints.entry(endpoint.to_string()).or_default();
        entry.sso_attempt_failed = true;
        entry.state = AuthState::Failed;
    }

    /// Delete the stored token and fall back to pending-auth (or
    /// no-auth-required when the endpoint never needed auth).
    pub async fn logout(&self, endpoint: &str) -> Result<(), AuthError> {
        match self.store.delete(endpoint).await {
            Ok(()) | Err(TokenStoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        let mut endpoints = self.endpoints.write().await;
        let entry = endpoints.entry(endpoint.to_string()).or_default();
        entry.state = if entry.state == AuthState::NoAuthRequired {
            AuthState::NoAuthRequired
        } else {
            AuthState::PendingAuth
        };
        entry.sso_attempt_failed = false;
        Ok(())
    }

    async fn resolve_issuer(
        &self,
        endpoint: &str,
        opts: &LoginOptions,
    ) -> Result<String, AuthError> {
        if let Some(issuer) = &opts.issuer_override {
            return Ok(issuer.clone());
        }
        if let CheckOutcome::PendingAuth { issuer: Some(issuer) } =
            self.check_required(endpoint).await
        {
            return Ok(issuer);
        }
        if let Some(issuer) = self.entry(endpoint).await.issuer {
            return Ok(issuer);
        }
        self.config
            .issuer
            .clone()
            .ok_or_else(|| AuthError::OidcDiscoveryFailed {
                issuer: endpoint.to_string(),
                reason: "no issuer discovered or configured".to_string(),
            })
    }

    /// `prompt=none` round trip: usable only when the IdP already holds a
    /// session for this client, which is why it is opt-in.
    async fn silent_authorize(
        &self,
        auth_url: &str,
        redirect_uri: &str,
    ) -> Result<(String, String), AuthError> {
        let response = self.http.get(auth_url).send().await?;
        if !response.status().is_redirection() {
            return Err(AuthError::SilentUnavailable {
                reason: format!("authorization endpoint returned {}", response.status()),
            });
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AuthError::SilentUnavailable {
                reason: "redirect without Location header".to_string(),
            })?;
        if !location.starts_with(redirect_uri) {
            return Err(AuthError::SilentUnavailable {
                reason: "IdP requires interaction".to_string(),
            });
        }
        let parsed = url::Url::parse(location).map_err(|err| AuthError::SilentUnavailable {
            reason: err.to_string(),
        })?;
        let mut code = None;
        let mut state = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        match (code, state) {
            (Some(code), Some(state)) => Ok((code, state)),
            _ => Err(AuthError::SilentUnavailable {
                reason: "redirect carried no authorization code".to_string(),
            }),
        }
    }

    fn oauth_client(
        &self,
        provider: &ProviderMetadata,
        redirect_uri: Option<&str>,
    ) -> Result<OidcClient, AuthError> {
        let auth_url = AuthUrl::new(provider.authorization_endpoint.clone())
            .map_err(|err| AuthError::Protocol(err.to_string()))?;
        let token_url = TokenUrl::new(provider.token_endpoint.clone())
            .map_err(|err| AuthError::Protocol(err.to_string()))?;
        let mut client = oauth2::Client::new(ClientId::new(self.config.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url);
        if let Some(redirect_uri) = redirect_uri {
            client = client.set_redirect_uri(
                RedirectUrl::new(redirect_uri.to_string())
                    .map_err(|err| AuthError::Protocol(err.to_string()))?,
            );
        }
        Ok(client)
    }

    fn token_from_response(
        &self,
        provider: &ProviderMetadata,
        response: &OidcTokenResponse,
    ) -> Token {
        let expires_in = response
            .expires_in()
            .unwrap_or(Duration::from_secs(3600));
        let expires_at = Utc::now()
            + ChronoDuration::from_std(expires_in)
                .unwrap_or_else(|_| ChronoDuration::seconds(3600));
        let scope = match response.scopes() {
            Some(scopes) => scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            None => self.config.scopes.join(" "),
        };
        Token {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_at,
            id_token: response.extra_fields().id_token.clone(),
            issuer: provider.issuer.clone(),
            scope,
            session_id: self.store.session_id().to_string(),
        }
    }

    fn map_token_error<RE>(
        &self,
        endpoint: &str,
        err: RequestTokenError<RE, BasicErrorResponse>,
    ) -> AuthError
    where
        RE: std::error::Error,
    {
        match err {
            RequestTokenError::ServerResponse(response)
                if *response.error() == BasicErrorResponseType::InvalidGrant =>
            {
                AuthError::InvalidGrant {
                    endpoint: endpoint.to_string(),
                }
            }
            RequestTokenError::ServerResponse(response) => {
                AuthError::Protocol(format!("token endpoint rejected request: {response}"))
            }
            RequestTokenError::Request(err) => AuthError::Network(err.to_string()),
            RequestTokenError::Parse(err, _) => {
                AuthError::Protocol(format!("malformed token response: {err}"))
            }
            RequestTokenError::Other(message) => AuthError::Protocol(message),
        }
    }

    fn aggregator_endpoint(&self) -> Result<String, AuthError> {
        self.config
            .aggregator_endpoint
            .clone()
            .ok_or_else(|| AuthError::Protocol("no aggregator endpoint configured".to_string()))
    }

    async fn aggregator_id_token(&self) -> Result<String, AuthError> {
        let aggregator_endpoint = self.aggregator_endpoint()?;
        let token = self.ensure_fresh(&aggregator_endpoint).await?;
        token.id_token.ok_or_else(|| AuthError::PendingAuth {
            endpoint: aggregator_endpoint,
        })
    }

    async fn set_state(&self, endpoint: &str, state: AuthState) {
        let mut endpoints = self.endpoints.write().await;
        endpoints.entry(endpoint.to_string()).or_default().state = state;
    }
}
