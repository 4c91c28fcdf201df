use std::sync::Arc;

use chrono::Duration;
use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::method;
use wiremock::matchers::path;

use muster_auth::AuthConfig;
use muster_auth::AuthError;
use muster_auth::AuthManager;
use muster_auth::CheckOutcome;
use muster_auth::SsoMode;
use muster_auth::exchange_token;
use muster_protocol::AuthState;
use muster_token_store::Token;
use muster_token_store::TokenStore;
use muster_token_store::TokenStoreError;

fn manager_with_store(dir: &std::path::Path) -> (AuthManager, Arc<TokenStore>) {
    let store = Arc::new(TokenStore::open(dir).expect("open store"));
    let manager = AuthManager::new(Arc::clone(&store), AuthConfig::default());
    (manager, store)
}

async fn mount_discovery(idp: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": idp.uri(),
            "authorization_endpoint": format!("{}/auth", idp.uri()),
            "token_endpoint": format!("{}/token", idp.uri()),
        })))
        .mount(idp)
        .await;
}

fn stored_token(issuer: &str, expires_at: chrono::DateTime<Utc>, refresh: Option<&str>) -> Token {
    Token {
        access_token: "old-access".to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_at,
        id_token: Some("id-token".to_string()),
        issuer: issuer.to_string(),
        scope: "openid".to_string(),
        session_id: "sess".to_string(),
    }
}

#[tokio::test]
async fn check_required_classifies_ok_and_bare_401() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/protected"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer"))
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = manager_with_store(dir.path());

    let ok = manager
        .check_required(&format!("{}/ok", upstream.uri()))
        .await;
    assert_eq!(ok, CheckOutcome::NoAuthRequired);

    let protected = manager
        .check_required(&format!("{}/protected", upstream.uri()))
        .await;
    assert_eq!(protected, CheckOutcome::PendingAuth { issuer: None });
}

#[tokio::test]
async fn check_required_discovers_issuer_from_resource_metadata() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resource": upstream.uri(),
            "authorization_servers": [idp.uri()],
        })))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "WWW-Authenticate",
            format!(
                "Bearer resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
                upstream.uri()
            )
            .as_str(),
        ))
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = manager_with_store(dir.path());

    let outcome = manager.check_required(&upstream.uri()).await;
    assert_eq!(
        outcome,
        CheckOutcome::PendingAuth {
            issuer: Some(idp.uri())
        }
    );
}

#[tokio::test]
async fn check_required_reports_unreachable_distinctly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = manager_with_store(dir.path());

    // Port 1 on loopback refuses connections.
    let outcome = manager.check_required("http://127.0.0.1:1/").await;
    assert!(matches!(outcome, CheckOutcome::Unreachable { .. }));
}

#[tokio::test]
async fn ensure_fresh_refreshes_expired_token() {
    let idp = MockServer::start().await;
    mount_discovery(&idp).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "rt-2",
        })))
        .mount(&idp)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = manager_with_store(dir.path());
    let endpoint = "https://mcp.example";
    store
        .put(
            endpoint,
            &stored_token(&idp.uri(), Utc::now() - Duration::seconds(10), Some("rt-1")),
        )
        .await
        .expect("seed token");

    let fresh = manager.ensure_fresh(endpoint).await.expect("refreshed");
    assert_eq!(fresh.access_token, "new-access");
    assert_eq!(fresh.refresh_token.as_deref(), Some("rt-2"));
    // The refresh wrote back to the store.
    let persisted = store.get(endpoint).await.expect("persisted");
    assert_eq!(persisted.access_token, "new-access");
    assert_eq!(manager.state(endpoint).await, AuthState::Authenticated);
}

#[tokio::test]
async fn ensure_fresh_returns_valid_token_without_refresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = manager_with_store(dir.path());
    let endpoint = "https://mcp.example";
    let token = stored_token(
        "https://idp.example",
        Utc::now() + Duration::seconds(600),
        None,
    );
    store.put(endpoint, &token).await.expect("seed");

    let fresh = manager.ensure_fresh(endpoint).await.expect("still valid");
    assert_eq!(fresh.access_token, token.access_token);
}

#[tokio::test]
async fn rejected_refresh_deletes_token_and_reports_pending_auth() {
    let idp = MockServer::start().await;
    mount_discovery(&idp).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
        )
        .mount(&idp)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = manager_with_store(dir.path());
    let endpoint = "https://mcp.example";
    store
        .put(
            endpoint,
            &stored_token(&idp.uri(), Utc::now() - Duration::seconds(10), Some("rt-dead")),
        )
        .await
        .expect("seed token");

    let err = manager.ensure_fresh(endpoint).await.expect_err("rejected");
    assert!(matches!(err, AuthError::InvalidGrant { .. }));
    assert!(matches!(
        store.get(endpoint).await,
        Err(TokenStoreError::NotFound { .. })
    ));
    assert_eq!(manager.state(endpoint).await, AuthState::PendingAuth);

    // Subsequent freshness checks report pending-auth without throwing.
    let err = manager.ensure_fresh(endpoint).await.expect_err("pending");
    assert!(matches!(err, AuthError::PendingAuth { .. }));
}

#[tokio::test]
async fn unauthorized_under_sso_marks_attempt_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, _store) = manager_with_store(dir.path());
    let endpoint = "https://github.example/mcp";
    manager
        .configure_endpoint(endpoint, SsoMode::Forward, None)
        .await;

    let err = manager.on_unauthorized(endpoint).await.expect_err("sso 401");
    assert!(matches!(err, AuthError::Revoked401 { .. }));

    let entry = manager.entry(endpoint).await;
    assert!(entry.sso_attempt_failed);
    assert_eq!(entry.state, AuthState::Failed);
}

#[tokio::test]
async fn forwarding_injects_aggregator_id_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(TokenStore::open(dir.path()).expect("open store"));
    let aggregator_endpoint = "https://muster.local/mcp";
    let config = AuthConfig {
        aggregator_endpoint: Some(aggregator_endpoint.to_string()),
        ..AuthConfig::default()
    };
    let manager = AuthManager::new(Arc::clone(&store), config);
    store
        .put(
            aggregator_endpoint,
            &stored_token(
                "https://idp.example",
                Utc::now() + Duration::seconds(600),
                None,
            ),
        )
        .await
        .expect("seed aggregator token");

    let upstream = "https://github.example/mcp";
    manager
        .configure_endpoint(upstream, SsoMode::Forward, None)
        .await;

    let bearer = manager.bearer_for(upstream).await.expect("bearer");
    assert_eq!(bearer.as_deref(), Some("id-token"));
    assert_eq!(manager.state(upstream).await, AuthState::Forwarded);
}

#[tokio::test]
async fn token_exchange_posts_rfc8693_grant() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange",
        ))
        .and(body_string_contains("audience=github-mcp"))
        .and(body_string_contains("subject_token=id-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "exchanged-access",
            "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
            "token_type": "bearer",
            "expires_in": 600,
        })))
        .mount(&idp)
        .await;

    let http = reqwest::Client::new();
    let exchanged = exchange_token(
        &http,
        &format!("{}/token", idp.uri()),
        "muster",
        "id-token",
        "github-mcp",
    )
    .await
    .expect("exchange");
    assert_eq!(exchanged.access_token, "exchanged-access");
    assert_eq!(exchanged.expires_in, Some(600));
}

#[tokio::test]
async fn logout_deletes_token_and_returns_to_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (manager, store) = manager_with_store(dir.path());
    let endpoint = "https://mcp.example";
    store
        .put(
            endpoint,
            &stored_token(
                "https://idp.example",
                Utc::now() + Duration::seconds(600),
                None,
            ),
        )
        .await
        .expect("seed");
    // Mark it authenticated first.
    manager.ensure_fresh(endpoint).await.expect("fresh");

    manager.logout(endpoint).await.expect("logout");
    assert!(matches!(
        store.get(endpoint).await,
        Err(TokenStoreError::NotFound { .. })
    ));
    assert_eq!(manager.state(endpoint).await, AuthState::PendingAuth);
}
