//! Transport hosting for the aggregator service: streamable HTTP behind
//! axum for remote clients, stdio for local IDE integration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use rmcp::ServiceExt;
use rmcp::transport::streamable_http_server::StreamableHttpServerConfig;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::AggregatorCore;
use crate::service::AggregatorService;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Inbound auth policy for the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct HttpAuthConfig {
    pub require_auth: bool,
    /// Advertised in the 401 challenge so clients can discover the issuer.
    pub resource_metadata_url: Option<String>,
}

/// Serve the aggregator over streamable HTTP at `/mcp`. Returns the bound
/// address; the server task runs until `cancel` fires.
pub async fn serve_http(
    core: Arc<AggregatorCore>,
    addr: SocketAddr,
    auth: HttpAuthConfig,
    cancel: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    let session_manager = Arc::new(LocalSessionManager::default());
    let service: StreamableHttpService<AggregatorService, LocalSessionManager> =
        StreamableHttpService::new(
            move || Ok(AggregatorService::new(Arc::clone(&core))),
            session_manager,
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(SSE_KEEP_ALIVE),
            },
        );

    let mut router = Router::new().nest_service("/mcp", service);
    if auth.require_auth {
        router = router.layer(middleware::from_fn_with_state(
            Arc::new(auth),
            require_bearer,
        ));
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(%local, "aggregator listening");
    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(%err, "aggregator http server exited");
        }
    });
    Ok(local)
}

/// Serve the aggregator over stdio until the client disconnects.
pub async fn serve_stdio(core: Arc<AggregatorCore>) -> anyhow::Result<()> {
    let service = AggregatorService::new(core);
    let running = service.serve(rmcp::transport::io::stdio()).await?;
    running.waiting().await?;
    Ok(())
}

/// Reject unauthenticated requests with the discovery challenge. Bearer
/// validation itself is the IdP's job; sessions are correlated by the
/// `Mcp-Session-Id` header the streamable-HTTP session manager tracks.
async fn require_bearer(
    State(auth): State<Arc<HttpAuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let has_bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| !token.trim().is_empty());
    if has_bearer {
        return next.run(request).await;
    }

    let challenge = match &auth.resource_metadata_url {
        Some(url) => format!("Bearer resource_metadata=\"{url}\""),
        None => "Bearer".to_string(),
    };
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use muster_auth::AuthConfig;
    use muster_auth::AuthManager;
    use muster_protocol::EventLog;
    use muster_token_store::TokenStore;
    use muster_upstream::UpstreamManager;

    use crate::denylist::Denylist;

    async fn test_core(dir: &std::path::Path) -> Arc<AggregatorCore> {
        let store = Arc::new(TokenStore::open(dir).expect("store"));
        let auth = Arc::new(AuthManager::new(store, AuthConfig::default()));
        let (pool, _events_rx) = UpstreamManager::new(Arc::clone(&auth));
        AggregatorCore::new(pool, auth, Denylist::default(), Arc::new(EventLog::default()))
    }

    #[tokio::test]
    async fn unauthenticated_requests_get_the_bearer_challenge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = test_core(dir.path()).await;
        let cancel = CancellationToken::new();
        let local = serve_http(
            core,
            "127.0.0.1:0".parse().expect("addr"),
            HttpAuthConfig {
                require_auth: true,
                resource_metadata_url: Some("https://idp.example/.well-known/rs".to_string()),
            },
            cancel.clone(),
        )
        .await
        .expect("serve");

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{local}/mcp"))
            .json(&serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert!(challenge.contains("resource_metadata=\"https://idp.example/.well-known/rs\""));
        cancel.cancel();
    }
}
