use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use rmcp::ErrorData as McpError;
use rmcp::Peer;
use rmcp::ServiceError;
use rmcp::ServiceExt;
use rmcp::handler::server::ServerHandler;
use rmcp::model::CallToolRequestParam;
use rmcp::model::CallToolResult;
use rmcp::model::Content;
use rmcp::model::InitializeRequestParam;
use rmcp::model::InitializeResult;
use rmcp::model::ListResourcesResult;
use rmcp::model::ListToolsResult;
use rmcp::model::PaginatedRequestParam;
use rmcp::model::ReadResourceRequestParam;
use rmcp::model::ReadResourceResult;
use rmcp::model::ServerCapabilities;
use rmcp::model::ServerInfo;
use rmcp::model::Tool;
use rmcp::service::RequestContext;
use rmcp::service::RoleClient;
use rmcp::service::RoleServer;
use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use muster_auth::AuthManager;
use muster_auth::LoginOptions;
use muster_protocol::AUTHENTICATE_TOOL;
use muster_token_store::TokenStore;

use crate::walk::walk_upstream_auth;

const TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(2);

type Aggregator = Arc<RunningService<RoleClient, ()>>;

struct ProxyState {
    endpoint: String,
    auth: Arc<AuthManager>,
    store: Arc<TokenStore>,
    aggregator: RwLock<Option<Aggregator>>,
    peers: RwLock<Vec<Peer<RoleServer>>>,
    /// Guards the single hot-swap notification.
    swapped: AtomicBool,
}

/// Stdio MCP server bridging an IDE to the aggregator, handling
/// pending-auth mode.
#[derive(Clone)]
pub struct AgentProxy {
    state: Arc<ProxyState>,
}

impl AgentProxy {
    pub fn new(endpoint: impl Into<String>, auth: Arc<AuthManager>) -> Self {
        let store = Arc::clone(auth.store());
        Self {
            state: Arc::new(ProxyState {
                endpoint: endpoint.into(),
                auth,
                store,
                aggregator: RwLock::new(None),
                peers: RwLock::new(Vec::new()),
                swapped: AtomicBool::new(false),
            }),
        }
    }

    /// Try to connect immediately (no-auth aggregators connect right away);
    /// otherwise stay in pending-auth mode and let the poller take over.
    pub async fn try_connect(&self) -> bool {
        match connect_aggregator(&self.state).await {
            Ok(service) => {
                *self.state.aggregator.write().await = Some(Arc::new(service));
                self.state.swapped.store(true, Ordering::SeqCst);
                true
            }
            Err(err) => {
                info!(%err, "aggregator not reachable yet; entering pending-auth mode");
                false
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.aggregator.read().await.is_some()
    }

    /// Watch the token store; on the first valid token, connect and emit
    /// one `tools/list_changed`.
    pub fn spawn_token_watcher(&self, cancel: CancellationToken) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TOKEN_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if state.aggregator.read().await.is_some() {
                    return;
                }
                let token_ready = matches!(
                    state.store.get(&state.endpoint).await,
                    Ok(token) if !token.needs_refresh()
                );
                if !token_ready {
                    continue;
                }
                match connect_aggregator(&state).await {
                    Ok(service) => {
                        *state.aggregator.write().await = Some(Arc::new(service));
                        publish_swap(&state).await;
                        // Sequentially log in to upstreams still pending;
                        // one IdP session then carries SSO to the rest.
                        if let Some(aggregator) = state.aggregator.read().await.clone() {
                            walk_upstream_auth(&aggregator).await;
                        }
                        return;
                    }
                    Err(err) => warn!(%err, "token present but aggregator connect failed"),
                }
            }
        });
    }
}

/// One-time swap from the synthetic tool to the full surface (exactly one
/// `tools/list_changed`).
async fn publish_swap(state: &Arc<ProxyState>) {
    if state.swapped.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("authentication complete; importing aggregated tool set");
    let mut peers = state.peers.write().await;
    let mut retained = Vec::with_capacity(peers.len());
    for peer in peers.iter() {
        if peer.is_transport_closed() {
            continue;
        }
        match peer.notify_tool_list_changed().await {
            Ok(()) => retained.push(peer.clone()),
            Err(ServiceError::TransportSend(_) | ServiceError::TransportClosed) => {
                warn!("dropping peer during hot-swap notification");
            }
            Err(err) => {
                warn!("failed to notify peer of hot-swap: {err:?}");
                retained.push(peer.clone());
            }
        }
    }
    *peers = retained;
}

async fn connect_aggregator(
    state: &Arc<ProxyState>,
) -> Result<RunningService<RoleClient, ()>, anyhow::Error> {
    let mut headers = HeaderMap::new();
    if let Ok(session) = HeaderValue::from_str(state.auth.session_id()) {
        headers.insert(HeaderName::from_static("mcp-session-id"), session);
    }
    if let Ok(token) = state.store.get(&state.endpoint).await
        && let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token.access_token))
    {
        headers.insert(AUTHORIZATION, value);
    }
    let http = reqwest::Client::builder().default_headers(headers).build()?;
    let transport = StreamableHttpClientTransport::with_client(
        http,
        StreamableHttpClientTransportConfig::with_uri(state.endpoint.clone()),
    );
    let service = ().serve(transport).await?;
    Ok(service)
}

impl ServerHandler for AgentProxy {
    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        self.state.peers.write().await.push(context.peer);
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        match self.state.aggregator.read().await.clone() {
            Some(aggregator) => aggregator
                .list_tools(request)
                .await
                .map_err(|err| McpError::internal_error(err.to_string(), None)),
            None => Ok(ListToolsResult {
                tools: vec![pending_auth_tool()],
                next_cursor: None,
                meta: None,
            }),
        }
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if request.name.as_ref() == AUTHENTICATE_TOOL
            && self.state.aggregator.read().await.is_none()
        {
            return self.handle_authenticate().await;
        }

        match self.state.aggregator.read().await.clone() {
            Some(aggregator) => aggregator
                .call_tool(request)
                .await
                .map_err(|err| McpError::internal_error(err.to_string(), None)),
            None => Ok(CallToolResult {
                content: vec![Content::text(format!(
                    "not authenticated; call `{AUTHENTICATE_TOOL}` first"
                ))],
                structured_content: None,
                is_error: Some(true),
                meta: None,
            }),
        }
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        match self.state.aggregator.read().await.clone() {
            Some(aggregator) => aggregator
                .list_resources(request)
                .await
                .map_err(|err| McpError::internal_error(err.to_string(), None)),
            None => Ok(ListResourcesResult {
                resources: Vec::new(),
                next_cursor: None,
                meta: None,
            }),
        }
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        match self.state.aggregator.read().await.clone() {
            Some(aggregator) => aggregator
                .read_resource(request)
                .await
                .map_err(|err| McpError::internal_error(err.to_string(), None)),
            None => Err(McpError::resource_not_found(
                "not authenticated",
                Some(json!({ "uri": request.uri })),
            )),
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .build(),
            server_info: rmcp::model::Implementation {
                name: "muster-agent".to_string(),
                title: Some("Muster Agent".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            ..ServerInfo::default()
        }
    }
}

impl AgentProxy {
    async fn handle_authenticate(&self) -> Result<CallToolResult, McpError> {
        let state = Arc::clone(&self.state);
        match state
            .auth
            .login(&state.endpoint, LoginOptions::default())
            .await
        {
            Ok(_token) => match connect_aggregator(&state).await {
                Ok(service) => {
                    *state.aggregator.write().await = Some(Arc::new(service));
                    publish_swap(&state).await;
                    Ok(CallToolResult {
                        content: vec![Content::text(
                            "authenticated; the full tool set is now available",
                        )],
                        structured_content: None,
                        is_error: Some(false),
                        meta: None,
                    })
                }
                Err(err) => Ok(CallToolResult {
                    content: vec![Content::text(format!(
                        "authenticated, but connecting to the aggregator failed: {err}"
                    ))],
                    structured_content: None,
                    is_error: Some(true),
                    meta: None,
                }),
            },
            Err(err) => Ok(CallToolResult {
                content: vec![Content::text(format!("authentication failed: {err}"))],
                structured_content: None,
                is_error: Some(true),
                meta: None,
            }),
        }
    }
}

fn pending_auth_tool() -> Tool {
    let schema = json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false,
    });
    let schema_object = match schema {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Tool::new(
        AUTHENTICATE_TOOL,
        "Authenticate against the muster aggregator. After login the full aggregated tool set replaces this tool.",
        Arc::new(schema_object),
    )
}

/// Run the stdio bridge until the IDE disconnects.
pub async fn serve_stdio_proxy(proxy: AgentProxy, cancel: CancellationToken) -> anyhow::Result<()> {
    proxy.try_connect().await;
    proxy.spawn_token_watcher(cancel.clone());
    let running = proxy.serve(rmcp::transport::io::stdio()).await?;
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = running.waiting() => {
            result?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_auth::AuthConfig;

    fn test_proxy(dir: &std::path::Path) -> AgentProxy {
        let store = Arc::new(TokenStore::open(dir).expect("store"));
        let auth = Arc::new(AuthManager::new(store, AuthConfig::default()));
        AgentProxy::new("http://127.0.0.1:1/mcp", auth)
    }

    #[tokio::test]
    async fn pending_mode_exposes_only_the_authenticate_tool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proxy = test_proxy(dir.path());
        assert!(!proxy.is_connected().await);

        let tool = pending_auth_tool();
        assert_eq!(tool.name.as_ref(), AUTHENTICATE_TOOL);
    }

    #[tokio::test]
    async fn swap_notification_fires_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proxy = test_proxy(dir.path());

        publish_swap(&proxy.state).await;
        assert!(proxy.state.swapped.load(Ordering::SeqCst));
        // Second publish is a no-op.
        publish_swap(&proxy.state).await;
        assert!(proxy.state.swapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn try_connect_fails_cleanly_when_unreachable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proxy = test_proxy(dir.path());
        assert!(!proxy.try_connect().await);
        assert!(!proxy.is_connected().await);
    }
}
