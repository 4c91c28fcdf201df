use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rmcp::Peer;
use rmcp::ServiceError;
use rmcp::model::GetPromptResult;
use rmcp::model::Prompt;
use rmcp::model::ReadResourceResult;
use rmcp::model::Resource;
use rmcp::model::ResourceContents;
use rmcp::model::Tool;
use rmcp::service::RoleServer;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

use muster_auth::AuthManager;
use muster_auth::SsoMode;
use muster_protocol::AUTH_STATUS_URI;
use muster_protocol::AuthState;
use muster_protocol::AuthStatusPayload;
use muster_protocol::EventLog;
use muster_protocol::MusterEvent;
use muster_protocol::ServerAuthStatus;
use muster_protocol::ServerStatus;
use muster_protocol::ToolCallError;
use muster_protocol::ToolInvoker;
use muster_protocol::mcp::CallToolResult;
use muster_upstream::PoolEvent;
use muster_upstream::UpstreamError;
use muster_upstream::UpstreamManager;

use crate::denylist::Denylist;
use crate::index::CapabilityIndex;

/// Reserved public-name namespace for the builtin admin surface. Names
/// under it never resolve to upstream tools, whatever prefix an upstream
/// was configured with.
pub const CORE_TOOL_PREFIX: &str = "core_";

/// Handler for one builtin (`core_*`) tool.
pub type BuiltinHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, CallToolResult> + Send + Sync>;

pub struct BuiltinTool {
    pub tool: Tool,
    pub handler: BuiltinHandler,
}

/// The aggregator's dispatch core: denylist → builtin table → capability
/// index → upstream. Also owns the connected-peer registry and the
/// notification fan-out.
pub struct AggregatorCore {
    index: CapabilityIndex,
    pool: Arc<UpstreamManager>,
    auth: Arc<AuthManager>,
    denylist: Denylist,
    builtins: RwLock<HashMap<String, BuiltinTool>>,
    peers: RwLock<Vec<Peer<RoleServer>>>,
    events: Arc<EventLog>,
}

impl AggregatorCore {
    pub fn new(
        pool: Arc<UpstreamManager>,
        auth: Arc<AuthManager>,
        denylist: Denylist,
        events: Arc<EventLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index: CapabilityIndex::new(),
            pool,
            auth,
            denylist,
            builtins: RwLock::new(HashMap::new()),
            peers: RwLock::new(Vec::new()),
            events,
        })
    }

    pub fn index(&self) -> &CapabilityIndex {
        &self.index
    }

    pub fn pool(&self) -> &Arc<UpstreamManager> {
        &self.pool
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Register a builtin tool. Builtins are fixed at startup, before any
    /// client connects.
    pub async fn register_builtin(&self, tool: Tool, handler: BuiltinHandler) {
        let name = tool.name.to_string();
        self.builtins
            .write()
            .await
            .insert(name, BuiltinTool { tool, handler });
    }

    /// Remember a connected MCP client for list_changed fan-out.
    pub async fn register_peer(&self, peer: Peer<RoleServer>) {
        self.peers.write().await.push(peer);
    }

    /// Enter or leave pending-auth mode; on change, connected clients get
    /// one `tools/list_changed`.
    pub async fn set_pending_auth(self: &Arc<Self>, pending: bool) {
        if self.index.set_pending_auth(pending) {
            self.publish_capability_change().await;
        }
    }

    /// The full public tool surface: builtins plus the aggregated union,
    /// or just the synthetic authenticate tool while pending auth.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let snapshot = self.index.load();
        let mut tools: Vec<Tool> = Vec::new();
        if !snapshot.pending_auth {
            let builtins = self.builtins.read().await;
            tools.extend(builtins.values().map(|builtin| builtin.tool.clone()));
        }
        tools.extend(snapshot.tools.values().map(|entry| entry.tool.clone()));
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn list_resources(&self) -> Vec<Resource> {
        let snapshot = self.index.load();
        let mut resources: Vec<Resource> = snapshot
            .resources
            .values()
            .map(|entry| entry.resource.clone())
            .collect();
        resources.push(auth_status_resource());
        resources.sort_by(|a, b| a.raw.uri.cmp(&b.raw.uri));
        resources
    }

    pub async fn list_prompts(&self) -> Vec<Prompt> {
        let snapshot = self.index.load();
        let mut prompts: Vec<Prompt> = snapshot
            .prompts
            .values()
            .map(|entry| entry.prompt.clone())
            .collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ToolCallError> {
        if uri == AUTH_STATUS_URI {
            let payload = self.auth_status().await;
            let json = serde_json::to_string_pretty(&payload)
                .map_err(|err| ToolCallError::Internal(err.to_string()))?;
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents::TextResourceContents {
                    uri: AUTH_STATUS_URI.to_string(),
                    mime_type: Some("application/json".to_string()),
                    text: json,
                    meta: None,
                }],
            });
        }

        let snapshot = self.index.load();
        let entry = snapshot
            .resources
            .get(uri)
            .ok_or_else(|| ToolCallError::Internal(format!("unknown resource `{uri}`")))?;
        let client = self
            .pool
            .client(&entry.upstream)
            .await
            .ok_or_else(|| ToolCallError::Internal(format!(
                "resource owner `{}` is gone",
                entry.upstream
            )))?;
        client
            .read_resource(&entry.original_uri)
            .await
            .map_err(map_upstream_error)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult, ToolCallError> {
        let snapshot = self.index.load();
        let entry = snapshot
            .prompts
            .get(name)
            .ok_or_else(|| ToolCallError::Internal(format!("unknown prompt `{name}`")))?;
        let client = self
            .pool
            .client(&entry.upstream)
            .await
            .ok_or_else(|| ToolCallError::Internal(format!(
                "prompt owner `{}` is gone",
                entry.upstream
            )))?;
        client
            .get_prompt(&entry.original_name, arguments)
            .await
            .map_err(map_upstream_error)
    }

    /// `auth://status` payload for every configured upstream.
    pub async fn auth_status(&self) -> AuthStatusPayload {
        let mut servers = Vec::new();
        for spec in self.pool.specs().await {
            let status = self.pool.status(&spec.name).await.unwrap_or_default();
            let auth_entry = match spec.endpoint() {
                Some(endpoint) => Some(self.auth.entry(endpoint).await),
                None => None,
            };

            let auth_state = auth_entry
                .as_ref()
                .map(|entry| entry.state)
                .unwrap_or(AuthState::NoAuthRequired);
            let needs_login = matches!(
                auth_state,
                AuthState::PendingAuth | AuthState::Expired | AuthState::Failed
            );
            let server_status = if needs_login {
                ServerStatus::AuthRequired
            } else if status.connected {
                ServerStatus::Connected
            } else if status.gave_up {
                ServerStatus::Error
            } else if auth_state == AuthState::Unreachable {
                ServerStatus::Unreachable
            } else {
                ServerStatus::Disconnected
            };

            let (forwarding, exchange, sso_failed, issuer) = match &auth_entry {
                Some(entry) => (
                    entry.sso == SsoMode::Forward,
                    matches!(entry.sso, SsoMode::Exchange { .. }),
                    entry.sso_attempt_failed,
                    entry.issuer.clone(),
                ),
                None => (false, false, false, None),
            };

            servers.push(ServerAuthStatus {
                name: spec.name.clone(),
                status: server_status,
                auth_tool: needs_login.then(|| format!("authenticate_{}", spec.name)),
                issuer,
                token_forwarding_enabled: forwarding,
                token_exchange_enabled: exchange,
                sso_attempt_failed: sso_failed,
            });
        }
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        AuthStatusPayload { servers }
    }

    /// Consume pool events, fold them into the index, and fan out
    /// `list_changed` when the published snapshot moved.
    pub async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<PoolEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                PoolEvent::SnapshotUpdated(snapshot) => {
                    let name = snapshot.name.clone();
                    if self.index.apply_upstream(snapshot) {
                        debug!(upstream = %name, "capabilities updated");
                        self.publish_capability_change().await;
                    }
                    self.events
                        .record(MusterEvent::UpstreamConnected { name });
                }
                PoolEvent::UpstreamGone { name, error } => {
                    if self.index.remove_upstream(&name) {
                        self.publish_capability_change().await;
                    }
                    self.events
                        .record(MusterEvent::UpstreamDisconnected { name, error });
                }
                PoolEvent::StatusChanged { name } => {
                    debug!(upstream = %name, "status changed");
                    if let Some(client) = self.pool.client(&name).await
                        && let Some(endpoint) = client.spec().endpoint()
                    {
                        let entry = self.auth.entry(endpoint).await;
                        if matches!(
                            entry.state,
                            AuthState::PendingAuth | AuthState::Expired | AuthState::Failed
                        ) {
                            self.events.record(MusterEvent::UpstreamAuthRequired {
                                name,
                                issuer: entry.issuer,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Record the change and emit at most one notification set per version
    /// transition. Peers whose transport is gone are dropped.
    async fn publish_capability_change(&self) {
        let snapshot = self.index.load();
        self.events.record(MusterEvent::CapabilitiesChanged {
            version: snapshot.version,
            tools: snapshot.tools.len(),
            resources: snapshot.resources.len(),
            prompts: snapshot.prompts.len(),
        });

        let mut peers = self.peers.write().await;
        if peers.is_empty() {
            return;
        }
        info!(
            version = snapshot.version,
            peers = peers.len(),
            "notifying clients of capability change"
        );
        let mut retained = Vec::with_capacity(peers.len());
        for peer in peers.iter() {
            if peer.is_transport_closed() {
                continue;
            }
            let mut alive = true;
            for notify in [
                peer.notify_tool_list_changed().await,
                peer.notify_resource_list_changed().await,
                peer.notify_prompt_list_changed().await,
            ] {
                match notify {
                    Ok(()) => {}
                    Err(ServiceError::TransportSend(_) | ServiceError::TransportClosed) => {
                        error!("dropping peer: transport closed during notification");
                        alive = false;
                        break;
                    }
                    Err(err) => {
                        error!("failed to notify peer of capability change: {err:?}");
                    }
                }
            }
            if alive {
                retained.push(peer.clone());
            }
        }
        *peers = retained;
    }
}

#[async_trait]
impl ToolInvoker for AggregatorCore {
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ToolCallError> {
        // Denylist wins before any dispatch.
        if let Some(reason) = self.denylist.refuse_reason(name) {
            return Ok(CallToolResult::error(reason));
        }

        let snapshot = self.index.load();
        if snapshot.pending_auth {
            // The only callable surface is the synthetic authenticate tool,
            // which shares the interactive login path.
            if name == muster_protocol::AUTHENTICATE_TOOL {
                if let Some(builtin) = self.builtins.read().await.get("core_auth_login") {
                    let handler = Arc::clone(&builtin.handler);
                    return Ok(handler(None).await);
                }
                return Ok(CallToolResult::error(
                    "authentication flow is not configured",
                ));
            }
            return Ok(CallToolResult::error(format!(
                "authentication required before `{name}` is available"
            )));
        }
        // `core_` is a reserved namespace: such names resolve only through
        // the builtin table. A tool-prefix that makes an upstream tool look
        // like `core_*` must not let it shadow (or extend) the admin
        // surface.
        if name.starts_with(CORE_TOOL_PREFIX) {
            if let Some(builtin) = self.builtins.read().await.get(name) {
                let handler = Arc::clone(&builtin.handler);
                return Ok(handler(arguments).await);
            }
            return Ok(CallToolResult::error(format!("tool not found: {name}")));
        }

        let Some(entry) = snapshot.tools.get(name) else {
            return Ok(CallToolResult::error(format!("tool not found: {name}")));
        };

        self.pool
            .call_tool(&entry.upstream, &entry.original_name, arguments)
            .await
            .map_err(map_upstream_error)
    }

    async fn has_tool(&self, name: &str) -> bool {
        let snapshot = self.index.load();
        if snapshot.pending_auth {
            return snapshot.tools.contains_key(name);
        }
        if name.starts_with(CORE_TOOL_PREFIX) {
            return self.builtins.read().await.contains_key(name);
        }
        snapshot.tools.contains_key(name)
    }
}

fn map_upstream_error(err: UpstreamError) -> ToolCallError {
    match err {
        UpstreamError::AuthRequired { name } => ToolCallError::AuthRequired { upstream: name },
        UpstreamError::Timeout { name, timeout_ms } => ToolCallError::Timeout {
            tool: name,
            timeout_ms,
        },
        other => ToolCallError::Transport(other.to_string()),
    }
}

fn auth_status_resource() -> Resource {
    let raw = rmcp::model::RawResource {
        uri: AUTH_STATUS_URI.to_string(),
        name: "auth-status".to_string(),
        title: Some("Authentication status".to_string()),
        description: Some(
            "Authentication and SSO status of every configured upstream MCP server".to_string(),
        ),
        mime_type: Some("application/json".to_string()),
        size: None,
        icons: None,
        meta: None,
    };
    Resource::new(raw, None)
}
