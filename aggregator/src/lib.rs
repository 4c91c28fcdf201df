//! The muster aggregator: one MCP endpoint over a fleet of upstream MCP
//! servers, plus the service orchestrator and auth manager wired behind it.
//!
//! [`Muster`] is the composition root. It owns the token store, auth
//! manager, upstream pool, capability index, and orchestrator, registers
//! the `core_*` admin tools, and serves the aggregated surface over stdio
//! or streamable HTTP.

mod builtins;
mod core;
mod denylist;
mod http;
mod index;
mod service;

pub use crate::core::AggregatorCore;
pub use crate::core::BuiltinHandler;
pub use crate::core::CORE_TOOL_PREFIX;
pub use crate::denylist::DEFAULT_DENYLIST;
pub use crate::denylist::Denylist;
pub use crate::http::HttpAuthConfig;
pub use crate::index::CapabilityIndex;
pub use crate::index::CapabilitySnapshot;
pub use crate::service::AggregatorService;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use muster_auth::AuthConfig;
use muster_auth::AuthManager;
use muster_orchestrator::Orchestrator;
use muster_orchestrator::ServiceClass;
use muster_orchestrator::Workflow;
use muster_protocol::EventLog;
use muster_protocol::ToolInvoker;
use muster_token_store::TokenStore;
use muster_upstream::UpstreamManager;
use muster_upstream::UpstreamSpec;

/// Structured configuration handed in by the outer shell (CLI/YAML loading
/// is the collaborator's concern).
#[derive(Default)]
pub struct MusterConfig {
    pub upstreams: Vec<UpstreamSpec>,
    pub service_classes: Vec<ServiceClass>,
    pub workflows: Vec<Workflow>,
    pub auth: AuthConfig,
    /// Require a bearer on the inbound HTTP surface.
    pub require_auth: bool,
    pub resource_metadata_url: Option<String>,
    /// Extra destructive tool names on top of [`DEFAULT_DENYLIST`].
    pub denylist: Vec<String>,
    /// Allow destructive tools.
    pub yolo: bool,
    /// Override the token directory (tests); defaults to the per-user
    /// config dir.
    pub token_dir: Option<PathBuf>,
}

/// Fully wired control plane.
pub struct Muster {
    core: Arc<AggregatorCore>,
    orchestrator: Arc<Orchestrator>,
    auth: Arc<AuthManager>,
    pool: Arc<UpstreamManager>,
    events: Arc<EventLog>,
    http_auth: HttpAuthConfig,
    cancel: CancellationToken,
}

impl Muster {
    pub async fn new(config: MusterConfig) -> anyhow::Result<Self> {
        let store = Arc::new(match &config.token_dir {
            Some(dir) => TokenStore::open(dir)?,
            None => TokenStore::open_default()?,
        });
        let aggregator_endpoint = config.auth.aggregator_endpoint.clone();
        let auth = Arc::new(AuthManager::new(Arc::clone(&store), config.auth));
        let events = Arc::new(EventLog::default());
        let (pool, events_rx) = UpstreamManager::new(Arc::clone(&auth));

        let denylist = Denylist::new(config.denylist.into_iter(), config.yolo);
        let core = AggregatorCore::new(
            Arc::clone(&pool),
            Arc::clone(&auth),
            denylist,
            Arc::clone(&events),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&core) as Arc<dyn ToolInvoker>,
            Arc::clone(&events),
        ));
        for class in config.service_classes {
            orchestrator.classes().insert(class).await;
        }
        for workflow in config.workflows {
            orchestrator.workflows().insert(workflow).await;
        }
        builtins::register_all(&core, &orchestrator).await;

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&core).run_event_loop(events_rx));

        // A protected aggregator starts in pending-auth mode when no valid
        // token exists yet; a store watcher hot-swaps the surface once a
        // login (from any process) lands.
        if config.require_auth
            && let Some(endpoint) = aggregator_endpoint
        {
            let pending = match store.get(&endpoint).await {
                Ok(token) => token.needs_refresh(),
                Err(_) => true,
            };
            if pending {
                core.set_pending_auth(true).await;
                spawn_pending_auth_watcher(
                    Arc::clone(&core),
                    Arc::clone(&store),
                    endpoint,
                    cancel.clone(),
                );
            }
        }

        for spec in config.upstreams {
            if let Some(endpoint) = spec.endpoint() {
                auth.configure_endpoint(endpoint, Default::default(), None)
                    .await;
            }
            if let Err(err) = pool.add(spec).await {
                warn!(%err, "failed to register upstream");
            }
        }

        Ok(Self {
            core,
            orchestrator,
            auth,
            pool,
            events,
            http_auth: HttpAuthConfig {
                require_auth: config.require_auth,
                resource_metadata_url: config.resource_metadata_url,
            },
            cancel,
        })
    }

    pub fn core(&self) -> &Arc<AggregatorCore> {
        &self.core
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Serve over streamable HTTP; returns the bound address.
    pub async fn serve_http(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        http::serve_http(
            Arc::clone(&self.core),
            addr,
            self.http_auth.clone(),
            self.cancel.clone(),
        )
        .await
    }

    /// Serve over stdio until the attached client disconnects.
    pub async fn serve_stdio(&self) -> anyhow::Result<()> {
        http::serve_stdio(Arc::clone(&self.core)).await
    }

    /// Start all auto-start services in dependency order.
    pub async fn start_services(&self) -> Vec<(String, Result<(), String>)> {
        self.orchestrator.start_all().await
    }

    pub fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
        self.pool.shutdown();
    }
}

/// Poll the token store until a valid token appears for the aggregator
/// endpoint, then publish the full tool surface (exactly one swap).
fn spawn_pending_auth_watcher(
    core: Arc<AggregatorCore>,
    store: Arc<TokenStore>,
    endpoint: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match store.get(&endpoint).await {
                Ok(token) if !token.needs_refresh() => {
                    info!(endpoint = %endpoint, "authentication completed; publishing full tool surface");
                    core.set_pending_auth(false).await;
                    return;
                }
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use muster_protocol::AUTHENTICATE_TOOL;
    use muster_protocol::mcp::CallToolResult;

    async fn test_muster(dir: &std::path::Path) -> Muster {
        Muster::new(MusterConfig {
            token_dir: Some(dir.to_path_buf()),
            ..MusterConfig::default()
        })
        .await
        .expect("muster")
    }

    #[tokio::test]
    async fn core_tools_are_registered_and_dispatchable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let core = muster.core();

        let tools = core.list_tools().await;
        let names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
        for expected in [
            "core_service_list",
            "core_service_create",
            "core_service_start",
            "core_serviceclass_list",
            "core_serviceclass_available",
            "core_workflow_list",
            "core_mcpserver_list",
            "core_mcpserver_create",
            "core_events",
            "core_auth_login",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }

        let result = core.call_tool("core_service_list", None).await.expect("call");
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn unknown_tools_return_is_error_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let result = muster
            .core()
            .call_tool("no_such_tool", None)
            .await
            .expect("call");
        assert_eq!(result.is_error, Some(true));
        assert!(result.text_content().contains("tool not found"));
    }

    #[tokio::test]
    async fn denylist_refuses_before_dispatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let result = muster
            .core()
            .call_tool("core_service_delete", Some(json!({ "name": "x" })))
            .await
            .expect("call");
        assert_eq!(result.is_error, Some(true));
        assert!(result.text_content().contains("denylist"));
    }

    #[tokio::test]
    async fn yolo_allows_denylisted_tools_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = Muster::new(MusterConfig {
            token_dir: Some(dir.path().to_path_buf()),
            yolo: true,
            ..MusterConfig::default()
        })
        .await
        .expect("muster");
        // Reaches the orchestrator, which reports the unknown service.
        let result = muster
            .core()
            .call_tool("core_service_delete", Some(json!({ "name": "ghost" })))
            .await
            .expect("call");
        assert!(result.text_content().contains("unknown service"));
    }

    #[tokio::test]
    async fn service_lifecycle_via_core_tools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let core = muster.core();

        // A class whose lifecycle drives other core tools, so everything
        // stays in-process.
        muster
            .orchestrator()
            .classes()
            .insert(
                serde_json::from_value(json!({
                    "name": "noop",
                    "start": { "tool": "core_events" },
                    "stop": { "tool": "core_events" },
                }))
                .expect("class"),
            )
            .await;

        let created = core
            .call_tool(
                "core_service_create",
                Some(json!({ "name": "svc", "serviceClassName": "noop", "args": {} })),
            )
            .await
            .expect("create");
        assert!(created.is_success(), "{created:?}");

        let started = core
            .call_tool("core_service_start", Some(json!({ "name": "svc" })))
            .await
            .expect("start");
        assert!(started.is_success(), "{started:?}");

        let status = core
            .call_tool("core_service_status", Some(json!({ "name": "svc" })))
            .await
            .expect("status");
        let payload = status.structured_content.expect("structured status");
        assert_eq!(payload["state"], json!("running"));
    }

    #[tokio::test]
    async fn core_namespace_never_resolves_to_upstream_tools() {
        use rmcp::model::Tool;

        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let core = muster.core();

        // An upstream configured with `toolPrefix: "core_"` publishes
        // `core_widget`; the reserved namespace must not dispatch it.
        assert!(core.index().apply_upstream(muster_upstream::UpstreamSnapshot {
            name: "sneaky".to_string(),
            prefix: "core_".to_string(),
            tools: vec![Tool::new(
                "widget".to_string(),
                "Widget tool".to_string(),
                std::sync::Arc::new(serde_json::Map::new()),
            )],
            resources: Vec::new(),
            prompts: Vec::new(),
        }));

        assert!(!core.has_tool("core_widget").await);
        let result = core
            .call_tool("core_widget", None)
            .await
            .expect("call");
        assert_eq!(result.is_error, Some(true));
        assert!(result.text_content().contains("tool not found"));

        // Real builtins still dispatch.
        let result = core.call_tool("core_service_list", None).await.expect("call");
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn pending_auth_exposes_only_the_synthetic_tool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let core = muster.core();

        core.set_pending_auth(true).await;
        let tools = core.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name.as_ref(), AUTHENTICATE_TOOL);
        assert!(core.has_tool(AUTHENTICATE_TOOL).await);
        assert!(!core.has_tool("core_service_list").await);

        core.set_pending_auth(false).await;
        assert!(core.has_tool("core_service_list").await);
    }

    #[tokio::test]
    async fn upstream_snapshots_surface_as_prefixed_tools() {
        use rmcp::model::Tool;

        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let core = muster.core();

        let changed = core.index().apply_upstream(muster_upstream::UpstreamSnapshot {
            name: "echo".to_string(),
            prefix: "echo_".to_string(),
            tools: vec![Tool::new(
                "ping".to_string(),
                "Ping the echo server".to_string(),
                std::sync::Arc::new(serde_json::Map::new()),
            )],
            resources: Vec::new(),
            prompts: Vec::new(),
        });
        assert!(changed);

        let names: Vec<String> = core
            .list_tools()
            .await
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert!(names.iter().any(|n| n == "echo_ping"), "{names:?}");
        assert!(core.has_tool("echo_ping").await);

        // Upstream goes away: its tools vanish and calls miss.
        assert!(core.index().remove_upstream("echo"));
        assert!(!core.has_tool("echo_ping").await);
        let result = core
            .call_tool("echo_ping", None)
            .await
            .expect("call after removal");
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn auth_status_resource_is_always_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        let resources = muster.core().list_resources().await;
        assert!(resources
            .iter()
            .any(|r| r.raw.uri == muster_protocol::AUTH_STATUS_URI));

        let read = muster
            .core()
            .read_resource(muster_protocol::AUTH_STATUS_URI)
            .await
            .expect("read");
        assert_eq!(read.contents.len(), 1);
    }

    #[tokio::test]
    async fn events_are_queryable_via_core_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let muster = test_muster(dir.path()).await;
        muster
            .events()
            .record(muster_protocol::MusterEvent::AuthCompleted {
                endpoint: "https://muster.local".to_string(),
            });
        let result: CallToolResult = muster
            .core()
            .call_tool("core_events", Some(json!({ "limit": 10 })))
            .await
            .expect("events");
        assert!(result.is_success());
        assert!(result.text_content().contains("auth_completed"));
    }
}
