use rmcp::handler::client::ClientHandler;
use rmcp::model::ClientInfo;
use rmcp::model::Implementation;
use rmcp::model::ProtocolVersion;
use rmcp::service::NotificationContext;
use rmcp::service::RoleClient;
use tokio::sync::mpsc;
use tracing::warn;

/// Which capability list an upstream reported as changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChanged {
    Tools,
    Resources,
    Prompts,
}

/// Client handler that forwards `*/list_changed` notifications into a
/// bounded channel keyed by upstream name.
///
/// The channel is bounded on purpose: a burst beyond its capacity is
/// dropped with a warning, and the next re-list picks up the final state
/// anyway, so nothing is lost but intermediate churn.
#[derive(Clone)]
pub struct NotificationForwarder {
    upstream: String,
    tx: mpsc::Sender<(String, ListChanged)>,
}

impl NotificationForwarder {
    pub fn new(upstream: impl Into<String>, tx: mpsc::Sender<(String, ListChanged)>) -> Self {
        Self {
            upstream: upstream.into(),
            tx,
        }
    }

    fn forward(&self, changed: ListChanged) {
        if let Err(err) = self.tx.try_send((self.upstream.clone(), changed)) {
            warn!(upstream = %self.upstream, ?changed, %err, "dropping list_changed notification");
        }
    }
}

impl ClientHandler for NotificationForwarder {
    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(ListChanged::Tools);
        std::future::ready(())
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(ListChanged::Resources);
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(ListChanged::Prompts);
        std::future::ready(())
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: Default::default(),
            client_info: Implementation {
                name: "muster-aggregator".to_string(),
                title: Some("Muster".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
        }
    }
}
