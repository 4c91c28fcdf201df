//! The MCP server surface: one [`rmcp::handler::server::ServerHandler`]
//! shared by the stdio and streamable-HTTP transports.

use std::sync::Arc;

use rmcp::ErrorData as McpError;
use rmcp::handler::server::ServerHandler;
use rmcp::model::CallToolRequestParam;
use rmcp::model::CallToolResult;
use rmcp::model::Content;
use rmcp::model::GetPromptRequestParam;
use rmcp::model::GetPromptResult;
use rmcp::model::InitializeRequestParam;
use rmcp::model::InitializeResult;
use rmcp::model::ListPromptsResult;
use rmcp::model::ListResourcesResult;
use rmcp::model::ListToolsResult;
use rmcp::model::PaginatedRequestParam;
use rmcp::model::ReadResourceRequestParam;
use rmcp::model::ReadResourceResult;
use rmcp::model::ServerCapabilities;
use rmcp::model::ServerInfo;
use rmcp::service::RequestContext;
use rmcp::service::RoleServer;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use muster_protocol::ToolCallError;
use muster_protocol::ToolInvoker;

use crate::core::AggregatorCore;

#[derive(Clone)]
pub struct AggregatorService {
    core: Arc<AggregatorCore>,
}

impl AggregatorService {
    pub fn new(core: Arc<AggregatorCore>) -> Self {
        Self { core }
    }
}

impl ServerHandler for AggregatorService {
    async fn initialize(
        &self,
        request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        debug!(
            client = %request.client_info.name,
            version = %request.client_info.version,
            "client connected"
        );
        // Remember the peer so capability changes reach it.
        self.core.register_peer(context.peer).await;
        Ok(self.get_info())
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.map(Value::Object);
        match self.core.call_tool(&request.name, arguments).await {
            Ok(result) => Ok(to_rmcp_result(result)),
            Err(ToolCallError::AuthRequired { upstream }) => Err(McpError::invalid_request(
                format!("authentication required for upstream `{upstream}`"),
                Some(json!({ "authTool": format!("authenticate_{upstream}") })),
            )),
            Err(err) => Err(McpError::internal_error(err.to_string(), None)),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.core.list_tools().await,
            next_cursor: None,
            meta: None,
        })
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            resources: self.core.list_resources().await,
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        ReadResourceRequestParam { uri }: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.core.read_resource(&uri).await.map_err(|err| {
            McpError::resource_not_found(err.to_string(), Some(json!({ "uri": uri })))
        })
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            prompts: self.core.list_prompts().await,
            next_cursor: None,
            meta: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.core
            .get_prompt(&request.name, request.arguments)
            .await
            .map_err(|err| McpError::invalid_params(err.to_string(), None))
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: rmcp::model::Implementation {
                name: "muster-aggregator".to_string(),
                title: Some("Muster".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            ..ServerInfo::default()
        }
    }
}

/// Internal mirror result → SDK result. Content objects were stored as raw
/// JSON; anything that fails to parse back is preserved as text.
fn to_rmcp_result(result: muster_protocol::mcp::CallToolResult) -> CallToolResult {
    let content = result
        .content
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Content>(value.clone()) {
            Ok(content) => Some(content),
            Err(_) => value.as_str().map(Content::text),
        })
        .collect();
    CallToolResult {
        content,
        structured_content: result.structured_content,
        is_error: result.is_error,
        meta: result
            .meta
            .and_then(|meta| serde_json::from_value(meta).ok()),
    }
}
