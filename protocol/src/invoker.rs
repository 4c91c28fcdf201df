use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::mcp::CallToolResult;

/// Errors surfaced by [`ToolInvoker::call_tool`].
///
/// Validation failures (`tools/call` against an unknown or denied name) are
/// not errors at this level: they come back as `CallToolResult` with
/// `isError: true` so MCP clients see them the same way regardless of where
/// the call originated.
#[derive(Debug, Error)]
pub enum ToolCallError {
    /// The upstream owning the tool requires (re-)authentication.
    #[error("authentication required for upstream `{upstream}`")]
    AuthRequired { upstream: String },

    /// The call did not complete within its deadline.
    #[error("tool call `{tool}` timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// Transport-level failure; one-shot calls fail fast and callers decide
    /// whether to retry.
    #[error("tool call failed: {0}")]
    Transport(String),

    #[error("{0}")]
    Internal(String),
}

/// Dispatch seam for MCP tool calls.
///
/// Implemented by the aggregator core; consumed by the orchestrator (service
/// lifecycle steps) and by builtin tool handlers, so admin tools and
/// upstream tools compose identically.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke a tool by public (possibly prefixed) name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ToolCallError>;

    /// Whether `name` currently resolves to a callable tool.
    async fn has_tool(&self, name: &str) -> bool;
}
