use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::DEFAULT_CALL_TIMEOUT_SECS;
use crate::error::UpstreamError;

/// Transport for one upstream MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Spawn a command and exchange newline-delimited JSON-RPC over pipes.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Single request/response per call with optional server push.
    StreamableHttp { url: String },
    /// Request channel for calls plus an event stream for notifications.
    Sse { url: String },
}

impl TransportConfig {
    /// Infer the transport for a URL-shaped endpoint: a `/sse` path suffix
    /// means SSE, anything else streamable HTTP.
    pub fn infer_from_url(url: &str) -> Self {
        let path = url.split('?').next().unwrap_or(url);
        if path.trim_end_matches('/').ends_with("/sse") {
            TransportConfig::Sse {
                url: url.to_string(),
            }
        } else {
            TransportConfig::StreamableHttp {
                url: url.to_string(),
            }
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::StreamableHttp { url } | TransportConfig::Sse { url } => {
                Some(url.as_str())
            }
        }
    }
}

/// Configuration for one upstream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Public-name prefix for this upstream's tools; defaults to
    /// `<name>_`.
    #[serde(default)]
    pub tool_prefix: Option<String>,
    /// Per-call deadline in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_auto_start() -> bool {
    true
}

impl UpstreamSpec {
    /// Parse the argument object of `core_mcpserver_create`.
    pub fn from_create_args(args: &serde_json::Value) -> Result<Self, UpstreamError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CreateArgs {
            name: String,
            #[serde(rename = "type")]
            kind: Option<String>,
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            url: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            auto_start: Option<bool>,
            timeout: Option<u64>,
            tool_prefix: Option<String>,
        }

        let parsed: CreateArgs = serde_json::from_value(args.clone())
            .map_err(|err| UpstreamError::Config(err.to_string()))?;

        let transport = match (parsed.kind.as_deref(), parsed.command, parsed.url) {
            (Some("stdio"), Some(command), _) => TransportConfig::Stdio {
                command,
                args: parsed.args,
                env: parsed.env,
            },
            (Some("stdio"), None, _) => {
                return Err(UpstreamError::Config(
                    "stdio upstream requires `command`".to_string(),
                ));
            }
            (Some("streamable-http"), _, Some(url)) => TransportConfig::StreamableHttp { url },
            (Some("sse"), _, Some(url)) => TransportConfig::Sse { url },
            (Some("streamable-http" | "sse"), _, None) => {
                return Err(UpstreamError::Config(
                    "http upstream requires `url`".to_string(),
                ));
            }
            // Transport omitted: infer from whichever endpoint field is set.
            (None, Some(command), None) => TransportConfig::Stdio {
                command,
                args: parsed.args,
                env: parsed.env,
            },
            (None, _, Some(url)) => TransportConfig::infer_from_url(&url),
            (Some(other), _, _) => {
                return Err(UpstreamError::Config(format!(
                    "unknown transport type `{other}`"
                )));
            }
            (None, None, None) => {
                return Err(UpstreamError::Config(
                    "upstream requires `command` or `url`".to_string(),
                ));
            }
        };

        Ok(UpstreamSpec {
            name: parsed.name,
            transport,
            tool_prefix: parsed.tool_prefix,
            timeout: parsed.timeout,
            auto_start: parsed.auto_start.unwrap_or(true),
            headers: parsed.headers,
        })
    }

    /// Prefix applied to this upstream's public tool and prompt names.
    pub fn prefix(&self) -> String {
        match &self.tool_prefix {
            Some(prefix) => prefix.clone(),
            None => format!("{}_", self.name),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS))
    }

    /// Endpoint identity used for token storage and auth state.
    pub fn endpoint(&self) -> Option<&str> {
        self.transport.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sse_suffix_selects_sse_transport() {
        assert_eq!(
            TransportConfig::infer_from_url("https://mcp.example/sse"),
            TransportConfig::Sse {
                url: "https://mcp.example/sse".to_string()
            }
        );
        assert_eq!(
            TransportConfig::infer_from_url("https://mcp.example/sse?token=1"),
            TransportConfig::Sse {
                url: "https://mcp.example/sse?token=1".to_string()
            }
        );
        assert_eq!(
            TransportConfig::infer_from_url("https://mcp.example/mcp"),
            TransportConfig::StreamableHttp {
                url: "https://mcp.example/mcp".to_string()
            }
        );
    }

    #[test]
    fn create_args_parse_stdio() {
        let spec = UpstreamSpec::from_create_args(&json!({
            "name": "echo",
            "type": "stdio",
            "command": "echo-server",
            "autoStart": true,
        }))
        .expect("spec");
        assert_eq!(spec.name, "echo");
        assert!(matches!(spec.transport, TransportConfig::Stdio { .. }));
        assert!(spec.auto_start);
        assert_eq!(spec.prefix(), "echo_");
    }

    #[test]
    fn create_args_infer_transport_from_url() {
        let spec = UpstreamSpec::from_create_args(&json!({
            "name": "events",
            "url": "https://mcp.example/sse",
        }))
        .expect("spec");
        assert!(matches!(spec.transport, TransportConfig::Sse { .. }));
    }

    #[test]
    fn create_args_reject_stdio_without_command() {
        let err = UpstreamSpec::from_create_args(&json!({
            "name": "broken",
            "type": "stdio",
        }))
        .expect_err("must fail");
        assert!(matches!(err, UpstreamError::Config(_)));
    }

    #[test]
    fn custom_prefix_wins_over_default() {
        let spec = UpstreamSpec::from_create_args(&json!({
            "name": "gh",
            "url": "https://mcp.example/mcp",
            "toolPrefix": "github_",
        }))
        .expect("spec");
        assert_eq!(spec.prefix(), "github_");
    }
}
