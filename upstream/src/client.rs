use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use rmcp::ServiceExt;
use rmcp::model::CallToolRequestParam;
use rmcp::model::GetPromptRequestParam;
use rmcp::model::GetPromptResult;
use rmcp::model::PaginatedRequestParams;
use rmcp::model::Prompt;
use rmcp::model::ReadResourceRequestParam;
use rmcp::model::ReadResourceResult;
use rmcp::model::Resource;
use rmcp::model::Tool;
use rmcp::service::RoleClient;
use rmcp::service::RunningService;
use rmcp::transport::SseClientTransport;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::TokioChildProcess;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use muster_auth::AuthManager;
use muster_protocol::mcp::CallToolResult;

use crate::config::TransportConfig;
use crate::config::UpstreamSpec;
use crate::error::UpstreamError;
use crate::notifications::NotificationForwarder;

type Service = Arc<RunningService<RoleClient, NotificationForwarder>>;

/// Everything an upstream exposed at (re-)list time.
#[derive(Debug, Clone)]
pub struct UpstreamSnapshot {
    pub name: String,
    pub prefix: String,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

/// One long-lived MCP client for a configured upstream.
pub struct UpstreamClient {
    spec: UpstreamSpec,
    auth: Arc<AuthManager>,
    forwarder: NotificationForwarder,
    service: Mutex<Option<Service>>,
}

impl UpstreamClient {
    pub fn new(
        spec: UpstreamSpec,
        auth: Arc<AuthManager>,
        forwarder: NotificationForwarder,
    ) -> Self {
        Self {
            spec,
            auth,
            forwarder,
            service: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &UpstreamSpec {
        &self.spec
    }

    pub async fn is_connected(&self) -> bool {
        self.service.lock().await.is_some()
    }

    /// Establish the transport and complete the MCP handshake. Idempotent:
    /// an existing connection is reused.
    pub async fn connect(&self) -> Result<(), UpstreamError> {
        let mut guard = self.service.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let name = self.spec.name.clone();
        let timeout = self.spec.call_timeout();
        let service = match &self.spec.transport {
            TransportConfig::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.kill_on_drop(true)
                    .args(args)
                    .envs(env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped());
                let (transport, stderr) = TokioChildProcess::builder(cmd)
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|err| UpstreamError::ConnectFailed {
                        name: name.clone(),
                        reason: err.to_string(),
                    })?;
                if let Some(stderr) = stderr {
                    drain_stderr(name.clone(), stderr);
                }
                self.await_handshake(self.forwarder.clone().serve(transport), timeout)
                    .await?
            }
            TransportConfig::StreamableHttp { url } => {
                let http = self.http_client(url).await?;
                let transport = StreamableHttpClientTransport::with_client(
                    http,
                    StreamableHttpClientTransportConfig::with_uri(url.to_string()),
                );
                self.await_handshake(self.forwarder.clone().serve(transport), timeout)
                    .await?
            }
            TransportConfig::Sse { url } => {
                let http = self.http_client(url).await?;
                let transport = SseClientTransport::start_with_client(
                    http,
                    SseClientConfig {
                        sse_endpoint: url.as_str().into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|err| UpstreamError::ConnectFailed {
                    name: name.clone(),
                    reason: err.to_string(),
                })?;
                self.await_handshake(self.forwarder.clone().serve(transport), timeout)
                    .await?
            }
        };

        if let Some(peer_info) = service.peer().peer_info() {
            info!(
                upstream = %name,
                server = %peer_info.server_info.name,
                version = %peer_info.server_info.version,
                "connected"
            );
        }
        *guard = Some(Arc::new(service));
        Ok(())
    }

    /// Tear down the connection (cancels the service task and, for stdio,
    /// kills the child).
    pub async fn disconnect(&self) {
        if let Some(service) = self.service.lock().await.take() {
            service.cancellation_token().cancel();
        }
    }

    /// Fetch the full capability set, following pagination cursors. Used
    /// after connect and on `*/list_changed`.
    pub async fn snapshot(&self) -> Result<UpstreamSnapshot, UpstreamError> {
        let service = self.current_service().await?;
        let timeout = self.spec.call_timeout();

        let mut tools: Vec<Tool> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|next| PaginatedRequestParams {
                meta: None,
                cursor: Some(next.clone()),
            });
            let page = self
                .with_timeout(timeout, service.list_tools(params))
                .await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
                _ => break,
            }
        }

        let mut resources: Vec<Resource> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|next| PaginatedRequestParams {
                meta: None,
                cursor: Some(next.clone()),
            });
            let page = self
                .with_timeout(timeout, service.list_resources(params))
                .await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
                _ => break,
            }
        }

        let mut prompts: Vec<Prompt> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|next| PaginatedRequestParams {
                meta: None,
                cursor: Some(next.clone()),
            });
            let page = self
                .with_timeout(timeout, service.list_prompts(params))
                .await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(UpstreamSnapshot {
            name: self.spec.name.clone(),
            prefix: self.spec.prefix(),
            tools,
            resources,
            prompts,
        })
    }

    /// Invoke `name` (the upstream's original tool name). On a 401 the auth
    /// manager gets one chance to refresh; the call is then retried once
    /// over a fresh connection.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, UpstreamError> {
        match self.call_tool_once(name, arguments.clone()).await {
            Ok(result) => Ok(result),
            Err(UpstreamError::AuthRequired { .. }) => {
                let endpoint = self.spec.endpoint().ok_or_else(|| {
                    UpstreamError::AuthRequired {
                        name: self.spec.name.clone(),
                    }
                })?;
                self.auth.on_unauthorized(endpoint).await.map_err(|_| {
                    UpstreamError::AuthRequired {
                        name: self.spec.name.clone(),
                    }
                })?;
                // Token refreshed; rebuild the transport so the new bearer
                // is injected, then retry exactly once.
                self.disconnect().await;
                self.connect().await?;
                self.call_tool_once(name, arguments).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, UpstreamError> {
        let service = self.current_service().await?;
        self.with_timeout(
            self.spec.call_timeout(),
            service.read_resource(ReadResourceRequestParam {
                uri: uri.to_string(),
            }),
        )
        .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult, UpstreamError> {
        let service = self.current_service().await?;
        self.with_timeout(
            self.spec.call_timeout(),
            service.get_prompt(GetPromptRequestParam {
                name: name.to_string(),
                arguments,
            }),
        )
        .await
    }

    async fn call_tool_once(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, UpstreamError> {
        let service = self.current_service().await?;
        let arguments = match arguments {
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return Err(UpstreamError::ProtocolError {
                    name: self.spec.name.clone(),
                    reason: "tool arguments must be a JSON object".to_string(),
                });
            }
            None => None,
        };

        let result = self
            .with_timeout(
                self.spec.call_timeout(),
                service.call_tool(CallToolRequestParam {
                    name: name.to_string().into(),
                    arguments,
                }),
            )
            .await?;
        Ok(convert_call_result(result))
    }

    async fn await_handshake<E>(
        &self,
        serving: impl std::future::Future<
            Output = Result<RunningService<RoleClient, NotificationForwarder>, E>,
        >,
        timeout: Duration,
    ) -> Result<RunningService<RoleClient, NotificationForwarder>, UpstreamError>
    where
        E: std::fmt::Display,
    {
        let name = self.spec.name.clone();
        match tokio::time::timeout(timeout, serving).await {
            Ok(Ok(service)) => Ok(service),
            Ok(Err(err)) => Err(UpstreamError::ProtocolError {
                name,
                reason: format!("handshake failed: {err}"),
            }),
            Err(_) => Err(UpstreamError::Timeout {
                name,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn current_service(&self) -> Result<Service, UpstreamError> {
        self.service
            .lock()
            .await
            .clone()
            .ok_or_else(|| UpstreamError::NotConnected {
                name: self.spec.name.clone(),
            })
    }

    async fn http_client(&self, endpoint: &str) -> Result<reqwest::Client, UpstreamError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.spec.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| {
                UpstreamError::Config(format!("invalid header name `{key}`: {err}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                UpstreamError::Config(format!("invalid header value for `{key}`: {err}"))
            })?;
            headers.insert(name, value);
        }
        // SESSION_ID_HEADER, lowercased per HeaderName rules.
        if let Ok(session) = HeaderValue::from_str(self.auth.session_id()) {
            headers.insert(HeaderName::from_static("mcp-session-id"), session);
        }

        match self.auth.bearer_for(endpoint).await {
            Ok(Some(bearer)) => {
                let value = HeaderValue::from_str(&format!("Bearer {bearer}")).map_err(|err| {
                    UpstreamError::Config(format!("invalid bearer token: {err}"))
                })?;
                headers.insert(AUTHORIZATION, value);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(upstream = %self.spec.name, %err, "connecting without bearer");
            }
        }

        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| UpstreamError::ConnectFailed {
                name: self.spec.name.clone(),
                reason: err.to_string(),
            })
    }

    async fn with_timeout<T, E>(
        &self,
        timeout: Duration,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, UpstreamError>
    where
        E: std::fmt::Display,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.classify_error(err.to_string())),
            Err(_) => Err(UpstreamError::Timeout {
                name: self.spec.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn classify_error(&self, text: String) -> UpstreamError {
        let lowered = text.to_lowercase();
        if lowered.contains("401") || lowered.contains("unauthorized") {
            UpstreamError::AuthRequired {
                name: self.spec.name.clone(),
            }
        } else if lowered.contains("closed") || lowered.contains("connection reset") {
            UpstreamError::Closed {
                name: self.spec.name.clone(),
            }
        } else {
            UpstreamError::ProtocolError {
                name: self.spec.name.clone(),
                reason: text,
            }
        }
    }
}

/// Flatten an SDK tool-call result into the internal mirror type, keeping
/// content objects as raw JSON (the aggregator propagates them verbatim).
pub fn convert_call_result(result: rmcp::model::CallToolResult) -> CallToolResult {
    let content = result
        .content
        .into_iter()
        .map(|content| {
            serde_json::to_value(content)
                .unwrap_or_else(|_| Value::String("<content>".to_string()))
        })
        .collect();
    CallToolResult {
        content,
        structured_content: result.structured_content,
        is_error: result.is_error,
        meta: result
            .meta
            .and_then(|meta| serde_json::to_value(meta).ok()),
    }
}

fn drain_stderr(upstream: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => info!(upstream = %upstream, "server stderr: {line}"),
                Ok(None) => break,
                Err(error) => {
                    warn!(upstream = %upstream, %error, "failed to read server stderr");
                    break;
                }
            }
        }
    });
}
