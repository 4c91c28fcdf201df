use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport could not be established; retried with back-off.
    #[error("failed to connect to upstream `{name}`: {reason}")]
    ConnectFailed { name: String, reason: String },

    /// Handshake or framing violation; not retried until config changes.
    #[error("protocol error on upstream `{name}`: {reason}")]
    ProtocolError { name: String, reason: String },

    #[error("request to upstream `{name}` timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// The upstream demands (re-)authentication and silent recovery failed.
    #[error("authentication required for upstream `{name}`")]
    AuthRequired { name: String },

    #[error("connection to upstream `{name}` is closed")]
    Closed { name: String },

    #[error("upstream `{name}` is not connected")]
    NotConnected { name: String },

    #[error("invalid upstream configuration: {0}")]
    Config(String),
}

impl UpstreamError {
    /// Whether the reconnect loop should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::ConnectFailed { .. }
                | UpstreamError::Timeout { .. }
                | UpstreamError::Closed { .. }
        )
    }
}
