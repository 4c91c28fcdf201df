//! Loopback HTTP server receiving the OAuth authorization redirect.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::AuthError;

/// Query parameters delivered to the redirect URI on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    pub code: String,
    pub state: String,
}

enum CallbackOutcome {
    Success(CallbackResult),
    Error(String),
    Invalid,
}

/// One-shot loopback server bound to `127.0.0.1:<port>` (port 0 picks a free
/// one). The listener unblocks on drop, so an abandoned login releases the
/// port immediately.
pub struct CallbackServer {
    server: Arc<tiny_http::Server>,
    rx: Option<oneshot::Receiver<CallbackResult>>,
    redirect_uri: String,
}

impl CallbackServer {
    pub fn bind(port: u16) -> Result<Self, AuthError> {
        let server = tiny_http::Server::http(format!("127.0.0.1:{port}"))
            .map_err(|err| AuthError::Network(err.to_string()))?;
        let server = Arc::new(server);

        let redirect_uri = match server.server_addr() {
            tiny_http::ListenAddr::IP(addr) => format!("http://{addr}/callback"),
            #[cfg(unix)]
            tiny_http::ListenAddr::Unix(_) => {
                return Err(AuthError::Network(
                    "callback server bound to a unix socket".to_string(),
                ));
            }
        };

        let (tx, rx) = oneshot::channel();
        spawn_accept_loop(Arc::clone(&server), tx);

        Ok(Self {
            server,
            rx: Some(rx),
            redirect_uri,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Wait for the redirect to deliver `code` and `state`.
    pub async fn wait(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<CallbackResult, AuthError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| AuthError::Protocol("callback already consumed".to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(AuthError::CallbackTimeout),
            Err(_) => Err(AuthError::CallbackTimeout),
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

fn spawn_accept_loop(server: Arc<tiny_http::Server>, tx: oneshot::Sender<CallbackResult>) {
    tokio::task::spawn_blocking(move || {
        let mut tx = Some(tx);
        while let Ok(request) = server.recv() {
            let path = request.url().to_string();
            match parse_callback(&path) {
                CallbackOutcome::Success(result) => {
                    let response = tiny_http::Response::from_string(
                        "Authentication complete. You may close this window.",
                    );
                    if let Err(err) = request.respond(response) {
                        tracing::warn!("failed to respond to OAuth callback: {err}");
                    }
                    if let Some(tx) = tx.take()
                        && tx.send(result).is_err()
                    {
                        tracing::warn!("OAuth callback receiver dropped");
                    }
                    break;
                }
                CallbackOutcome::Error(description) => {
                    let response =
                        tiny_http::Response::from_string(format!("OAuth error: {description}"))
                            .with_status_code(400);
                    if let Err(err) = request.respond(response) {
                        tracing::warn!("failed to respond to OAuth callback: {err}");
                    }
                }
                CallbackOutcome::Invalid => {
                    let response = tiny_http::Response::from_string("Invalid OAuth callback")
                        .with_status_code(400);
                    if let Err(err) = request.respond(response) {
                        tracing::warn!("failed to respond to OAuth callback: {err}");
                    }
                }
            }
        }
    });
}

fn parse_callback(path: &str) -> CallbackOutcome {
    let Some((route, query)) = path.split_once('?') else {
        return CallbackOutcome::Invalid;
    };
    if route != "/callback" {
        return CallbackOutcome::Invalid;
    }

    let mut code = None;
    let mut state = None;
    let mut error_description = None;

    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let Ok(decoded) = urlencoding::decode(value) else {
            continue;
        };
        let decoded = decoded.into_owned();
        match key {
            "code" => code = Some(decoded),
            "state" => state = Some(decoded),
            "error_description" => error_description = Some(decoded),
            _ => {}
        }
    }

    if let (Some(code), Some(state)) = (code, state) {
        return CallbackOutcome::Success(CallbackResult { code, state });
    }
    if let Some(description) = error_description {
        return CallbackOutcome::Error(description);
    }
    CallbackOutcome::Invalid
}
