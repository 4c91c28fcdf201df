use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use muster_auth::AuthManager;
use muster_protocol::AuthState;

use crate::BACKOFF_CAP_MS;
use crate::BACKOFF_INITIAL_MS;
use crate::client::UpstreamClient;
use crate::client::UpstreamSnapshot;
use crate::config::UpstreamSpec;
use crate::error::UpstreamError;
use crate::notifications::ListChanged;
use crate::notifications::NotificationForwarder;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// Pool-level events consumed by the aggregator's index writer.
#[derive(Debug)]
pub enum PoolEvent {
    /// Fresh capability set for one upstream (connect or list_changed).
    SnapshotUpdated(UpstreamSnapshot),
    /// Upstream disconnected or was removed; its entries must vanish.
    UpstreamGone { name: String, error: Option<String> },
    /// Connection-level status changed without a capability change.
    StatusChanged { name: String },
}

/// Connection status of one upstream, surfaced by `core_mcpserver_get` and
/// `auth://status`.
#[derive(Debug, Clone)]
pub struct UpstreamStatus {
    pub connected: bool,
    pub auth_state: AuthState,
    pub last_error: Option<String>,
    /// Protocol errors stop the reconnect loop until config changes.
    pub gave_up: bool,
}

impl Default for UpstreamStatus {
    fn default() -> Self {
        Self {
            connected: false,
            auth_state: AuthState::NoAuthRequired,
            last_error: None,
            gave_up: false,
        }
    }
}

struct ManagedUpstream {
    client: Arc<UpstreamClient>,
    status: Arc<RwLock<UpstreamStatus>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns one [`UpstreamClient`] per configured upstream plus its connection
/// task, and multiplexes their snapshots into one event stream.
pub struct UpstreamManager {
    auth: Arc<AuthManager>,
    upstreams: RwLock<HashMap<String, ManagedUpstream>>,
    events_tx: mpsc::Sender<PoolEvent>,
    cancel: CancellationToken,
}

impl UpstreamManager {
    /// Returns the manager and the receiving side of its event stream.
    pub fn new(auth: Arc<AuthManager>) -> (Arc<Self>, mpsc::Receiver<PoolEvent>) {
        let (events_tx, events_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            auth,
            upstreams: RwLock::new(HashMap::new()),
            events_tx,
            cancel: CancellationToken::new(),
        });
        (manager, events_rx)
    }

    /// Register an upstream. With `auto_start` (or `start` forced) the
    /// connection task begins immediately.
    pub async fn add(self: &Arc<Self>, spec: UpstreamSpec) -> Result<(), UpstreamError> {
        let name = spec.name.clone();
        {
            let upstreams = self.upstreams.read().await;
            if upstreams.contains_key(&name) {
                return Err(UpstreamError::Config(format!(
                    "duplicate upstream name `{name}`"
                )));
            }
        }

        let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let forwarder = NotificationForwarder::new(name.clone(), notif_tx);
        let client = Arc::new(UpstreamClient::new(
            spec.clone(),
            Arc::clone(&self.auth),
            forwarder,
        ));
        let status = Arc::new(RwLock::new(UpstreamStatus::default()));
        let cancel = self.cancel.child_token();

        let task = tokio::spawn(run_upstream(
            Arc::clone(&client),
            Arc::clone(&status),
            Arc::clone(&self.auth),
            self.events_tx.clone(),
            notif_rx,
            cancel.clone(),
            spec.auto_start,
        ));

        let managed = ManagedUpstream {
            client,
            status,
            cancel,
            task,
        };
        self.upstreams.write().await.insert(name, managed);
        Ok(())
    }

    /// Remove an upstream; its capabilities disappear from the index before
    /// the removal returns.
    pub async fn remove(&self, name: &str) -> Result<(), UpstreamError> {
        let managed = self.upstreams.write().await.remove(name).ok_or_else(|| {
            UpstreamError::Config(format!("unknown upstream `{name}`"))
        })?;
        managed.cancel.cancel();
        managed.client.disconnect().await;
        managed.task.abort();
        let _ = self
            .events_tx
            .send(PoolEvent::UpstreamGone {
                name: name.to_string(),
                error: None,
            })
            .await;
        Ok(())
    }

    pub async fn client(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        self.upstreams
            .read()
            .await
            .get(name)
            .map(|managed| Arc::clone(&managed.client))
    }

    pub async fn status(&self, name: &str) -> Option<UpstreamStatus> {
        match self.upstreams.read().await.get(name) {
            Some(managed) => Some(managed.status.read().await.clone()),
            None => None,
        }
    }

    pub async fn specs(&self) -> Vec<UpstreamSpec> {
        self.upstreams
            .read()
            .await
            .values()
            .map(|managed| managed.client.spec().clone())
            .collect()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.upstreams.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Call a tool on a specific upstream by its original name.
    pub async fn call_tool(
        &self,
        upstream: &str,
        tool: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<muster_protocol::mcp::CallToolResult, UpstreamError> {
        let client = self.client(upstream).await.ok_or_else(|| {
            UpstreamError::Config(format!("unknown upstream `{upstream}`"))
        })?;
        client.call_tool(tool, arguments).await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Per-upstream connection loop: connect with back-off, publish snapshots,
/// re-list on notifications, keep-alive re-list on an interval.
#[allow(clippy::too_many_arguments)]
async fn run_upstream(
    client: Arc<UpstreamClient>,
    status: Arc<RwLock<UpstreamStatus>>,
    auth: Arc<AuthManager>,
    events_tx: mpsc::Sender<PoolEvent>,
    mut notif_rx: mpsc::Receiver<(String, ListChanged)>,
    cancel: CancellationToken,
    auto_start: bool,
) {
    let name = client.spec().name.clone();
    if !auto_start {
        info!(upstream = %name, "auto-start disabled; waiting for explicit start");
        cancel.cancelled().await;
        return;
    }

    let mut backoff_ms = BACKOFF_INITIAL_MS;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_and_publish(&client, &auth, &events_tx, &status).await {
            Ok(()) => {
                backoff_ms = BACKOFF_INITIAL_MS;
            }
            Err(err) => {
                let retryable = err.is_retryable();
                {
                    let mut status = status.write().await;
                    status.connected = false;
                    status.last_error = Some(err.to_string());
                    status.gave_up = !retryable;
                }
                let _ = events_tx
                    .send(PoolEvent::StatusChanged { name: name.clone() })
                    .await;
                if !retryable {
                    // Repeated protocol errors would loop forever; stop
                    // until configuration changes recreate this upstream.
                    warn!(upstream = %name, %err, "giving up until config changes");
                    cancel.cancelled().await;
                    break;
                }
                warn!(upstream = %name, %err, backoff_ms, "reconnecting after back-off");
                let jitter = rand::rng().random_range(0..=backoff_ms / 4);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)) => {}
                }
                backoff_ms = (backoff_ms * 2).min(BACKOFF_CAP_MS);
                continue;
            }
        }

        // Connected: wait for change notifications, keep-alive ticks, or
        // shutdown. Any failure falls back to the reconnect loop.
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        keepalive.tick().await; // first tick completes immediately

        let disconnect_reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    client.disconnect().await;
                    return;
                }
                changed = notif_rx.recv() => {
                    match changed {
                        Some((_, changed)) => {
                            tracing::debug!(upstream = %name, ?changed, "list_changed");
                            if let Err(err) = publish_snapshot(&client, &events_tx).await {
                                break err;
                            }
                        }
                        None => break UpstreamError::Closed { name: name.clone() },
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(err) = publish_snapshot(&client, &events_tx).await {
                        break err;
                    }
                }
            }
        };

        warn!(upstream = %name, %disconnect_reason, "connection lost");
        client.disconnect().await;
        {
            let mut status = status.write().await;
            status.connected = false;
            status.last_error = Some(disconnect_reason.to_string());
        }
        let _ = events_tx
            .send(PoolEvent::UpstreamGone {
                name: name.clone(),
                error: Some(disconnect_reason.to_string()),
            })
            .await;
    }
}

async fn connect_and_publish(
    client: &Arc<UpstreamClient>,
    auth: &Arc<AuthManager>,
    events_tx: &mpsc::Sender<PoolEvent>,
    status: &Arc<RwLock<UpstreamStatus>>,
) -> Result<(), UpstreamError> {
    client.connect().await?;
    publish_snapshot(client, events_tx).await?;

    let auth_state = match client.spec().endpoint() {
        Some(endpoint) => auth.state(endpoint).await,
        None => AuthState::NoAuthRequired,
    };
    {
        let mut status = status.write().await;
        status.connected = true;
        status.auth_state = auth_state;
        status.last_error = None;
        status.gave_up = false;
    }
    let _ = events_tx
        .send(PoolEvent::StatusChanged {
            name: client.spec().name.clone(),
        })
        .await;
    Ok(())
}

async fn publish_snapshot(
    client: &Arc<UpstreamClient>,
    events_tx: &mpsc::Sender<PoolEvent>,
) -> Result<(), UpstreamError> {
    let snapshot = client.snapshot().await?;
    let _ = events_tx.send(PoolEvent::SnapshotUpdated(snapshot)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = BACKOFF_INITIAL_MS;
        let mut schedule = Vec::new();
        for _ in 0..9 {
            schedule.push(backoff);
            backoff = (backoff * 2).min(BACKOFF_CAP_MS);
        }
        assert_eq!(
            schedule,
            vec![250, 500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]
        );
    }

    #[test]
    fn protocol_errors_are_not_retryable() {
        assert!(!UpstreamError::ProtocolError {
            name: "x".into(),
            reason: "bad framing".into()
        }
        .is_retryable());
        assert!(UpstreamError::ConnectFailed {
            name: "x".into(),
            reason: "refused".into()
        }
        .is_retryable());
        assert!(UpstreamError::Timeout {
            name: "x".into(),
            timeout_ms: 30_000
        }
        .is_retryable());
    }
}
