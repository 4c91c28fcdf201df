use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use muster_protocol::EventLog;
use muster_protocol::MusterEvent;
use muster_protocol::ToolInvoker;

use crate::RESTART_SETTLE_MS;
use crate::class::LifecycleStep;
use crate::class::ServiceClass;
use crate::error::LifecycleError;
use crate::template;
use crate::template::render_template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Checking,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Checking => "checking",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// API-facing snapshot of a service instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub class_name: String,
    pub args: Value,
    pub state: ServiceState,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub outputs: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct InstanceData {
    state: ServiceState,
    health: HealthState,
    last_error: Option<String>,
    /// Outputs accumulated from lifecycle steps, visible to templates as
    /// `{{ .service.metadata.* }}`.
    metadata: Map<String, Value>,
    /// Per-step outputs, visible as `{{ .<step>.<output> }}`.
    step_outputs: Map<String, Value>,
    updated_at: DateTime<Utc>,
}

/// Runtime handle for one service instance. All lifecycle operations on an
/// instance serialise through `op_lock`.
pub(crate) struct ServiceHandle {
    pub id: String,
    pub name: String,
    pub class: ServiceClass,
    pub args: Value,
    created_at: DateTime<Utc>,
    data: RwLock<InstanceData>,
    op_lock: Mutex<()>,
    state_tx: watch::Sender<ServiceState>,
    start_cancel: std::sync::Mutex<Option<CancellationToken>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventLog>,
}

impl ServiceHandle {
    pub fn new(name: String, class: ServiceClass, args: Value, events: Arc<EventLog>) -> Self {
        let (state_tx, _state_rx) = watch::channel(ServiceState::Unknown);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            class,
            args,
            created_at: Utc::now(),
            data: RwLock::new(InstanceData {
                state: ServiceState::Unknown,
                health: HealthState::Unknown,
                last_error: None,
                metadata: Map::new(),
                step_outputs: Map::new(),
                updated_at: Utc::now(),
            }),
            op_lock: Mutex::new(()),
            state_tx,
            start_cancel: std::sync::Mutex::new(None),
            health_task: Mutex::new(None),
            events,
        }
    }

    pub async fn snapshot(&self) -> ServiceInstance {
        let data = self.data.read().await;
        ServiceInstance {
            id: self.id.clone(),
            name: self.name.clone(),
            class_name: self.class.name.clone(),
            args: self.args.clone(),
            state: data.state,
            health: data.health,
            last_error: data.last_error.clone(),
            outputs: data.metadata.clone(),
            created_at: self.created_at,
            updated_at: data.updated_at,
        }
    }

    pub async fn state(&self) -> ServiceState {
        self.data.read().await.state
    }

    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    /// Drive the start step. Assumes dependencies are already running.
    pub async fn start(
        self: &Arc<Self>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<(), LifecycleError> {
        let _op = self.op_lock.lock().await;
        if self.state().await == ServiceState::Running {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.start_cancel.lock() {
            *slot = Some(cancel.clone());
        }
        self.set_state(ServiceState::Starting, None).await;

        let start = self.class.start.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(LifecycleError::StepFailed {
                tool: start.tool.clone(),
                message: "start cancelled by stop".to_string(),
            }),
            result = self.run_step(invoker.as_ref(), "start", &start) => result,
        };
        if let Ok(mut slot) = self.start_cancel.lock() {
            *slot = None;
        }

        match result {
            Ok(()) => {
                self.set_state(ServiceState::Running, None).await;
                self.spawn_health(Arc::clone(&invoker)).await;
                Ok(())
            }
            Err(err) => {
                let state = if cancel.is_cancelled() {
                    ServiceState::Stopped
                } else {
                    ServiceState::Failed
                };
                self.set_state(state, Some(err.to_string())).await;
                Err(err)
            }
        }
    }

    /// Drive the stop step. Cancels an in-flight start first.
    pub async fn stop(
        self: &Arc<Self>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<(), LifecycleError> {
        if let Ok(slot) = self.start_cancel.lock()
            && let Some(cancel) = slot.as_ref()
        {
            cancel.cancel();
        }

        let _op = self.op_lock.lock().await;
        self.abort_health().await;
        if matches!(
            self.state().await,
            ServiceState::Stopped | ServiceState::Unknown
        ) {
            return Ok(());
        }

        self.set_state(ServiceState::Stopping, None).await;
        let stop = self.class.stop.clone();
        match self.run_step(invoker.as_ref(), "stop", &stop).await {
            Ok(()) => {
                self.set_state(ServiceState::Stopped, None).await;
                Ok(())
            }
            Err(err) => {
                self.set_state(ServiceState::Failed, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Explicit restart tool when the class defines one, stop-settle-start
    /// otherwise.
    pub async fn restart(
        self: &Arc<Self>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<(), LifecycleError> {
        if let Some(restart) = self.class.restart.clone() {
            let _op = self.op_lock.lock().await;
            self.set_state(ServiceState::Starting, None).await;
            match self.run_step(invoker.as_ref(), "restart", &restart).await {
                Ok(()) => {
                    self.set_state(ServiceState::Running, None).await;
                    self.spawn_health(Arc::clone(&invoker)).await;
                    Ok(())
                }
                Err(err) => {
                    self.set_state(ServiceState::Failed, Some(err.to_string()))
                        .await;
                    Err(err)
                }
            }
        } else {
            self.stop(Arc::clone(&invoker)).await?;
            tokio::time::sleep(Duration::from_millis(RESTART_SETTLE_MS)).await;
            self.start(invoker).await
        }
    }

    /// Tear down background work when the instance is deleted.
    pub async fn teardown(&self) {
        self.abort_health().await;
    }

    async fn run_step(
        &self,
        invoker: &dyn ToolInvoker,
        role: &str,
        step: &LifecycleStep,
    ) -> Result<(), LifecycleError> {
        let context = self.template_context().await;
        let rendered = render_template(&step.args, &context).map_err(|source| {
            LifecycleError::TemplateResolutionFailed {
                name: self.name.clone(),
                source,
            }
        })?;
        let arguments = if rendered.is_null() {
            None
        } else {
            Some(rendered)
        };

        debug!(service = %self.name, tool = %step.tool, %role, "running lifecycle step");
        let result = invoker.call_tool(&step.tool, arguments).await?;
        if !result.is_success() {
            return Err(LifecycleError::StepFailed {
                tool: step.tool.clone(),
                message: result.text_content(),
            });
        }

        if step.outputs.is_empty() {
            return Ok(());
        }
        let result_json = result
            .structured_content
            .clone()
            .or_else(|| serde_json::from_str(&result.text_content()).ok())
            .unwrap_or(Value::Null);
        let mut extracted = Map::new();
        for (output, path) in &step.outputs {
            let value = template::lookup(&result_json, path).cloned().ok_or_else(|| {
                LifecycleError::StepFailed {
                    tool: step.tool.clone(),
                    message: format!("result has no value at `{path}` for output `{output}`"),
                }
            })?;
            extracted.insert(output.clone(), value);
        }

        let mut data = self.data.write().await;
        for (key, value) in &extracted {
            data.metadata.insert(key.clone(), value.clone());
        }
        data.step_outputs
            .insert(role.to_string(), Value::Object(extracted));
        data.updated_at = Utc::now();
        Ok(())
    }

    async fn template_context(&self) -> Value {
        let data = self.data.read().await;
        let mut context = Map::new();
        context.insert("args".to_string(), self.args.clone());
        context.insert(
            "service".to_string(),
            serde_json::json!({
                "id": self.id,
                "name": self.name,
                "metadata": Value::Object(data.metadata.clone()),
            }),
        );
        for (step, outputs) in &data.step_outputs {
            context.insert(step.clone(), outputs.clone());
        }
        Value::Object(context)
    }

    async fn spawn_health(self: &Arc<Self>, invoker: Arc<dyn ToolInvoker>) {
        let Some(spec) = self.class.health_check.clone() else {
            return;
        };
        self.abort_health().await;
        self.set_health(HealthState::Checking).await;

        let handle = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut failures = 0u32;
            let mut successes = 0u32;
            let mut ticker =
                tokio::time::interval(Duration::from_secs(spec.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let context = handle.template_context().await;
                let arguments = match render_template(&spec.args, &context) {
                    Ok(Value::Null) => None,
                    Ok(rendered) => Some(rendered),
                    Err(err) => {
                        warn!(service = %handle.name, %err, "health check template failed");
                        None
                    }
                };
                let healthy = match invoker.call_tool(&spec.tool, arguments).await {
                    Ok(result) => result.is_success(),
                    Err(err) => {
                        debug!(service = %handle.name, %err, "health check call failed");
                        false
                    }
                };

                // Debounce: a failing check never stops the service, it only
                // flips the reported health.
                if healthy {
                    successes += 1;
                    failures = 0;
                    if successes >= spec.success_threshold
                        && handle.health().await != HealthState::Healthy
                    {
                        handle.set_health(HealthState::Healthy).await;
                    }
                } else {
                    failures += 1;
                    successes = 0;
                    if failures >= spec.failure_threshold
                        && handle.health().await != HealthState::Unhealthy
                    {
                        handle.set_health(HealthState::Unhealthy).await;
                    }
                }
            }
        });
        *self.health_task.lock().await = Some(task);
    }

    async fn abort_health(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
        let mut data = self.data.write().await;
        data.health = HealthState::Unknown;
    }

    pub(crate) async fn health(&self) -> HealthState {
        self.data.read().await.health
    }

    async fn set_state(&self, state: ServiceState, error: Option<String>) {
        {
            let mut data = self.data.write().await;
            data.state = state;
            if error.is_some() {
                data.last_error = error.clone();
            }
            data.updated_at = Utc::now();
        }
        let _ = self.state_tx.send(state);
        self.events.record(MusterEvent::ServiceStateChanged {
            name: self.name.clone(),
            state: state.to_string(),
            error,
        });
    }

    async fn set_health(&self, health: HealthState) {
        {
            let mut data = self.data.write().await;
            data.health = health;
            data.updated_at = Utc::now();
        }
        self.events.record(MusterEvent::ServiceHealthChanged {
            name: self.name.clone(),
            health: health.to_string(),
        });
    }
}
