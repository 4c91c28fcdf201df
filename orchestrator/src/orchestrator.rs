use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::info;

use muster_graph::DependencyGraph;
use muster_graph::NodeKind;
use muster_protocol::EventLog;
use muster_protocol::ToolInvoker;

use crate::class::ClassStore;
use crate::class::WorkflowStore;
use crate::error::LifecycleError;
use crate::instance::ServiceHandle;
use crate::instance::ServiceInstance;
use crate::instance::ServiceState;

/// Owns every service instance and the dependency graph between them.
pub struct Orchestrator {
    invoker: Arc<dyn ToolInvoker>,
    classes: ClassStore,
    workflows: WorkflowStore,
    graph: RwLock<DependencyGraph>,
    instances: RwLock<HashMap<String, Arc<ServiceHandle>>>,
    events: Arc<EventLog>,
}

impl Orchestrator {
    pub fn new(invoker: Arc<dyn ToolInvoker>, events: Arc<EventLog>) -> Self {
        Self {
            invoker,
            classes: ClassStore::default(),
            workflows: WorkflowStore::default(),
            graph: RwLock::new(DependencyGraph::new()),
            instances: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn classes(&self) -> &ClassStore {
        &self.classes
    }

    pub fn workflows(&self) -> &WorkflowStore {
        &self.workflows
    }

    pub fn invoker(&self) -> &Arc<dyn ToolInvoker> {
        &self.invoker
    }

    /// Instantiate `class_name` as a service named `name`. The class's
    /// declared dependencies must already exist as instances.
    pub async fn create_service(
        &self,
        name: &str,
        class_name: &str,
        args: Value,
    ) -> Result<ServiceInstance, LifecycleError> {
        let class = self.classes.get(class_name).await.ok_or_else(|| {
            LifecycleError::UnknownClass {
                name: class_name.to_string(),
            }
        })?;
        class.validate_args(&args)?;

        {
            let instances = self.instances.read().await;
            if instances.contains_key(name) {
                return Err(LifecycleError::DuplicateService {
                    name: name.to_string(),
                });
            }
        }

        // Graph insertion validates dependency existence and acyclicity.
        self.graph
            .write()
            .await
            .add_node(name, NodeKind::Service, class.dependencies.clone())?;

        let handle = Arc::new(ServiceHandle::new(
            name.to_string(),
            class,
            args,
            Arc::clone(&self.events),
        ));
        let snapshot = handle.snapshot().await;
        self.instances
            .write()
            .await
            .insert(name.to_string(), handle);
        info!(service = %name, class = %class_name, "service created");
        Ok(snapshot)
    }

    pub async fn get(&self, name: &str) -> Result<ServiceInstance, LifecycleError> {
        let handle = self.handle(name).await?;
        Ok(handle.snapshot().await)
    }

    pub async fn list(&self) -> Vec<ServiceInstance> {
        let handles: Vec<Arc<ServiceHandle>> =
            self.instances.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Start `name`, driving its transitive dependencies to `running`
    /// first, in dependency order.
    pub async fn start(&self, name: &str) -> Result<(), LifecycleError> {
        let order = self.dependency_closure_order(name).await?;
        for dependency in order {
            if dependency == name {
                continue;
            }
            self.start_one(&dependency).await.map_err(|_| {
                LifecycleError::DependencyNotReady {
                    name: name.to_string(),
                    dependency,
                }
            })?;
        }
        self.start_one(name).await
    }

    /// Start every instance, parallelising within each topological level.
    pub async fn start_all(&self) -> Vec<(String, Result<(), String>)> {
        let levels = self.graph.read().await.topological_levels();
        let mut results = Vec::new();
        for level in levels {
            let mut join_set = JoinSet::new();
            for name in level {
                let Ok(handle) = self.handle(&name).await else {
                    continue;
                };
                let invoker = Arc::clone(&self.invoker);
                join_set.spawn(async move {
                    let result = handle.start(invoker).await;
                    (name, result.map_err(|err| err.to_string()))
                });
            }
            while let Some(joined) = join_set.join_next().await {
                if let Ok(outcome) = joined {
                    results.push(outcome);
                }
            }
        }
        results
    }

    /// Stop `name`, stopping everything that transitively depends on it
    /// first (cascade).
    pub async fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        let dependents = {
            let graph = self.graph.read().await;
            if !graph.contains(name) {
                return Err(LifecycleError::UnknownService {
                    name: name.to_string(),
                });
            }
            let closure: HashSet<String> =
                graph.transitive_dependents(name)?.into_iter().collect();
            // Reverse topological order stops leaves before their
            // dependencies.
            let mut ordered: Vec<String> = graph
                .topological_order()
                .into_iter()
                .filter(|node| closure.contains(node))
                .collect();
            ordered.reverse();
            ordered
        };

        for dependent in dependents {
            self.stop_one(&dependent).await?;
        }
        self.stop_one(name).await
    }

    pub async fn restart(&self, name: &str) -> Result<(), LifecycleError> {
        let handle = self.handle(name).await?;
        handle.restart(Arc::clone(&self.invoker)).await
    }

    /// Delete a stopped instance. Fails while anything depends on it.
    pub async fn delete(&self, name: &str) -> Result<(), LifecycleError> {
        let handle = self.handle(name).await?;
        let state = handle.state().await;
        if matches!(state, ServiceState::Running | ServiceState::Starting) {
            return Err(LifecycleError::NotStopped {
                name: name.to_string(),
            });
        }
        self.graph.write().await.remove_node(name)?;
        handle.teardown().await;
        self.instances.write().await.remove(name);
        info!(service = %name, "service deleted");
        Ok(())
    }

    async fn start_one(&self, name: &str) -> Result<(), LifecycleError> {
        let handle = self.handle(name).await?;
        // I2: every direct dependency must be running before this instance
        // may observe `running`.
        let dependencies = self.graph.read().await.dependencies(name)?;
        for dependency in &dependencies {
            let dep_handle = self.handle(dependency).await?;
            if dep_handle.state().await != ServiceState::Running {
                return Err(LifecycleError::DependencyNotReady {
                    name: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
        handle.start(Arc::clone(&self.invoker)).await
    }

    async fn stop_one(&self, name: &str) -> Result<(), LifecycleError> {
        let handle = self.handle(name).await?;
        handle.stop(Arc::clone(&self.invoker)).await
    }

    async fn handle(&self, name: &str) -> Result<Arc<ServiceHandle>, LifecycleError> {
        self.instances
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownService {
                name: name.to_string(),
            })
    }

    /// Transitive dependencies of `name` (then `name`), in topological
    /// order.
    async fn dependency_closure_order(
        &self,
        name: &str,
    ) -> Result<Vec<String>, LifecycleError> {
        let graph = self.graph.read().await;
        if !graph.contains(name) {
            return Err(LifecycleError::UnknownService {
                name: name.to_string(),
            });
        }
        let mut closure = HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            for dependency in graph.dependencies(&current)? {
                if closure.insert(dependency.clone()) {
                    stack.push(dependency);
                }
            }
        }
        closure.insert(name.to_string());
        Ok(graph
            .topological_order()
            .into_iter()
            .filter(|node| closure.contains(node))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use muster_protocol::ToolCallError;
    use muster_protocol::mcp::CallToolResult;

    use crate::class::ServiceClass;
    use crate::instance::HealthState;

    /// Scripted invoker: records calls, returns per-tool canned results.
    struct MockInvoker {
        calls: StdMutex<Vec<(String, Option<Value>)>>,
        results: StdMutex<HashMap<String, CallToolResult>>,
        delay: Option<Duration>,
    }

    impl MockInvoker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                results: StdMutex::new(HashMap::new()),
                delay: None,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                results: StdMutex::new(HashMap::new()),
                delay: Some(delay),
            })
        }

        fn script(&self, tool: &str, result: CallToolResult) {
            self.results
                .lock()
                .unwrap()
                .insert(tool.to_string(), result);
        }

        fn call_log(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(tool, _)| tool.clone())
                .collect()
        }

        fn args_for(&self, tool: &str) -> Option<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(name, _)| name == tool)
                .and_then(|(_, args)| args.clone())
        }
    }

    #[async_trait]
    impl ToolInvoker for MockInvoker {
        async fn call_tool(
            &self,
            name: &str,
            arguments: Option<Value>,
        ) -> Result<CallToolResult, ToolCallError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            Ok(self
                .results
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| CallToolResult::text("ok")))
        }

        async fn has_tool(&self, name: &str) -> bool {
            !name.is_empty()
        }
    }

    fn simple_class(name: &str, deps: &[&str]) -> ServiceClass {
        serde_json::from_value(json!({
            "name": name,
            "dependencies": deps,
            "start": { "tool": format!("{name}_start") },
            "stop": { "tool": format!("{name}_stop") },
        }))
        .expect("class json")
    }

    fn orchestrator(invoker: Arc<MockInvoker>) -> Orchestrator {
        Orchestrator::new(invoker, Arc::new(EventLog::default()))
    }

    #[tokio::test]
    async fn start_runs_dependencies_first() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(Arc::clone(&invoker));
        orch.classes().insert(simple_class("db", &[])).await;
        orch.classes().insert(simple_class("api", &["db"])).await;

        orch.create_service("db", "db", json!({})).await.unwrap();
        orch.create_service("api", "api", json!({})).await.unwrap();

        orch.start("api").await.unwrap();
        assert_eq!(invoker.call_log(), vec!["db_start", "api_start"]);
        assert_eq!(
            orch.get("db").await.unwrap().state,
            ServiceState::Running
        );
        assert_eq!(
            orch.get("api").await.unwrap().state,
            ServiceState::Running
        );
    }

    #[tokio::test]
    async fn stop_cascades_over_dependents_first() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(Arc::clone(&invoker));
        orch.classes().insert(simple_class("db", &[])).await;
        orch.classes().insert(simple_class("api", &["db"])).await;
        orch.create_service("db", "db", json!({})).await.unwrap();
        orch.create_service("api", "api", json!({})).await.unwrap();
        orch.start("api").await.unwrap();

        orch.stop("db").await.unwrap();
        assert_eq!(
            invoker.call_log(),
            vec!["db_start", "api_start", "api_stop", "db_stop"]
        );
        assert_eq!(
            orch.get("api").await.unwrap().state,
            ServiceState::Stopped
        );
        assert_eq!(
            orch.get("db").await.unwrap().state,
            ServiceState::Stopped
        );
    }

    #[tokio::test]
    async fn step_outputs_feed_later_steps() {
        let invoker = MockInvoker::new();
        invoker.script(
            "fw_start",
            CallToolResult::json(json!({ "session_id": "s-42" })),
        );
        let orch = orchestrator(Arc::clone(&invoker));
        let class: ServiceClass = serde_json::from_value(json!({
            "name": "fw",
            "start": { "tool": "fw_start",
                       "outputs": { "sessionID": "session_id" } },
            "stop": { "tool": "fw_stop",
                      "args": { "session": "{{ .start.sessionID }}" } },
        }))
        .unwrap();
        orch.classes().insert(class).await;
        orch.create_service("fw", "fw", json!({})).await.unwrap();

        orch.start("fw").await.unwrap();
        let snapshot = orch.get("fw").await.unwrap();
        assert_eq!(snapshot.outputs.get("sessionID"), Some(&json!("s-42")));

        orch.stop("fw").await.unwrap();
        assert_eq!(
            invoker.args_for("fw_stop"),
            Some(json!({ "session": "s-42" }))
        );
    }

    #[tokio::test]
    async fn template_failure_fails_the_start() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(Arc::clone(&invoker));
        let class: ServiceClass = serde_json::from_value(json!({
            "name": "broken",
            "start": { "tool": "b_start", "args": { "x": "{{ .args.missing }}" } },
            "stop": { "tool": "b_stop" },
        }))
        .unwrap();
        orch.classes().insert(class).await;
        orch.create_service("b", "broken", json!({})).await.unwrap();

        let err = orch.start("b").await.expect_err("template must fail");
        assert!(matches!(
            err,
            LifecycleError::TemplateResolutionFailed { .. }
        ));
        assert_eq!(orch.get("b").await.unwrap().state, ServiceState::Failed);
        assert!(invoker.call_log().is_empty());
    }

    #[tokio::test]
    async fn failed_step_surfaces_last_error() {
        let invoker = MockInvoker::new();
        invoker.script("x_start", CallToolResult::error("boom"));
        let orch = orchestrator(Arc::clone(&invoker));
        orch.classes().insert(simple_class("x", &[])).await;
        orch.create_service("x", "x", json!({})).await.unwrap();

        let err = orch.start("x").await.expect_err("start must fail");
        assert!(matches!(err, LifecycleError::StepFailed { .. }));
        let snapshot = orch.get("x").await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Failed);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_run_the_start_tool_once() {
        let invoker = MockInvoker::with_delay(Duration::from_millis(50));
        let orch = Arc::new(orchestrator(Arc::clone(&invoker)));
        orch.classes().insert(simple_class("s", &[])).await;
        orch.create_service("s", "s", json!({})).await.unwrap();

        let first = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.start("s").await })
        };
        let second = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.start("s").await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let starts = invoker
            .call_log()
            .iter()
            .filter(|tool| *tool == "s_start")
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_debounces_and_never_stops_the_service() {
        let invoker = MockInvoker::new();
        invoker.script("h_check", CallToolResult::error("unhealthy"));
        let orch = orchestrator(Arc::clone(&invoker));
        let class: ServiceClass = serde_json::from_value(json!({
            "name": "h",
            "start": { "tool": "h_start" },
            "stop": { "tool": "h_stop" },
            "healthCheck": { "tool": "h_check", "intervalSecs": 1 },
        }))
        .unwrap();
        orch.classes().insert(class).await;
        orch.create_service("h", "h", json!({})).await.unwrap();
        orch.start("h").await.unwrap();

        // Below the failure threshold the service is still checking.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let snapshot = orch.get("h").await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Running);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        let snapshot = orch.get("h").await.unwrap();
        assert_eq!(snapshot.health, HealthState::Unhealthy);
        assert_eq!(snapshot.state, ServiceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_without_tool_is_stop_settle_start() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(Arc::clone(&invoker));
        orch.classes().insert(simple_class("r", &[])).await;
        orch.create_service("r", "r", json!({})).await.unwrap();
        orch.start("r").await.unwrap();

        orch.restart("r").await.unwrap();
        assert_eq!(
            invoker.call_log(),
            vec!["r_start", "r_stop", "r_start"]
        );
    }

    #[tokio::test]
    async fn restart_uses_explicit_tool_when_defined() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(Arc::clone(&invoker));
        let class: ServiceClass = serde_json::from_value(json!({
            "name": "r",
            "start": { "tool": "r_start" },
            "stop": { "tool": "r_stop" },
            "restart": { "tool": "r_restart" },
        }))
        .unwrap();
        orch.classes().insert(class).await;
        orch.create_service("r", "r", json!({})).await.unwrap();
        orch.start("r").await.unwrap();

        orch.restart("r").await.unwrap();
        assert_eq!(invoker.call_log(), vec!["r_start", "r_restart"]);
    }

    #[tokio::test]
    async fn delete_requires_stopped_and_no_dependents() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(Arc::clone(&invoker));
        orch.classes().insert(simple_class("db", &[])).await;
        orch.classes().insert(simple_class("api", &["db"])).await;
        orch.create_service("db", "db", json!({})).await.unwrap();
        orch.create_service("api", "api", json!({})).await.unwrap();
        orch.start("api").await.unwrap();

        assert!(matches!(
            orch.delete("api").await,
            Err(LifecycleError::NotStopped { .. })
        ));
        orch.stop("api").await.unwrap();
        assert!(matches!(
            orch.delete("db").await,
            Err(LifecycleError::Graph(_))
        ));
        orch.delete("api").await.unwrap();
        orch.stop("db").await.unwrap();
        orch.delete("db").await.unwrap();
        assert!(orch.list().await.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_unknown_class_and_duplicates() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(invoker);
        assert!(matches!(
            orch.create_service("x", "ghost", json!({})).await,
            Err(LifecycleError::UnknownClass { .. })
        ));

        orch.classes().insert(simple_class("c", &[])).await;
        orch.create_service("x", "c", json!({})).await.unwrap();
        assert!(matches!(
            orch.create_service("x", "c", json!({})).await,
            Err(LifecycleError::DuplicateService { .. })
        ));
    }

    #[tokio::test]
    async fn start_all_walks_levels_in_order() {
        let invoker = MockInvoker::new();
        let orch = orchestrator(Arc::clone(&invoker));
        orch.classes().insert(simple_class("db", &[])).await;
        orch.classes().insert(simple_class("api", &["db"])).await;
        orch.classes().insert(simple_class("web", &["api"])).await;
        orch.create_service("db", "db", json!({})).await.unwrap();
        orch.create_service("api", "api", json!({})).await.unwrap();
        orch.create_service("web", "web", json!({})).await.unwrap();

        let results = orch.start_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        let log = invoker.call_log();
        let pos = |tool: &str| log.iter().position(|t| t == tool).unwrap();
        assert!(pos("db_start") < pos("api_start"));
        assert!(pos("api_start") < pos("web_start"));
    }
}
