use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use muster_protocol::ToolInvoker;

use crate::error::LifecycleError;

/// One lifecycle step: an MCP tool call with templated arguments and an
/// output mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStep {
    pub tool: String,
    /// Argument template; strings may reference
    /// `{{ .args.* }}`, `{{ .service.* }}`, and prior step outputs.
    #[serde(default)]
    pub args: Value,
    /// Output name → dotted path into the step's result JSON.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Consecutive failures before the service is reported unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successes before it is reported healthy again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_health_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}

/// Declarative template a service instance is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClass {
    pub name: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Names of service instances this class's instances depend on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// JSON-schema-shaped description of `args`; only `required` is
    /// enforced here, full validation is the tool's job.
    #[serde(default)]
    pub params_schema: Value,
    pub start: LifecycleStep,
    pub stop: LifecycleStep,
    #[serde(default)]
    pub restart: Option<LifecycleStep>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

impl ServiceClass {
    /// Check creation args against `params_schema.required`.
    pub fn validate_args(&self, args: &Value) -> Result<(), LifecycleError> {
        let Some(required) = self.params_schema.get("required").and_then(Value::as_array)
        else {
            return Ok(());
        };
        for key in required.iter().filter_map(Value::as_str) {
            if args.get(key).is_none() {
                return Err(LifecycleError::InvalidArgs {
                    class: self.name.clone(),
                    reason: format!("missing required arg `{key}`"),
                });
            }
        }
        Ok(())
    }

    fn step_tools(&self) -> Vec<&str> {
        let mut tools = vec![self.start.tool.as_str(), self.stop.tool.as_str()];
        if let Some(restart) = &self.restart {
            tools.push(restart.tool.as_str());
        }
        if let Some(health) = &self.health_check {
            tools.push(health.tool.as_str());
        }
        tools
    }

    /// A class is available when every tool its lifecycle references is
    /// currently callable.
    pub async fn is_available(&self, invoker: &dyn ToolInvoker) -> bool {
        for tool in self.step_tools() {
            if !invoker.has_tool(tool).await {
                return false;
            }
        }
        true
    }
}

/// Named sequence of tool calls exposed through `core_workflow_*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<LifecycleStep>,
}

impl Workflow {
    pub async fn is_available(&self, invoker: &dyn ToolInvoker) -> bool {
        for step in &self.steps {
            if !invoker.has_tool(&step.tool).await {
                return false;
            }
        }
        true
    }
}

/// In-memory registry of service classes.
#[derive(Default)]
pub struct ClassStore {
    classes: RwLock<HashMap<String, ServiceClass>>,
}

impl ClassStore {
    pub async fn insert(&self, class: ServiceClass) {
        self.classes.write().await.insert(class.name.clone(), class);
    }

    pub async fn get(&self, name: &str) -> Option<ServiceClass> {
        self.classes.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ServiceClass> {
        let mut classes: Vec<ServiceClass> =
            self.classes.read().await.values().cloned().collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        classes
    }
}

/// In-memory registry of workflows.
#[derive(Default)]
pub struct WorkflowStore {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl WorkflowStore {
    pub async fn insert(&self, workflow: Workflow) {
        self.workflows
            .write()
            .await
            .insert(workflow.name.clone(), workflow);
    }

    pub async fn get(&self, name: &str) -> Option<Workflow> {
        self.workflows.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> =
            self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        workflows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn class_parses_from_json() {
        let class: ServiceClass = serde_json::from_value(json!({
            "name": "port-forward",
            "serviceType": "network",
            "dependencies": ["cluster"],
            "paramsSchema": { "required": ["port"] },
            "start": { "tool": "k8s_port_forward", "args": { "port": "{{ .args.port }}" },
                        "outputs": { "sessionID": "session_id" } },
            "stop": { "tool": "k8s_stop_forward",
                      "args": { "session": "{{ .start.sessionID }}" } },
            "healthCheck": { "tool": "k8s_check_forward" },
        }))
        .expect("class json");
        assert_eq!(class.dependencies, vec!["cluster".to_string()]);
        let health = class.health_check.expect("health check");
        assert_eq!(health.failure_threshold, 3);
        assert_eq!(health.success_threshold, 1);
        assert_eq!(health.interval_secs, 30);
    }

    #[test]
    fn validate_args_enforces_required() {
        let class: ServiceClass = serde_json::from_value(json!({
            "name": "c",
            "paramsSchema": { "required": ["port"] },
            "start": { "tool": "t" },
            "stop": { "tool": "t" },
        }))
        .expect("class json");
        assert!(class.validate_args(&json!({ "port": 80 })).is_ok());
        assert!(class.validate_args(&json!({})).is_err());
    }
}
