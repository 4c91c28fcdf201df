//! The `core_*` administrative tool surface.
//!
//! Each builtin is a closure over the orchestrator, upstream pool, or auth
//! manager, registered into the core's dispatch table so admin tools and
//! upstream tools are called identically.

use std::sync::Arc;

use rmcp::model::Tool;
use serde_json::Value;
use serde_json::json;

use muster_orchestrator::Orchestrator;
use muster_protocol::MusterEvent;
use muster_protocol::mcp::CallToolResult;
use muster_upstream::UpstreamSpec;

use muster_auth::LoginOptions;

use crate::core::AggregatorCore;
use crate::core::BuiltinHandler;

fn tool(name: &str, description: &str, schema: Value) -> Tool {
    let schema_object = match schema {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Tool::new(
        name.to_string(),
        description.to_string(),
        std::sync::Arc::new(schema_object),
    )
}

fn name_only_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "name": { "type": "string" } },
        "required": ["name"],
    })
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn json_result<T: serde::Serialize>(value: &T) -> CallToolResult {
    match serde_json::to_value(value) {
        Ok(value) => CallToolResult::json(value),
        Err(err) => CallToolResult::error(format!("failed to encode result: {err}")),
    }
}

fn required_str(args: &Option<Value>, key: &str) -> Result<String, CallToolResult> {
    args.as_ref()
        .and_then(|args| args.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CallToolResult::error(format!("missing required argument `{key}`")))
}

macro_rules! handler {
    (|$args:ident| $body:expr) => {{
        let handler: BuiltinHandler = Arc::new(move |$args: Option<Value>| Box::pin($body));
        handler
    }};
}

/// Register every `core_*` tool on the aggregator core.
pub async fn register_all(core: &Arc<AggregatorCore>, orchestrator: &Arc<Orchestrator>) {
    register_service_tools(core, orchestrator).await;
    register_serviceclass_tools(core, orchestrator).await;
    register_workflow_tools(core, orchestrator).await;
    register_mcpserver_tools(core).await;
    register_misc_tools(core).await;
}

async fn register_service_tools(core: &Arc<AggregatorCore>, orchestrator: &Arc<Orchestrator>) {
    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_service_list",
            "List all service instances",
            empty_schema(),
        ),
        handler!(|_args| {
            let orch = Arc::clone(&orch);
            async move { json_result(&orch.list().await) }
        }),
    )
    .await;

    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_service_get",
            "Get a service instance by name",
            name_only_schema(),
        ),
        handler!(|args| {
            let orch = Arc::clone(&orch);
            async move {
                let name = match required_str(&args, "name") {
                    Ok(name) => name,
                    Err(err) => return err,
                };
                match orch.get(&name).await {
                    Ok(instance) => json_result(&instance),
                    Err(err) => CallToolResult::error(err.to_string()),
                }
            }
        }),
    )
    .await;

    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_service_status",
            "Get the state and health of a service instance",
            name_only_schema(),
        ),
        handler!(|args| {
            let orch = Arc::clone(&orch);
            async move {
                let name = match required_str(&args, "name") {
                    Ok(name) => name,
                    Err(err) => return err,
                };
                match orch.get(&name).await {
                    Ok(instance) => json_result(&json!({
                        "name": instance.name,
                        "state": instance.state,
                        "health": instance.health,
                        "lastError": instance.last_error,
                    })),
                    Err(err) => CallToolResult::error(err.to_string()),
                }
            }
        }),
    )
    .await;

    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_service_create",
            "Create a service instance from a service class",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "serviceClassName": { "type": "string" },
                    "args": { "type": "object" },
                },
                "required": ["name", "serviceClassName"],
            }),
        ),
        handler!(|args| {
            let orch = Arc::clone(&orch);
            async move {
                let name = match required_str(&args, "name") {
                    Ok(name) => name,
                    Err(err) => return err,
                };
                let class = match required_str(&args, "serviceClassName") {
                    Ok(class) => class,
                    Err(err) => return err,
                };
                let create_args = args
                    .as_ref()
                    .and_then(|args| args.get("args"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                match orch.create_service(&name, &class, create_args).await {
                    Ok(instance) => json_result(&instance),
                    Err(err) => CallToolResult::error(err.to_string()),
                }
            }
        }),
    )
    .await;

    for (tool_name, description) in [
        ("core_service_start", "Start a service instance (dependencies first)"),
        ("core_service_stop", "Stop a service instance (dependents first)"),
        ("core_service_restart", "Restart a service instance"),
        ("core_service_delete", "Delete a stopped service instance"),
    ] {
        let orch = Arc::clone(orchestrator);
        core.register_builtin(
            tool(tool_name, description, name_only_schema()),
            handler!(|args| {
                let orch = Arc::clone(&orch);
                async move {
                    let name = match required_str(&args, "name") {
                        Ok(name) => name,
                        Err(err) => return err,
                    };
                    let result = match tool_name {
                        "core_service_start" => orch.start(&name).await,
                        "core_service_stop" => orch.stop(&name).await,
                        "core_service_restart" => orch.restart(&name).await,
                        _ => orch.delete(&name).await,
                    };
                    match result {
                        Ok(()) => match orch.get(&name).await {
                            Ok(instance) => json_result(&instance),
                            // Deleted instances have no snapshot left.
                            Err(_) => CallToolResult::text(format!("{tool_name} ok")),
                        },
                        Err(err) => CallToolResult::error(err.to_string()),
                    }
                }
            }),
        )
        .await;
    }
}

async fn register_serviceclass_tools(
    core: &Arc<AggregatorCore>,
    orchestrator: &Arc<Orchestrator>,
) {
    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_serviceclass_list",
            "List registered service classes",
            empty_schema(),
        ),
        handler!(|_args| {
            let orch = Arc::clone(&orch);
            async move { json_result(&orch.classes().list().await) }
        }),
    )
    .await;

    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_serviceclass_get",
            "Get a service class by name",
            name_only_schema(),
        ),
        handler!(|args| {
            let orch = Arc::clone(&orch);
            async move {
                let name = match required_str(&args, "name") {
                    Ok(name) => name,
                    Err(err) => return err,
                };
                match orch.classes().get(&name).await {
                    Some(class) => json_result(&class),
                    None => CallToolResult::error(format!("unknown service class `{name}`")),
                }
            }
        }),
    )
    .await;

    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_serviceclass_available",
            "Report which service classes have all lifecycle tools available",
            empty_schema(),
        ),
        handler!(|_args| {
            let orch = Arc::clone(&orch);
            async move {
                let invoker = Arc::clone(orch.invoker());
                let mut report = Vec::new();
                for class in orch.classes().list().await {
                    let available = class.is_available(invoker.as_ref()).await;
                    report.push(json!({ "name": class.name, "available": available }));
                }
                json_result(&report)
            }
        }),
    )
    .await;
}

async fn register_workflow_tools(core: &Arc<AggregatorCore>, orchestrator: &Arc<Orchestrator>) {
    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_workflow_list",
            "List registered workflows",
            empty_schema(),
        ),
        handler!(|_args| {
            let orch = Arc::clone(&orch);
            async move { json_result(&orch.workflows().list().await) }
        }),
    )
    .await;

    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_workflow_get",
            "Get a workflow by name",
            name_only_schema(),
        ),
        handler!(|args| {
            let orch = Arc::clone(&orch);
            async move {
                let name = match required_str(&args, "name") {
                    Ok(name) => name,
                    Err(err) => return err,
                };
                match orch.workflows().get(&name).await {
                    Some(workflow) => json_result(&workflow),
                    None => CallToolResult::error(format!("unknown workflow `{name}`")),
                }
            }
        }),
    )
    .await;

    let orch = Arc::clone(orchestrator);
    core.register_builtin(
        tool(
            "core_workflow_available",
            "Report which workflows have all referenced tools available",
            empty_schema(),
        ),
        handler!(|_args| {
            let orch = Arc::clone(&orch);
            async move {
                let invoker = Arc::clone(orch.invoker());
                let mut report = Vec::new();
                for workflow in orch.workflows().list().await {
                    let available = workflow.is_available(invoker.as_ref()).await;
                    report.push(json!({ "name": workflow.name, "available": available }));
                }
                json_result(&report)
            }
        }),
    )
    .await;
}

async fn register_mcpserver_tools(core: &Arc<AggregatorCore>) {
    let this = Arc::clone(core);
    core.register_builtin(
        tool(
            "core_mcpserver_list",
            "List configured upstream MCP servers and their status",
            empty_schema(),
        ),
        handler!(|_args| {
            let this = Arc::clone(&this);
            async move {
                let mut servers = Vec::new();
                for spec in this.pool().specs().await {
                    let status = this.pool().status(&spec.name).await;
                    servers.push(json!({
                        "spec": spec,
                        "connected": status.as_ref().is_some_and(|s| s.connected),
                        "lastError": status.and_then(|s| s.last_error),
                    }));
                }
                servers.sort_by_key(|server| {
                    server["spec"]["name"].as_str().unwrap_or_default().to_string()
                });
                json_result(&servers)
            }
        }),
    )
    .await;

    let this = Arc::clone(core);
    core.register_builtin(
        tool(
            "core_mcpserver_get",
            "Get one upstream MCP server's spec and status",
            name_only_schema(),
        ),
        handler!(|args| {
            let this = Arc::clone(&this);
            async move {
                let name = match required_str(&args, "name") {
                    Ok(name) => name,
                    Err(err) => return err,
                };
                let Some(client) = this.pool().client(&name).await else {
                    return CallToolResult::error(format!("unknown upstream `{name}`"));
                };
                let status = this.pool().status(&name).await;
                json_result(&json!({
                    "spec": client.spec(),
                    "connected": status.as_ref().is_some_and(|s| s.connected),
                    "authState": status.as_ref().map(|s| s.auth_state),
                    "lastError": status.and_then(|s| s.last_error),
                }))
            }
        }),
    )
    .await;

    let this = Arc::clone(core);
    core.register_builtin(
        tool(
            "core_mcpserver_create",
            "Register (and optionally auto-start) an upstream MCP server",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "type": { "type": "string", "enum": ["stdio", "streamable-http", "sse"] },
                    "command": { "type": "string" },
                    "args": { "type": "array", "items": { "type": "string" } },
                    "env": { "type": "object" },
                    "url": { "type": "string" },
                    "headers": { "type": "object" },
                    "autoStart": { "type": "boolean" },
                    "timeout": { "type": "integer" },
                    "toolPrefix": { "type": "string" },
                },
                "required": ["name"],
            }),
        ),
        handler!(|args| {
            let this = Arc::clone(&this);
            async move {
                let Some(args) = args else {
                    return CallToolResult::error("missing arguments");
                };
                let spec = match UpstreamSpec::from_create_args(&args) {
                    Ok(spec) => spec,
                    Err(err) => return CallToolResult::error(err.to_string()),
                };
                if let Some(endpoint) = spec.endpoint() {
                    this.auth()
                        .configure_endpoint(endpoint, Default::default(), None)
                        .await;
                }
                match this.pool().add(spec.clone()).await {
                    Ok(()) => json_result(&spec),
                    Err(err) => CallToolResult::error(err.to_string()),
                }
            }
        }),
    )
    .await;

    let this = Arc::clone(core);
    core.register_builtin(
        tool(
            "core_mcpserver_delete",
            "Remove an upstream MCP server and all of its tools",
            name_only_schema(),
        ),
        handler!(|args| {
            let this = Arc::clone(&this);
            async move {
                let name = match required_str(&args, "name") {
                    Ok(name) => name,
                    Err(err) => return err,
                };
                match this.pool().remove(&name).await {
                    Ok(()) => CallToolResult::text(format!("upstream `{name}` removed")),
                    Err(err) => CallToolResult::error(err.to_string()),
                }
            }
        }),
    )
    .await;
}

async fn register_misc_tools(core: &Arc<AggregatorCore>) {
    let this = Arc::clone(core);
    core.register_builtin(
        tool(
            "core_events",
            "Recent control-plane events (newest last)",
            json!({
                "type": "object",
                "properties": { "limit": { "type": "integer" } },
            }),
        ),
        handler!(|args| {
            let this = Arc::clone(&this);
            async move {
                let limit = args
                    .as_ref()
                    .and_then(|args| args.get("limit"))
                    .and_then(Value::as_u64)
                    .unwrap_or(50) as usize;
                json_result(&this.events().recent(limit))
            }
        }),
    )
    .await;

    let this = Arc::clone(core);
    core.register_builtin(
        tool(
            "core_auth_login",
            "Run interactive OAuth login for the aggregator or a named upstream",
            json!({
                "type": "object",
                "properties": { "server": { "type": "string" } },
            }),
        ),
        handler!(|args| {
            let this = Arc::clone(&this);
            async move {
                let server = args
                    .as_ref()
                    .and_then(|args| args.get("server"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let endpoint = match &server {
                    Some(name) => match this.pool().client(name).await {
                        Some(client) => match client.spec().endpoint() {
                            Some(endpoint) => endpoint.to_string(),
                            None => {
                                return CallToolResult::error(format!(
                                    "upstream `{name}` uses stdio and has no auth endpoint"
                                ));
                            }
                        },
                        None => {
                            return CallToolResult::error(format!("unknown upstream `{name}`"));
                        }
                    },
                    None => match this.auth().configured_aggregator_endpoint() {
                        Some(endpoint) => endpoint.to_string(),
                        None => {
                            return CallToolResult::error(
                                "no aggregator endpoint configured; pass `server`",
                            );
                        }
                    },
                };

                match this.auth().login(&endpoint, LoginOptions::default()).await {
                    Ok(_token) => {
                        this.events().record(MusterEvent::AuthCompleted {
                            endpoint: endpoint.clone(),
                        });
                        if server.is_none() {
                            // Aggregator login completes pending-auth mode.
                            this.set_pending_auth(false).await;
                        }
                        CallToolResult::text(format!("authenticated against `{endpoint}`"))
                    }
                    Err(err) => CallToolResult::error(err.to_string()),
                }
            }
        }),
    )
    .await;
}
