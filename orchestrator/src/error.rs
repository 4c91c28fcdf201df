use thiserror::Error;

use muster_graph::GraphError;
use muster_protocol::ToolCallError;

use crate::template::TemplateError;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown service `{name}`")]
    UnknownService { name: String },

    #[error("unknown service class `{name}`")]
    UnknownClass { name: String },

    #[error("service `{name}` already exists")]
    DuplicateService { name: String },

    #[error("invalid args for class `{class}`: {reason}")]
    InvalidArgs { class: String, reason: String },

    #[error("dependency `{dependency}` of `{name}` is not ready")]
    DependencyNotReady { name: String, dependency: String },

    #[error("lifecycle tool `{tool}` is not available")]
    MissingTool { tool: String },

    #[error("template resolution failed for `{name}`: {source}")]
    TemplateResolutionFailed {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error("step `{tool}` failed: {message}")]
    StepFailed { tool: String, message: String },

    #[error("service `{name}` must be stopped first")]
    NotStopped { name: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Invoker(#[from] ToolCallError),
}
