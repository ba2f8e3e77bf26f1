use crate::context::NodeStatus;
use crate::descriptor::Strategy;
use crate::graph::{EdgeId, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems found before a run starts. Always fatal to the submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Duplicate edge id: {0}")]
    DuplicateEdge(EdgeId),

    #[error("Edge '{edge}' references unknown node '{node}'")]
    UnknownNode { edge: EdgeId, node: NodeId },

    #[error("Cycle detected at edge '{edge}' ({from} -> {to})")]
    Cycle { edge: EdgeId, from: NodeId, to: NodeId },

    #[error("Node '{node}' references unknown tool '{tool}'")]
    UnknownTool { node: NodeId, tool: String },
}

/// Failure of a single node. Contained to the node and its dependents.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    #[error("Missing required inputs: {}", .names.join(", "))]
    MissingInputs { names: Vec<String> },

    #[error("Executor unavailable ({strategy}): {reason}")]
    ExecutorUnavailable { strategy: Strategy, reason: String },

    #[error("No available executor for tool '{tool}'")]
    NoAvailableExecutor { tool: String },

    #[error("Process exited with code {}: {stderr_tail}", exit_code_label(.code))]
    NonZeroExit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Tool failed: {message}")]
    ToolFailed { message: String },
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

impl NodeError {
    /// Whether a scheduler-level retry policy may re-invoke the node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::NonZeroExit { .. } | NodeError::Timeout { .. } | NodeError::ToolFailed { .. }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Invalid transition for node '{node}': {from} -> {to}")]
    InvalidTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Execution context is frozen")]
    Frozen,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Tool name must not be empty")]
    EmptyName,

    #[error("Tool '{0}' declares no invocation path")]
    NoInvocationPath(String),

    #[error("Tool '{tool}' forces {strategy} but does not configure it")]
    MissingStrategy { tool: String, strategy: Strategy },
}

/// Raised by an in-process tool module.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ModuleError(pub String);

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
