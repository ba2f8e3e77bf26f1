//! Core abstractions for the tool orchestration engine
//!
//! Graph documents, tool descriptors, the per-run execution context, run
//! events and the broadcaster that fans them out, plus the traits that
//! in-process tool modules implement. Nothing here spawns processes.

mod context;
mod descriptor;
mod error;
pub mod events;
mod graph;
mod history;
mod node;
mod value;

pub use context::{ExecutionContext, NodeOutput, NodeRecord, NodeStatus, RunId, RunStatus};
pub use descriptor::{CliEntry, EnvEntry, InvocationMode, Strategy, ToolDescriptor};
pub use error::{ContextError, DescriptorError, FlowError, GraphError, ModuleError, NodeError};
pub use events::*;
pub use graph::{
    Edge, EdgeId, Graph, GraphId, InputPort, NodeId, NodeSpec, RetryPolicy, DEFAULT_OUTPUT_SLOT,
};
pub use history::{ExecutionRecord, HistoryFilter, NodeSummary};
pub use node::{
    BlockingToolModule, ModuleContext, NullSink, OutputSink, OutputStream, ToolModule, ToolResult,
};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
