//! Tool graph execution runtime
//!
//! Registries for tool descriptors and in-process modules, the process
//! supervisor and node invoker, the layered scheduler, run history and the
//! `FlowRuntime` facade that ties them together.

mod config;
mod executor;
mod history;
mod invoker;
mod loader;
mod registry;
mod runtime;
mod supervisor;

pub use config::{ConfigError, RuntimeConfig};
pub use executor::{RunPlan, RunState, Scheduler};
pub use history::{HistoryError, HistoryRecorder, InMemoryHistory, JsonlHistory};
pub use invoker::{
    encode_args, resolve_on_path, stderr_tail, Executor, Invocation, InvokeRequest, NodeInvoker,
    STDERR_TAIL_LINES,
};
pub use loader::{CatalogError, ToolCatalogLoader};
pub use registry::{ModuleEntry, ModuleRegistry, ToolRegistry};
pub use runtime::FlowRuntime;
pub use supervisor::{
    ProcessOutcome, ProcessSpec, ProcessSupervisor, SupervisorError, DEFAULT_GRACE_PERIOD,
};
