use crate::{ModuleError, NodeId, RunId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Progress or diagnostic lines from an in-process module.
    Log,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
            OutputStream::Log => "log",
        };
        f.write_str(name)
    }
}

/// Receives a running node's output, line by line, as it is produced.
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: OutputStream, line: &str);
}

/// Sink that discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn line(&self, _stream: OutputStream, _line: &str) {}
}

/// What an in-process module returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl ToolResult {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            message: String::new(),
            data: data.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Everything a module sees while it runs.
#[derive(Clone)]
pub struct ModuleContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    /// Merged inputs (config, upstream values, overrides).
    pub inputs: HashMap<String, Value>,
    pub output: Arc<dyn OutputSink>,
    pub cancellation: CancellationToken,
}

impl ModuleContext {
    pub fn new(run_id: RunId, node_id: impl Into<NodeId>, inputs: HashMap<String, Value>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            inputs,
            output: Arc::new(NullSink),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn require_input(&self, name: &str) -> Result<&Value, ModuleError> {
        self.inputs
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| ModuleError::new(format!("Missing input: {}", name)))
    }

    pub fn input_or(&self, name: &str, default: Value) -> Value {
        self.inputs.get(name).cloned().unwrap_or(default)
    }

    /// Forward a progress line to subscribers.
    pub fn log(&self, line: impl AsRef<str>) {
        self.output.line(OutputStream::Log, line.as_ref());
    }
}

/// In-process tool adapter that cooperates with the async runtime.
#[async_trait]
pub trait ToolModule: Send + Sync {
    /// Name the module is registered under.
    fn name(&self) -> &str;

    async fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError>;
}

/// In-process tool adapter that blocks; run on the blocking pool.
pub trait BlockingToolModule: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError>;
}
