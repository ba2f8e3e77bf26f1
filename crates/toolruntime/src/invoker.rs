use crate::registry::{ModuleEntry, ModuleRegistry};
use crate::supervisor::{ProcessOutcome, ProcessSpec, ProcessSupervisor, SupervisorError};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolcore::{
    ModuleContext, ModuleError, NodeError, NodeOutput, OutputSink, RunId, Strategy,
    ToolDescriptor, ToolResult, Value,
};

/// Number of trailing stderr lines carried by `NonZeroExit`.
pub const STDERR_TAIL_LINES: usize = 20;

/// Build the flag vector for a CLI tool from merged inputs.
///
/// Keys are emitted in sorted order. `true` becomes a bare `--key`,
/// `false` and `null` are dropped, arrays repeat the flag once per element
/// and objects are passed as compact JSON.
pub fn encode_args(inputs: &HashMap<String, Value>) -> Vec<String> {
    let mut keys: Vec<&String> = inputs.keys().collect();
    keys.sort();

    let mut args = Vec::new();
    for key in keys {
        match &inputs[key] {
            Value::Array(items) => {
                for item in items {
                    push_flag(&mut args, key, item);
                }
            }
            value => push_flag(&mut args, key, value),
        }
    }
    args
}

fn push_flag(args: &mut Vec<String>, key: &str, value: &Value) {
    match value {
        Value::Null | Value::Bool(false) => {}
        Value::Bool(true) => args.push(format!("--{}", key)),
        other => {
            args.push(format!("--{}", key));
            args.push(other.to_arg_string());
        }
    }
}

/// Find `program` on `PATH`. Names containing a separator are checked as given.
pub fn resolve_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    resolve_in(&std::env::var_os("PATH")?, program)
}

/// Search a `PATH`-style list for the first executable named `program`.
fn resolve_in(path_var: &OsStr, program: &str) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .flat_map(|dir| executable_names(program).into_iter().map(move |name| dir.join(name)))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(windows)]
fn executable_names(program: &str) -> Vec<String> {
    vec![program.to_string(), format!("{}.exe", program), format!("{}.cmd", program)]
}

#[cfg(not(windows))]
fn executable_names(program: &str) -> Vec<String> {
    vec![program.to_string()]
}

/// A strategy that passed its availability check.
#[derive(Clone)]
pub enum Executor {
    Module { name: String, entry: ModuleEntry },
    Process { strategy: Strategy, spec: ProcessSpec },
}

impl Executor {
    pub fn strategy(&self) -> Strategy {
        match self {
            Executor::Module { .. } => Strategy::Module,
            Executor::Process { strategy, .. } => *strategy,
        }
    }
}

/// One invocation of a node.
pub struct InvokeRequest<'a> {
    pub run_id: RunId,
    pub node_id: &'a str,
    pub inputs: HashMap<String, Value>,
    pub sink: Arc<dyn OutputSink>,
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub strategy: Strategy,
    pub output: NodeOutput,
}

/// Picks an invocation strategy for a tool and runs it.
#[derive(Clone)]
pub struct NodeInvoker {
    modules: Arc<ModuleRegistry>,
    supervisor: ProcessSupervisor,
}

impl NodeInvoker {
    pub fn new(modules: Arc<ModuleRegistry>, supervisor: ProcessSupervisor) -> Self {
        Self {
            modules,
            supervisor,
        }
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Check strategies in the descriptor's order and return the first viable one.
    ///
    /// A forced mode checks only its own strategy and reports why it is not
    /// usable; `auto` falls through and only fails when nothing is usable.
    pub fn select(&self, descriptor: &ToolDescriptor) -> Result<Executor, NodeError> {
        if let Some(strategy) = descriptor.mode.forced() {
            return self
                .available(descriptor, strategy)
                .map_err(|reason| NodeError::ExecutorUnavailable { strategy, reason });
        }

        for strategy in descriptor.candidates() {
            match self.available(descriptor, strategy) {
                Ok(executor) => return Ok(executor),
                Err(reason) => {
                    tracing::debug!(tool = %descriptor.name, %strategy, "Strategy skipped: {}", reason);
                }
            }
        }
        Err(NodeError::NoAvailableExecutor {
            tool: descriptor.name.clone(),
        })
    }

    fn available(&self, descriptor: &ToolDescriptor, strategy: Strategy) -> Result<Executor, String> {
        match strategy {
            Strategy::Module => {
                let name = descriptor
                    .module
                    .as_deref()
                    .ok_or_else(|| "no module configured".to_string())?;
                let entry = self
                    .modules
                    .get(name)
                    .ok_or_else(|| format!("module '{}' is not registered", name))?;
                Ok(Executor::Module {
                    name: name.to_string(),
                    entry,
                })
            }
            Strategy::IsolatedEnv => {
                let env = descriptor
                    .isolated_env
                    .as_ref()
                    .ok_or_else(|| "no isolated environment configured".to_string())?;
                if !env.executable.is_file() {
                    return Err(format!("executable not found: {}", env.executable.display()));
                }
                Ok(Executor::Process {
                    strategy,
                    spec: ProcessSpec::new(&env.executable).args(env.args.iter().cloned()),
                })
            }
            Strategy::GlobalCli => {
                let cli = descriptor
                    .cli
                    .as_ref()
                    .ok_or_else(|| "no CLI configured".to_string())?;
                let program = resolve_on_path(&cli.program)
                    .ok_or_else(|| format!("'{}' not found on PATH", cli.program))?;
                Ok(Executor::Process {
                    strategy,
                    spec: ProcessSpec::new(program).args(cli.args.iter().cloned()),
                })
            }
        }
    }

    /// Select a strategy and run it.
    pub async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        request: InvokeRequest<'_>,
    ) -> Result<Invocation, NodeError> {
        let executor = self.select(descriptor)?;
        let strategy = executor.strategy();
        let output = self.execute(executor, request).await?;
        Ok(Invocation { strategy, output })
    }

    /// Run an already selected executor.
    pub async fn execute(
        &self,
        executor: Executor,
        request: InvokeRequest<'_>,
    ) -> Result<NodeOutput, NodeError> {
        match executor {
            Executor::Module { name, entry } => {
                tracing::debug!(node = request.node_id, module = %name, "Running module");
                self.run_module(entry, request).await
            }
            Executor::Process { strategy, spec } => {
                let spec = spec.args(encode_args(&request.inputs));
                self.run_process(strategy, spec, request).await
            }
        }
    }

    async fn run_module(
        &self,
        entry: ModuleEntry,
        request: InvokeRequest<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let InvokeRequest {
            run_id,
            node_id,
            inputs,
            sink,
            cancel,
            timeout,
        } = request;
        let ctx = ModuleContext::new(run_id, node_id, inputs)
            .with_output(sink)
            .with_cancellation(cancel.clone());

        let work = async move {
            match entry {
                ModuleEntry::Async(module) => module.run(ctx).await,
                // A blocking module cannot be interrupted; on cancel or
                // timeout its thread is left to finish on its own.
                ModuleEntry::Blocking(module) => {
                    match tokio::task::spawn_blocking(move || module.run(ctx)).await {
                        Ok(result) => result,
                        Err(e) => Err(ModuleError::new(format!("Module task failed: {}", e))),
                    }
                }
            }
        };

        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let result = tokio::select! {
            biased;
            result = work => result,
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            _ = deadline => {
                let ms = timeout.map_or(0, |t| t.as_millis() as u64);
                return Err(NodeError::Timeout { ms });
            }
        };

        match result {
            Ok(result) if result.success => Ok(module_output(result)),
            // A module that bails out because it saw the token was cancelled, not broken.
            _ if cancel.is_cancelled() => Err(NodeError::Cancelled),
            Ok(result) => Err(NodeError::ToolFailed {
                message: result.message,
            }),
            Err(e) => Err(NodeError::ToolFailed { message: e.0 }),
        }
    }

    async fn run_process(
        &self,
        strategy: Strategy,
        spec: ProcessSpec,
        request: InvokeRequest<'_>,
    ) -> Result<NodeOutput, NodeError> {
        tracing::debug!(node = request.node_id, "Running: {}", spec.display());
        let outcome = self
            .supervisor
            .run(&spec, request.sink, &request.cancel, request.timeout)
            .await
            .map_err(|e| match e {
                SupervisorError::Cancelled => NodeError::Cancelled,
                SupervisorError::Timeout { ms } => NodeError::Timeout { ms },
                // Spawn can still fail after a successful check (permissions, races).
                other => NodeError::ExecutorUnavailable {
                    strategy,
                    reason: other.to_string(),
                },
            })?;

        if !outcome.success() {
            return Err(NodeError::NonZeroExit {
                code: outcome.exit_code,
                stderr_tail: stderr_tail(&outcome.stderr, STDERR_TAIL_LINES),
            });
        }
        Ok(process_output(outcome))
    }
}

/// Last `lines` lines of `stderr`.
pub fn stderr_tail(stderr: &str, lines: usize) -> String {
    let all: Vec<&str> = stderr.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Stdout as JSON when it parses, otherwise the trimmed text.
fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(json) if !trimmed.is_empty() => Value::from(json),
        _ => Value::String(trimmed.to_string()),
    }
}

fn process_output(outcome: ProcessOutcome) -> NodeOutput {
    let parsed = parse_stdout(&outcome.stdout);
    let mut output = NodeOutput::new();
    output.insert(
        "exit_code".into(),
        outcome.exit_code.map_or(Value::Null, Value::from),
    );
    output.insert("stdout".into(), Value::String(outcome.stdout));
    output.insert("stderr".into(), Value::String(outcome.stderr));
    expose_fields(&mut output, &parsed);
    output.insert("output".into(), parsed);
    output
}

fn module_output(result: ToolResult) -> NodeOutput {
    let mut output = NodeOutput::new();
    output.insert("success".into(), Value::Bool(result.success));
    output.insert("message".into(), Value::String(result.message));
    expose_fields(&mut output, &result.data);
    output.insert("output".into(), result.data.clone());
    output.insert("data".into(), result.data);
    output
}

/// Lift the keys of an object result into top-level slots without clobbering fixed ones.
fn expose_fields(output: &mut NodeOutput, value: &Value) {
    if let Some(fields) = value.as_object() {
        for (key, field) in fields {
            if !matches!(
                key.as_str(),
                "stdout" | "stderr" | "exit_code" | "output" | "success" | "message" | "data"
            ) {
                output.insert(key.clone(), field.clone());
            }
        }
    }
}
