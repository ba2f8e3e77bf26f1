use crate::config::RuntimeConfig;
use crate::executor::{RunPlan, RunState, Scheduler};
use crate::history::{HistoryError, HistoryRecorder, InMemoryHistory, JsonlHistory};
use crate::invoker::NodeInvoker;
use crate::loader::ToolCatalogLoader;
use crate::registry::{ModuleRegistry, ToolRegistry};
use crate::supervisor::ProcessSupervisor;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use toolcore::{
    EventBroadcaster, ExecutionContext, ExecutionRecord, FlowError, Graph, GraphError,
    HistoryFilter, NodeSpec, RunId, RunStatus, Subscription, ToolDescriptor, Value,
};
use uuid::Uuid;

/// Bookkeeping for a submitted run.
#[derive(Clone)]
struct RunHandle {
    context: Arc<RwLock<ExecutionContext>>,
    cancel: CancellationToken,
    done: watch::Receiver<Option<RunStatus>>,
}

impl RunHandle {
    async fn finished(self) -> ExecutionContext {
        let mut done = self.done;
        if done.wait_for(|status| status.is_some()).await.is_err() {
            tracing::warn!("Run task ended without reporting a status");
        }
        let snapshot = self.context.read().await.clone();
        snapshot
    }
}

/// Live and recently finished runs. Finished runs are evicted oldest first
/// once more than `retain` of them are held; their history records stay.
#[derive(Default)]
struct RunTable {
    handles: HashMap<RunId, RunHandle>,
    finished: VecDeque<RunId>,
}

impl RunTable {
    fn retire(&mut self, run_id: RunId, retain: usize) {
        self.finished.push_back(run_id);
        while self.finished.len() > retain {
            if let Some(evicted) = self.finished.pop_front() {
                self.handles.remove(&evicted);
                tracing::debug!(run_id = %evicted, "Evicted finished run");
            }
        }
    }
}

/// Main runtime for executing tool graphs
pub struct FlowRuntime {
    tools: Arc<ToolRegistry>,
    scheduler: Scheduler,
    broadcaster: EventBroadcaster,
    history: Arc<dyn HistoryRecorder>,
    runs: Arc<RwLock<RunTable>>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a runtime from explicit collaborators.
    pub fn new(
        config: RuntimeConfig,
        tools: ToolRegistry,
        modules: ModuleRegistry,
        history: Arc<dyn HistoryRecorder>,
    ) -> Self {
        let broadcaster = EventBroadcaster::new(config.event_buffer_size, config.subscriber_max_lag);
        let supervisor = ProcessSupervisor::new(config.grace_period());
        let invoker = NodeInvoker::new(Arc::new(modules), supervisor);
        let scheduler = Scheduler::new(invoker, broadcaster.clone(), config.max_in_flight)
            .with_history(history.clone())
            .with_default_timeout(config.default_node_timeout());

        Self {
            tools: Arc::new(tools),
            scheduler,
            broadcaster,
            history,
            runs: Arc::new(RwLock::new(RunTable::default())),
            config,
        }
    }

    /// Build a runtime the way the binaries do: tool catalog from
    /// `tools_dir` on top of `tools`, JSONL history when `history_path` is set.
    pub fn from_config(
        config: RuntimeConfig,
        mut tools: ToolRegistry,
        modules: ModuleRegistry,
    ) -> Result<Self, FlowError> {
        if let Some(dir) = &config.tools_dir {
            ToolCatalogLoader::new(dir)
                .load_into(&mut tools)
                .map_err(|e| FlowError::Config(e.to_string()))?;
        }
        let history: Arc<dyn HistoryRecorder> = match &config.history_path {
            Some(path) => Arc::new(
                JsonlHistory::new(path).map_err(|e| FlowError::Config(e.to_string()))?,
            ),
            None => Arc::new(InMemoryHistory::new()),
        };
        Ok(Self::new(config, tools, modules, history))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Structural checks plus tool resolution, without running anything.
    pub fn validate(&self, graph: &Graph) -> Result<Vec<Vec<String>>, GraphError> {
        let layers = graph.topological_layers()?;
        self.tools.resolve(graph)?;
        Ok(layers)
    }

    /// Validate, register and start a run. Returns as soon as the run is scheduled.
    pub async fn submit(
        &self,
        graph: Graph,
        inputs: HashMap<String, Value>,
    ) -> Result<RunId, FlowError> {
        let (run_id, _, _) = self.start(graph, inputs, false).await?;
        Ok(run_id)
    }

    /// Like [`submit`](Self::submit) but attached before the first event is emitted.
    pub async fn submit_and_subscribe(
        &self,
        graph: Graph,
        inputs: HashMap<String, Value>,
    ) -> Result<(RunId, Subscription), FlowError> {
        let (run_id, _, subscription) = self.start(graph, inputs, true).await?;
        let subscription = subscription
            .ok_or_else(|| FlowError::Execution("subscription was not created".into()))?;
        Ok((run_id, subscription))
    }

    async fn start(
        &self,
        graph: Graph,
        inputs: HashMap<String, Value>,
        subscribe: bool,
    ) -> Result<(RunId, RunHandle, Option<Subscription>), FlowError> {
        let plan = Arc::new(RunPlan::new(graph, &self.tools)?);
        let run_id = Uuid::new_v4();
        let context = Arc::new(RwLock::new(ExecutionContext::create(
            run_id,
            &plan.graph,
            inputs,
        )));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let handle = RunHandle {
            context: context.clone(),
            cancel: cancel.clone(),
            done: done_rx,
        };

        self.runs.write().await.handles.insert(run_id, handle.clone());

        let subscription = subscribe.then(|| self.broadcaster.subscribe(run_id));
        let scheduler = self.scheduler.clone();
        let runs = self.runs.clone();
        let retain = self.config.max_retained_runs.max(1);
        let state = RunState {
            run_id,
            plan,
            context,
            cancel,
        };
        tokio::spawn(async move {
            let status = scheduler.run(state).await;
            let _ = done_tx.send(Some(status));
            runs.write().await.retire(run_id, retain);
        });

        tracing::info!(%run_id, "Run submitted");
        Ok((run_id, handle, subscription))
    }

    /// Current snapshot of a run's context.
    pub async fn status(&self, run_id: RunId) -> Result<ExecutionContext, FlowError> {
        let context = self.handle_of(run_id).await?.context;
        let snapshot = context.read().await.clone();
        Ok(snapshot)
    }

    /// Request cancellation. Returns false when the run had already finished.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool, FlowError> {
        let handle = self.handle_of(run_id).await?;
        let finished = handle.done.borrow().is_some();
        if !finished {
            tracing::info!(%run_id, "Cancellation requested");
            handle.cancel.cancel();
        }
        Ok(!finished)
    }

    /// Wait for a run to reach a terminal status and return its final context.
    pub async fn wait(&self, run_id: RunId) -> Result<ExecutionContext, FlowError> {
        Ok(self.handle_of(run_id).await?.finished().await)
    }

    /// Submit and wait. Holds on to the run itself, so eviction cannot race the wait.
    pub async fn run(
        &self,
        graph: Graph,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionContext, FlowError> {
        let (_, handle, _) = self.start(graph, inputs, false).await?;
        Ok(handle.finished().await)
    }

    /// Run one tool as a single-node graph.
    pub async fn run_tool(
        &self,
        tool: &str,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionContext, FlowError> {
        let mut graph = Graph::new(format!("exec {}", tool));
        graph.add_node(NodeSpec::new(tool, tool));
        self.run(graph, inputs).await
    }

    /// Live events of a run. A finished run yields a stream that is already closed,
    /// so late subscribers neither hang nor hold a slot.
    pub async fn subscribe(&self, run_id: RunId) -> Result<Subscription, FlowError> {
        let context = self.handle_of(run_id).await?.context;
        // The run goes terminal before its topic is closed. Attaching first means
        // a non-terminal status here guarantees the close is still ahead of us.
        let subscription = self.broadcaster.subscribe(run_id);
        if context.read().await.status().is_terminal() {
            drop(subscription);
            return Ok(self.broadcaster.closed(run_id));
        }
        Ok(subscription)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.broadcaster.subscribe_all()
    }

    pub async fn history(
        &self,
        filter: &HistoryFilter,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        self.history.query(filter, limit).await
    }

    /// Ids and statuses of live runs and the finished runs still retained.
    pub async fn list_runs(&self) -> Vec<(RunId, RunStatus)> {
        let runs = self.runs.read().await;
        let mut listed = Vec::with_capacity(runs.handles.len());
        for (run_id, handle) in runs.handles.iter() {
            listed.push((*run_id, handle.context.read().await.status()));
        }
        listed
    }

    pub fn descriptors(&self) -> Vec<Arc<ToolDescriptor>> {
        self.tools.list()
    }

    async fn handle_of(&self, run_id: RunId) -> Result<RunHandle, FlowError> {
        self.runs
            .read()
            .await
            .handles
            .get(&run_id)
            .cloned()
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }
}
