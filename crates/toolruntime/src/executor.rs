use crate::history::HistoryRecorder;
use crate::invoker::{InvokeRequest, NodeInvoker};
use crate::registry::ToolRegistry;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use toolcore::{
    ContextError, EventBroadcaster, EventEmitter, EventPayload, ExecutionContext, ExecutionEvent,
    ExecutionRecord, Graph, GraphError, NodeError, NodeId, NodeStatus, OutputSink, RunId,
    RunStatus, ToolDescriptor,
};

/// A validated graph with its tools resolved and its layers computed.
#[derive(Debug)]
pub struct RunPlan {
    pub graph: Graph,
    pub layers: Vec<Vec<NodeId>>,
    pub descriptors: HashMap<NodeId, Arc<ToolDescriptor>>,
}

impl RunPlan {
    pub fn new(graph: Graph, tools: &ToolRegistry) -> Result<Self, GraphError> {
        let layers = graph.topological_layers()?;
        let descriptors = tools.resolve(&graph)?;
        Ok(Self {
            graph,
            layers,
            descriptors,
        })
    }
}

/// Shared handles of one run, cloned into every node task.
#[derive(Clone)]
pub struct RunState {
    pub run_id: RunId,
    pub plan: Arc<RunPlan>,
    pub context: Arc<RwLock<ExecutionContext>>,
    pub cancel: CancellationToken,
}

/// Executes run plans layer by layer with bounded parallelism
#[derive(Clone)]
pub struct Scheduler {
    invoker: NodeInvoker,
    broadcaster: EventBroadcaster,
    history: Option<Arc<dyn HistoryRecorder>>,
    max_in_flight: usize,
    default_timeout: Option<Duration>,
}

impl Scheduler {
    pub fn new(invoker: NodeInvoker, broadcaster: EventBroadcaster, max_in_flight: usize) -> Self {
        Self {
            invoker,
            broadcaster,
            history: None,
            max_in_flight: max_in_flight.max(1),
            default_timeout: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Drive a run to a terminal status.
    ///
    /// Layers run strictly in order with a barrier between them. A node
    /// whose dependency did not complete is skipped; independent nodes keep
    /// running. Once the run is cancelled no further node starts, in-flight
    /// invocations are told to stop, and unstarted nodes end as cancelled.
    pub async fn run(&self, state: RunState) -> RunStatus {
        let start_time = Instant::now();
        let plan = state.plan.clone();

        self.publish(
            state.run_id,
            None,
            EventPayload::RunStarted {
                graph_id: plan.graph.id.clone(),
                node_count: plan.graph.nodes.len(),
                layer_count: plan.layers.len(),
            },
        );
        tracing::info!(
            run_id = %state.run_id,
            "Starting run of graph {} ({} nodes, {} layers)",
            plan.graph.id,
            plan.graph.nodes.len(),
            plan.layers.len()
        );

        for (depth, layer) in plan.layers.iter().enumerate() {
            if state.cancel.is_cancelled() {
                tracing::info!(run_id = %state.run_id, "Cancelled before layer {}", depth);
                break;
            }
            let ready = self.settle_blocked(&state, layer).await;
            self.run_layer(&state, ready).await;
        }

        let cancelled = state.cancel.is_cancelled();
        if cancelled {
            self.cancel_unstarted(&state).await;
        }

        let status = self.finish(&state, cancelled).await;
        tracing::info!(
            run_id = %state.run_id,
            "Run finished as {} in {}ms",
            status,
            start_time.elapsed().as_millis()
        );
        status
    }

    /// Mark nodes with an unsuccessful dependency and return the rest.
    async fn settle_blocked(&self, state: &RunState, layer: &[NodeId]) -> Vec<NodeId> {
        let graph = &state.plan.graph;
        let mut ready = Vec::with_capacity(layer.len());
        for node_id in layer {
            let blocked_by = {
                let ctx = state.context.read().await;
                graph.dependencies(node_id).into_iter().find_map(|dep| {
                    ctx.node_status(dep)
                        .filter(|s| {
                            matches!(s, NodeStatus::Error | NodeStatus::Skipped | NodeStatus::Cancelled)
                        })
                        .map(|s| (dep.clone(), s))
                })
            };
            match blocked_by {
                None => ready.push(node_id.clone()),
                Some((dep, dep_status)) => {
                    let cancelled = dep_status == NodeStatus::Cancelled && state.cancel.is_cancelled();
                    tracing::info!("Node {} skipped: dependency {} is {}", node_id, dep, dep_status);
                    if cancelled {
                        self.settle(state, node_id, |ctx| ctx.record_node_cancelled(node_id), NodeStatus::Cancelled, None)
                            .await;
                    } else {
                        self.settle(state, node_id, |ctx| ctx.record_node_skipped(node_id), NodeStatus::Skipped, None)
                            .await;
                    }
                }
            }
        }
        ready
    }

    async fn run_layer(&self, state: &RunState, ready: Vec<NodeId>) {
        let mut queue = ready.into_iter();
        let mut running = FuturesUnordered::new();

        loop {
            while running.len() < self.max_in_flight && !state.cancel.is_cancelled() {
                let Some(node_id) = queue.next() else {
                    break;
                };
                let this = self.clone();
                let task_state = state.clone();
                let task_node = node_id.clone();
                let handle = tokio::spawn(async move { this.run_node(&task_state, &task_node).await });
                running.push(async move { (node_id, handle.await) });
            }

            let Some((node_id, joined)) = running.next().await else {
                break;
            };
            if let Err(e) = joined {
                tracing::error!("Node {} task failed: {}", node_id, e);
                let error = NodeError::ToolFailed {
                    message: format!("node task failed: {}", e),
                };
                let message = error.to_string();
                self.settle(
                    state,
                    &node_id,
                    |ctx| ctx.record_node_error(&node_id, error),
                    NodeStatus::Error,
                    Some(message),
                )
                .await;
            }
        }
        // Anything left in `queue` was never started; `cancel_unstarted` handles it.
    }

    async fn run_node(&self, state: &RunState, node_id: &str) {
        let plan = &state.plan;
        let (Some(spec), Some(descriptor)) = (plan.graph.find_node(node_id), plan.descriptors.get(node_id))
        else {
            tracing::error!("Node {} is not part of the plan", node_id);
            return;
        };

        if !self
            .apply(state, node_id, |ctx| ctx.record_node_start(node_id))
            .await
        {
            return;
        }

        let emitter = EventEmitter::new(state.run_id, node_id.to_string(), self.broadcaster.clone());
        emitter.emit(EventPayload::NodeStarted {
            tool: spec.tool.clone(),
            attempt: 1,
        });

        let inputs = {
            let ctx = state.context.read().await;
            ctx.compute_node_inputs(&plan.graph, node_id)
        };
        let inputs = match inputs {
            Ok(inputs) => inputs,
            Err(e) => return self.fail(state, node_id, e).await,
        };

        let executor = match self.invoker.select(descriptor) {
            Ok(executor) => executor,
            Err(e) => return self.fail(state, node_id, e).await,
        };
        let strategy = executor.strategy();
        if !self
            .apply(state, node_id, |ctx| ctx.record_node_strategy(node_id, strategy))
            .await
        {
            return;
        }

        let timeout = spec
            .timeout_ms
            .or(descriptor.timeout_ms)
            .map(Duration::from_millis)
            .or(self.default_timeout);
        let node_cancel = state.cancel.child_token();
        let sink: Arc<dyn OutputSink> = Arc::new(emitter.clone());
        let node_start = Instant::now();
        tracing::info!("Executing node {} ({} via {})", node_id, spec.tool, strategy);

        let mut attempt = 1;
        loop {
            let request = InvokeRequest {
                run_id: state.run_id,
                node_id,
                inputs: inputs.clone(),
                sink: sink.clone(),
                cancel: node_cancel.clone(),
                timeout,
            };
            let error = match self.invoker.execute(executor.clone(), request).await {
                Ok(output) => {
                    tracing::info!(
                        "Node {} completed in {}ms",
                        node_id,
                        node_start.elapsed().as_millis()
                    );
                    self.settle(
                        state,
                        node_id,
                        |ctx| ctx.record_node_result(node_id, output),
                        NodeStatus::Completed,
                        None,
                    )
                    .await;
                    return;
                }
                Err(e) => e,
            };

            let policy = spec
                .retry
                .as_ref()
                .filter(|p| error.is_retryable() && attempt < p.max_attempts);
            let Some(policy) = policy else {
                return self.fail(state, node_id, error).await;
            };

            let delay = policy.delay_after(attempt);
            tracing::warn!(
                "Node {} attempt {} failed ({}), retrying in {:?}",
                node_id,
                attempt,
                error,
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = node_cancel.cancelled() => {
                    return self.fail(state, node_id, NodeError::Cancelled).await;
                }
            }
            attempt = {
                let mut ctx = state.context.write().await;
                match ctx.record_node_retry(node_id) {
                    Ok(attempt) => attempt,
                    Err(e) => {
                        self.scheduler_fault(&mut ctx, node_id, e);
                        return;
                    }
                }
            };
            emitter.emit(EventPayload::NodeStarted {
                tool: spec.tool.clone(),
                attempt,
            });
        }
    }

    /// Record a node failure. Cancellation is recorded as its own status.
    async fn fail(&self, state: &RunState, node_id: &str, error: NodeError) {
        if error == NodeError::Cancelled {
            tracing::info!("Node {} cancelled", node_id);
            self.settle(
                state,
                node_id,
                |ctx| ctx.record_node_cancelled(node_id),
                NodeStatus::Cancelled,
                None,
            )
            .await;
        } else {
            tracing::error!("Node {} failed: {}", node_id, error);
            let message = error.to_string();
            self.settle(
                state,
                node_id,
                |ctx| ctx.record_node_error(node_id, error),
                NodeStatus::Error,
                Some(message),
            )
            .await;
        }
    }

    /// Apply a terminal transition and announce it.
    async fn settle<F>(
        &self,
        state: &RunState,
        node_id: &str,
        transition: F,
        status: NodeStatus,
        error: Option<String>,
    ) where
        F: FnOnce(&mut ExecutionContext) -> Result<(), ContextError>,
    {
        if self.apply(state, node_id, transition).await {
            self.publish(
                state.run_id,
                Some(node_id),
                EventPayload::NodeStatusChanged { status, error },
            );
        }
    }

    /// Apply a transition. An invalid one is a scheduler fault: logged, recorded on the run, never retried.
    async fn apply<F>(&self, state: &RunState, node_id: &str, transition: F) -> bool
    where
        F: FnOnce(&mut ExecutionContext) -> Result<(), ContextError>,
    {
        let mut ctx = state.context.write().await;
        match transition(&mut ctx) {
            Ok(()) => true,
            Err(e) => {
                self.scheduler_fault(&mut ctx, node_id, e);
                false
            }
        }
    }

    fn scheduler_fault(&self, ctx: &mut ExecutionContext, node_id: &str, error: ContextError) {
        tracing::error!(run_id = %ctx.run_id(), "Context rejected update for node {}: {}", node_id, error);
        if ctx.error().is_none() {
            let _ = ctx.record_run_error(format!("node {}: {}", node_id, error));
        }
    }

    async fn cancel_unstarted(&self, state: &RunState) {
        let pending: Vec<NodeId> = {
            let ctx = state.context.read().await;
            ctx.nodes()
                .iter()
                .filter(|(_, rec)| rec.status == NodeStatus::Pending)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for node_id in pending {
            self.settle(
                state,
                &node_id,
                |ctx| ctx.record_node_cancelled(&node_id),
                NodeStatus::Cancelled,
                None,
            )
            .await;
        }
    }

    async fn finish(&self, state: &RunState, cancelled: bool) -> RunStatus {
        let (status, snapshot) = {
            let mut ctx = state.context.write().await;
            let preempted =
                cancelled && ctx.nodes().values().any(|n| n.status == NodeStatus::Cancelled);
            let status = ctx.derive_status(preempted);
            if let Err(e) = ctx.finish(status) {
                tracing::error!(run_id = %state.run_id, "Failed to finish run: {}", e);
            }
            (ctx.status(), ctx.clone())
        };

        if let Some(history) = &self.history {
            if let Err(e) = history.record(ExecutionRecord::from_context(&snapshot)).await {
                tracing::error!(run_id = %state.run_id, "Failed to record history: {}", e);
            }
        }

        let duration_ms = snapshot.duration_ms();
        let payload = match status {
            RunStatus::Failed => {
                let mut errors = snapshot.node_errors();
                if errors.is_empty() {
                    if let Some(message) = snapshot.error() {
                        errors.insert("*".to_string(), message.to_string());
                    }
                }
                EventPayload::RunFailed {
                    status,
                    errors,
                    duration_ms,
                }
            }
            _ => EventPayload::RunCompleted {
                status,
                duration_ms,
            },
        };
        self.publish(state.run_id, None, payload);
        self.broadcaster.close_run(state.run_id);
        status
    }

    fn publish(&self, run_id: RunId, node_id: Option<&str>, payload: EventPayload) {
        let event = match node_id {
            Some(node_id) => ExecutionEvent::node(run_id, node_id, payload),
            None => ExecutionEvent::run(run_id, payload),
        };
        self.broadcaster.publish(event);
    }
}
