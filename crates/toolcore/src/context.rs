use crate::{ContextError, Graph, NodeError, NodeId, Strategy, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

pub type RunId = Uuid;

/// Output slots produced by one node.
pub type NodeOutput = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Error => "error",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Per-node slice of the execution context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub tool: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output: NodeOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Mutable state of one run.
///
/// Every transition checks the node's prior status; an unexpected prior
/// status is a scheduler bug and is reported as
/// [`ContextError::InvalidTransition`]. Once the overall status is terminal
/// the context is frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    run_id: RunId,
    graph_id: String,
    status: RunStatus,
    nodes: BTreeMap<NodeId, NodeRecord>,
    inputs: HashMap<String, Value>,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ExecutionContext {
    pub fn create(run_id: RunId, graph: &Graph, inputs: HashMap<String, Value>) -> Self {
        let nodes = graph
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeRecord {
                        tool: n.tool.clone(),
                        status: NodeStatus::Pending,
                        output: NodeOutput::new(),
                        error: None,
                        strategy: None,
                        attempts: 0,
                        started_at: None,
                        ended_at: None,
                    },
                )
            })
            .collect();

        Self {
            run_id,
            graph_id: graph.id.clone(),
            status: RunStatus::Running,
            nodes,
            inputs,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_frozen(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, NodeRecord> {
        &self.nodes
    }

    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Error message per failed node, for run-level reporting.
    pub fn node_errors(&self) -> BTreeMap<NodeId, String> {
        self.nodes
            .iter()
            .filter(|(_, rec)| rec.status == NodeStatus::Error)
            .map(|(id, rec)| {
                let message = rec
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                (id.clone(), message)
            })
            .collect()
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn record_node_start(&mut self, node: &str) -> Result<(), ContextError> {
        let rec = self.transition(node, &[NodeStatus::Pending], NodeStatus::Running)?;
        rec.started_at = Some(Utc::now());
        rec.attempts = 1;
        Ok(())
    }

    /// Re-arm a running node for another attempt.
    pub fn record_node_retry(&mut self, node: &str) -> Result<u32, ContextError> {
        let rec = self.transition(node, &[NodeStatus::Running], NodeStatus::Running)?;
        rec.attempts += 1;
        rec.error = None;
        Ok(rec.attempts)
    }

    pub fn record_node_strategy(&mut self, node: &str, strategy: Strategy) -> Result<(), ContextError> {
        let rec = self.transition(node, &[NodeStatus::Running], NodeStatus::Running)?;
        rec.strategy = Some(strategy);
        Ok(())
    }

    pub fn record_node_result(&mut self, node: &str, output: NodeOutput) -> Result<(), ContextError> {
        let rec = self.transition(node, &[NodeStatus::Running], NodeStatus::Completed)?;
        rec.output = output;
        rec.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_node_error(&mut self, node: &str, error: NodeError) -> Result<(), ContextError> {
        let rec = self.transition(node, &[NodeStatus::Running], NodeStatus::Error)?;
        rec.error = Some(error);
        rec.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_node_skipped(&mut self, node: &str) -> Result<(), ContextError> {
        let rec = self.transition(node, &[NodeStatus::Pending], NodeStatus::Skipped)?;
        rec.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_node_cancelled(&mut self, node: &str) -> Result<(), ContextError> {
        let rec = self.transition(
            node,
            &[NodeStatus::Pending, NodeStatus::Running],
            NodeStatus::Cancelled,
        )?;
        rec.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Record an engine-level failure that is not attributable to one node.
    pub fn record_run_error(&mut self, message: impl Into<String>) -> Result<(), ContextError> {
        if self.is_frozen() {
            return Err(ContextError::Frozen);
        }
        self.error = Some(message.into());
        Ok(())
    }

    /// Overall status implied by the node records.
    pub fn derive_status(&self, cancelled: bool) -> RunStatus {
        if cancelled {
            RunStatus::Cancelled
        } else if self.error.is_some()
            || self.nodes.values().any(|n| n.status == NodeStatus::Error)
        {
            RunStatus::Failed
        } else if self.nodes.values().all(|n| n.status == NodeStatus::Completed) {
            RunStatus::Completed
        } else if self.nodes.values().any(|n| n.status == NodeStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        }
    }

    /// Move to a terminal status and freeze.
    pub fn finish(&mut self, status: RunStatus) -> Result<(), ContextError> {
        if self.is_frozen() {
            return Err(ContextError::Frozen);
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    fn transition(
        &mut self,
        node: &str,
        expected: &[NodeStatus],
        to: NodeStatus,
    ) -> Result<&mut NodeRecord, ContextError> {
        if self.status.is_terminal() {
            return Err(ContextError::Frozen);
        }
        let rec = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| ContextError::UnknownNode(node.to_string()))?;
        if !expected.contains(&rec.status) {
            return Err(ContextError::InvalidTransition {
                node: node.to_string(),
                from: rec.status,
                to,
            });
        }
        rec.status = to;
        Ok(rec)
    }

    /// Merge the inputs a node will be invoked with.
    ///
    /// Precedence, lowest first: the node's static config, values carried
    /// by incoming edges from completed upstream nodes, then run-level
    /// overrides. A bare override key applies to every node; a
    /// `<node_id>.<key>` override applies to that node only and beats the
    /// bare key. Required inputs still missing afterwards are reported.
    pub fn compute_node_inputs(
        &self,
        graph: &Graph,
        node_id: &str,
    ) -> Result<HashMap<String, Value>, NodeError> {
        let Some(spec) = graph.find_node(node_id) else {
            return Err(NodeError::MissingInputs { names: Vec::new() });
        };

        let mut merged = spec.config.clone();

        for edge in graph.incoming_edges(node_id) {
            let upstream = match self.nodes.get(&edge.source) {
                Some(rec) if rec.status == NodeStatus::Completed => rec,
                _ => continue,
            };
            if let Some(value) = upstream.output.get(edge.source_slot()) {
                merged.insert(edge.target_slot().to_string(), value.clone());
            }
        }

        let mut scoped = HashMap::new();
        for (key, value) in &self.inputs {
            match scope_of(graph, key) {
                Some((owner, local)) if owner == node_id => {
                    scoped.insert(local.to_string(), value.clone());
                }
                Some(_) => {}
                None => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged.extend(scoped);

        let missing: Vec<String> = spec
            .inputs
            .iter()
            .filter(|port| port.required)
            .filter(|port| merged.get(&port.name).map_or(true, Value::is_null))
            .map(|port| port.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(NodeError::MissingInputs { names: missing });
        }
        Ok(merged)
    }
}

/// Split a `<node_id>.<key>` override into its parts when the prefix names a node.
/// The longest matching node id wins, so `a.b.x` goes to node `a.b` over node `a`.
fn scope_of<'a>(graph: &'a Graph, key: &'a str) -> Option<(&'a str, &'a str)> {
    graph
        .nodes
        .iter()
        .filter_map(|n| {
            key.strip_prefix(n.id.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .filter(|local| !local.is_empty())
                .map(|local| (n.id.as_str(), local))
        })
        .max_by_key(|(owner, _)| owner.len())
}
