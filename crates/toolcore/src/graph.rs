use crate::{GraphError, Value};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

pub type GraphId = String;
pub type NodeId = String;
pub type EdgeId = String;

/// Output slot an edge reads when it does not name one.
pub const DEFAULT_OUTPUT_SLOT: &str = "output";

/// Complete graph document as produced by the authoring UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default = "new_graph_id")]
    pub id: GraphId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn new_graph_id() -> GraphId {
    Uuid::new_v4().to_string()
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_graph_id(),
            name: Some(name.into()),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Wire `source.source_output` into `target.target_input`.
    pub fn connect(
        &mut self,
        source: impl Into<NodeId>,
        source_output: impl Into<String>,
        target: impl Into<NodeId>,
        target_input: impl Into<String>,
    ) -> EdgeId {
        let id = format!("e{}", self.edges.len() + 1);
        self.edges.push(Edge {
            id: id.clone(),
            source: source.into(),
            target: target.into(),
            source_output: Some(source_output.into()),
            target_input: Some(target_input.into()),
        });
        id
    }

    /// Ordering-only dependency; the default output slot is still carried.
    pub fn depend(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> EdgeId {
        let id = format!("e{}", self.edges.len() + 1);
        self.edges.push(Edge {
            id: id.clone(),
            source: source.into(),
            target: target.into(),
            source_output: None,
            target_input: None,
        });
        id
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn incoming_edges<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Direct upstream nodes, deduplicated, in edge order.
    pub fn dependencies<'a>(&'a self, id: &'a str) -> Vec<&'a NodeId> {
        let mut seen = HashSet::new();
        self.incoming_edges(id)
            .map(|e| &e.source)
            .filter(|s| seen.insert(s.as_str()))
            .collect()
    }

    /// Direct downstream nodes, deduplicated, in edge order.
    pub fn dependents(&self, id: &str) -> Vec<&NodeId> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.source == id)
            .map(|e| &e.target)
            .filter(|t| seen.insert(t.as_str()))
            .collect()
    }

    /// Every node reachable from `id` along edges, excluding `id` itself.
    pub fn downstream_of(&self, id: &str) -> HashSet<NodeId> {
        let mut reached = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for next in self.dependents(current) {
                if next.as_str() != id && reached.insert(next.clone()) {
                    queue.push_back(next.as_str());
                }
            }
        }
        reached
    }

    /// Check referential integrity, id uniqueness and acyclicity.
    ///
    /// Cycles are found with white/gray/black DFS coloring; the reported
    /// edge is the back-edge that closed the cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(GraphError::DuplicateEdge(edge.id.clone()));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !node_ids.contains(endpoint.as_str()) {
                    return Err(GraphError::UnknownNode {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }

        let indexed = IndexedGraph::build(self);
        if let Some(edge_pos) = indexed.find_back_edge() {
            let edge = &self.edges[edge_pos];
            return Err(GraphError::Cycle {
                edge: edge.id.clone(),
                from: edge.source.clone(),
                to: edge.target.clone(),
            });
        }
        Ok(())
    }

    /// Group nodes into dependency layers.
    ///
    /// A node with no incoming edges sits in layer 0; any other node sits
    /// one layer past its deepest dependency. Order inside a layer is not
    /// meaningful.
    pub fn topological_layers(&self) -> Result<Vec<Vec<NodeId>>, GraphError> {
        self.validate()?;
        let indexed = IndexedGraph::build(self);
        let order = toposort(&indexed.dag, None).map_err(|cycle| {
            // validate() already rejected cycles; report the node if it ever happens.
            let node = indexed.dag[cycle.node_id()].clone();
            GraphError::Cycle {
                edge: String::new(),
                from: node.clone(),
                to: node,
            }
        })?;

        let mut depth: HashMap<NodeIndex, usize> = HashMap::with_capacity(order.len());
        for idx in &order {
            let level = indexed
                .dag
                .neighbors_directed(*idx, Direction::Incoming)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*idx, level);
        }

        let layer_count = depth.values().max().map(|d| d + 1).unwrap_or(0);
        let mut layers = vec![Vec::new(); layer_count];
        // Declaration order inside each layer keeps output readable.
        for node in &self.nodes {
            let idx = indexed.index[node.id.as_str()];
            layers[depth[&idx]].push(node.id.clone());
        }
        Ok(layers)
    }
}

/// petgraph view of a [`Graph`]; edge weights are positions in `Graph::edges`.
struct IndexedGraph<'a> {
    dag: DiGraph<NodeId, usize>,
    index: HashMap<&'a str, NodeIndex>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl<'a> IndexedGraph<'a> {
    /// Caller guarantees every edge endpoint exists.
    fn build(graph: &'a Graph) -> Self {
        let mut dag = DiGraph::new();
        let mut index = HashMap::new();
        for node in &graph.nodes {
            index.insert(node.id.as_str(), dag.add_node(node.id.clone()));
        }
        for (pos, edge) in graph.edges.iter().enumerate() {
            if let (Some(from), Some(to)) =
                (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
            {
                dag.add_edge(*from, *to, pos);
            }
        }
        Self { dag, index }
    }

    /// Iterative DFS coloring. Returns the position of the first back-edge.
    fn find_back_edge(&self) -> Option<usize> {
        let mut color = vec![Color::White; self.dag.node_count()];

        for root in self.dag.node_indices() {
            if color[root.index()] != Color::White {
                continue;
            }
            color[root.index()] = Color::Gray;
            let mut stack: Vec<(NodeIndex, Vec<(NodeIndex, usize)>)> =
                vec![(root, self.outgoing(root))];

            loop {
                let Some((node, pending)) = stack.last_mut() else {
                    break;
                };
                let node = *node;
                match pending.pop() {
                    Some((next, edge_pos)) => match color[next.index()] {
                        Color::Gray => return Some(edge_pos),
                        Color::White => {
                            color[next.index()] = Color::Gray;
                            stack.push((next, self.outgoing(next)));
                        }
                        Color::Black => {}
                    },
                    None => {
                        color[node.index()] = Color::Black;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    fn outgoing(&self, node: NodeIndex) -> Vec<(NodeIndex, usize)> {
        self.dag
            .edges_directed(node, Direction::Outgoing)
            .map(|e| (e.target(), *e.weight()))
            .collect()
    }
}

/// Node specification in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    /// Name of the tool descriptor this node invokes.
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputPort>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            name: None,
            inputs: Vec::new(),
            config: HashMap::new(),
            timeout_ms: None,
            retry: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, required: bool) -> Self {
        self.inputs.push(InputPort {
            name: name.into(),
            required,
        });
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }
}

/// Declared input port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputPort {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

/// Data dependency between two nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_input: Option<String>,
}

impl Edge {
    pub fn source_slot(&self) -> &str {
        self.source_output.as_deref().unwrap_or(DEFAULT_OUTPUT_SLOT)
    }

    /// Falls back to the source slot name when the edge leaves it unset.
    pub fn target_slot(&self) -> &str {
        self.target_input.as_deref().unwrap_or_else(|| self.source_slot())
    }
}

/// Retry policy for node execution. Only applied when a node opts in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        std::time::Duration::from_millis(ms.min(u64::MAX as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}
