use crate::{ExecutionContext, NodeId, NodeStatus, RunId, RunStatus, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSummary {
    pub tool: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable projection of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub run_id: RunId,
    pub graph_id: String,
    pub status: RunStatus,
    /// Distinct tool names used by the run, sorted.
    pub tools: Vec<String>,
    /// Run-level inputs the run was submitted with.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub nodes: BTreeMap<NodeId, NodeSummary>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let tools: BTreeSet<String> = ctx.nodes().values().map(|n| n.tool.clone()).collect();
        let nodes = ctx
            .nodes()
            .iter()
            .map(|(id, rec)| {
                (
                    id.clone(),
                    NodeSummary {
                        tool: rec.tool.clone(),
                        status: rec.status,
                        error: rec.error.as_ref().map(|e| e.to_string()),
                    },
                )
            })
            .collect();

        Self {
            run_id: ctx.run_id(),
            graph_id: ctx.graph_id().to_string(),
            status: ctx.status(),
            tools: tools.into_iter().collect(),
            parameters: ctx.inputs().clone(),
            nodes,
            started_at: ctx.started_at(),
            ended_at: ctx.ended_at(),
            duration_ms: ctx.duration_ms(),
        }
    }
}

/// History query. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(tool) = &self.tool {
            if !record.tools.iter().any(|t| t == tool) {
                return false;
            }
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.since.is_some_and(|since| record.started_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.started_at > until) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Graph, NodeSpec};
    use uuid::Uuid;

    #[test]
    fn record_lists_distinct_tools() {
        let mut g = Graph::new("g");
        g.add_node(NodeSpec::new("a", "scan"));
        g.add_node(NodeSpec::new("b", "scan"));
        g.add_node(NodeSpec::new("c", "migrate"));
        let mut ctx = ExecutionContext::create(Uuid::new_v4(), &g, HashMap::new());
        ctx.finish(RunStatus::Cancelled).unwrap();

        let record = ExecutionRecord::from_context(&ctx);
        assert_eq!(record.tools, vec!["migrate".to_string(), "scan".to_string()]);
        assert_eq!(record.nodes.len(), 3);

        let filter = HistoryFilter {
            tool: Some("scan".into()),
            status: Some(RunStatus::Cancelled),
            ..Default::default()
        };
        assert!(filter.matches(&record));
        let other = HistoryFilter {
            tool: Some("filter".into()),
            ..Default::default()
        };
        assert!(!other.matches(&record));
    }
}
