use super::EventBroadcaster;
use crate::{NodeId, NodeStatus, OutputSink, OutputStream, RunId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One event of a run, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

/// Events emitted during run execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EventPayload {
    RunStarted {
        graph_id: String,
        node_count: usize,
        layer_count: usize,
    },
    NodeStarted {
        tool: String,
        attempt: u32,
    },
    NodeOutput {
        stream: OutputStream,
        line: String,
    },
    /// Only terminal node statuses are announced.
    NodeStatusChanged {
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunCompleted {
        status: RunStatus,
        duration_ms: u64,
    },
    RunFailed {
        status: RunStatus,
        errors: BTreeMap<NodeId, String>,
        duration_ms: u64,
    },
}

impl ExecutionEvent {
    pub fn run(run_id: RunId, payload: EventPayload) -> Self {
        Self {
            run_id,
            node_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn node(run_id: RunId, node_id: impl Into<NodeId>, payload: EventPayload) -> Self {
        Self {
            run_id,
            node_id: Some(node_id.into()),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// `RunCompleted` or `RunFailed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::RunCompleted { .. } | EventPayload::RunFailed { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::RunStarted { .. } => "RunStarted",
            EventPayload::NodeStarted { .. } => "NodeStarted",
            EventPayload::NodeOutput { .. } => "NodeOutput",
            EventPayload::NodeStatusChanged { .. } => "NodeStatusChanged",
            EventPayload::RunCompleted { .. } => "RunCompleted",
            EventPayload::RunFailed { .. } => "RunFailed",
        }
    }
}

/// Event emitter bound to one node, handed to invocations as their output sink
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    node_id: NodeId,
    broadcaster: EventBroadcaster,
}

impl EventEmitter {
    pub fn new(run_id: RunId, node_id: NodeId, broadcaster: EventBroadcaster) -> Self {
        Self {
            run_id,
            node_id,
            broadcaster,
        }
    }

    pub fn emit(&self, payload: EventPayload) {
        self.broadcaster
            .publish(ExecutionEvent::node(self.run_id, self.node_id.clone(), payload));
    }
}

impl OutputSink for EventEmitter {
    fn line(&self, stream: OutputStream, line: &str) {
        self.emit(EventPayload::NodeOutput {
            stream,
            line: line.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn wire_shape_is_flat_with_typed_payload() {
        let event = ExecutionEvent::node(
            Uuid::nil(),
            "scan",
            EventPayload::NodeStatusChanged {
                status: NodeStatus::Completed,
                error: None,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "NodeStatusChanged");
        assert_eq!(json["node_id"], "scan");
        assert_eq!(json["payload"]["status"], "completed");
        assert!(json["payload"].get("error").is_none());

        let back: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn run_events_omit_node_id() {
        let event = ExecutionEvent::run(
            Uuid::nil(),
            EventPayload::RunCompleted {
                status: RunStatus::Cancelled,
                duration_ms: 5,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("node_id").is_none());
        assert!(event.is_terminal());
    }
}
