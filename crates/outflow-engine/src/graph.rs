//! Workflow graph model — the immutable per-agent definition.
//!
//! A graph is a set of nodes plus ordered, optionally-labeled edges.
//! Labels carry branch paths (`yes`/`no`, `success`/`error`/`failure`);
//! an unlabeled edge is unconditional and doubles as the default branch.

use serde::{Deserialize, Serialize};

use crate::actions::ActionSpec;
use crate::conditions::ConditionSpec;

/// A unit in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Node behavior. Action kinds are a closed enum — adding one is a
/// compile-time-checked change, not a string registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Gates workflow entry on an event.
    Trigger {
        event: String,
    },
    /// Picks a `yes`/`no` edge from a condition over the context.
    Condition {
        #[serde(flatten)]
        condition: ConditionSpec,
    },
    /// Calls the text-generation collaborator; the produced message is
    /// returned to the caller, never delivered here.
    ConversationStep {
        #[serde(default)]
        name: String,
        #[serde(default)]
        instructions: String,
        #[serde(default)]
        objective: String,
        /// Bound on reply-evaluation attempts before the failure path.
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(default)]
        step_number: u32,
    },
    /// Side-effecting action, executed by the registry.
    Action {
        #[serde(flatten)]
        action: ActionSpec,
    },
}

impl Node {
    pub fn node_type(&self) -> &'static str {
        match &self.kind {
            NodeKind::Trigger { .. } => "trigger",
            NodeKind::Condition { .. } => "condition",
            NodeKind::ConversationStep { .. } => "conversation_step",
            NodeKind::Action { .. } => "action",
        }
    }
}

/// Directed edge. `label` selects the branch; `None` is unconditional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// A complete workflow definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn from_json(definition: &serde_json::Value) -> outflow_core::Result<Self> {
        serde_json::from_value(definition.clone()).map_err(|e| {
            outflow_core::OutflowError::Validation(format!("invalid workflow definition: {e}"))
        })
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The trigger for an event: exact match, then a `message_received`
    /// trigger, then any trigger at all.
    pub fn trigger_for_event(&self, event: &str) -> Option<&Node> {
        let exact = self.nodes.iter().find(|n| {
            matches!(&n.kind, NodeKind::Trigger { event: e } if e == event)
        });
        if exact.is_some() {
            return exact;
        }
        let fallback = self.nodes.iter().find(|n| {
            matches!(&n.kind, NodeKind::Trigger { event: e } if e == "message_received")
        });
        if fallback.is_some() {
            return fallback;
        }
        self.nodes
            .iter()
            .find(|n| matches!(&n.kind, NodeKind::Trigger { .. }))
    }

    /// Edges leaving a node, in definition order.
    pub fn edges_from(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    /// The next node after `current`, honoring a branch path when present.
    ///
    /// With a path: the matching labeled edge wins; otherwise an unlabeled
    /// (default) edge is followed when one exists; otherwise the branch
    /// ends. Without a path: the first outgoing edge.
    pub fn next_node(&self, current: &str, path: Option<&str>) -> Option<&Node> {
        let edges = self.edges_from(current);
        let edge = match path {
            Some(path) => edges
                .iter()
                .find(|e| e.label.as_deref() == Some(path))
                .or_else(|| edges.iter().find(|e| e.label.is_none()))
                .copied(),
            None => edges.first().copied(),
        }?;
        self.node(&edge.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::from_json(&serde_json::json!({
            "nodes": [
                {"id": "t1", "type": "trigger", "event": "invite_accepted"},
                {"id": "c1", "type": "condition", "condition": "has_responded"},
                {"id": "a1", "type": "action", "action": "send_message", "message": "Olá!"},
                {"id": "a2", "type": "action", "action": "close_negative"}
            ],
            "edges": [
                {"source": "t1", "target": "c1"},
                {"source": "c1", "target": "a1", "label": "yes"},
                {"source": "c1", "target": "a2", "label": "no"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_trigger_lookup() {
        let g = graph();
        assert_eq!(g.trigger_for_event("invite_accepted").unwrap().id, "t1");
        // Unknown event falls back to any trigger.
        assert_eq!(g.trigger_for_event("no_response").unwrap().id, "t1");
    }

    #[test]
    fn test_labeled_edge_navigation() {
        let g = graph();
        assert_eq!(g.next_node("c1", Some("yes")).unwrap().id, "a1");
        assert_eq!(g.next_node("c1", Some("no")).unwrap().id, "a2");
        // No edge for this path, no default edge: branch ends.
        assert!(g.next_node("c1", Some("maybe")).is_none());
        // Unconditional navigation takes the first edge.
        assert_eq!(g.next_node("t1", None).unwrap().id, "c1");
    }

    #[test]
    fn test_default_edge_fallback() {
        let g = WorkflowGraph::from_json(&serde_json::json!({
            "nodes": [
                {"id": "c1", "type": "condition", "condition": "has_responded"},
                {"id": "a1", "type": "action", "action": "add_tag", "tags": ["x"]}
            ],
            "edges": [
                {"source": "c1", "target": "a1"}
            ]
        }))
        .unwrap();
        // Path "yes" has no labeled edge; the unlabeled edge is the default.
        assert_eq!(g.next_node("c1", Some("yes")).unwrap().id, "a1");
    }
}
