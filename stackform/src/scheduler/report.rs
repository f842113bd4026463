//! Results of a run.

use super::NodeState;
use crate::engine::{redact, OutputMap};
use crate::errors::{NodeFailure, OutputError};
use crate::resource::{DeclarationClass, ResourceId};
use crate::utils::{format_timestamp, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::BTreeSet;

/// What happened to one resource.
#[derive(Debug, Clone)]
pub struct NodeReport {
    /// The resource id.
    pub id: ResourceId,
    /// The resource kind.
    pub kind: String,
    /// The namespaced name.
    pub name: String,
    /// Custom or component.
    pub class: DeclarationClass,
    /// Terminal state.
    pub state: NodeState,
    /// Why the node failed or was skipped.
    pub error: Option<OutputError>,
    /// Output fields reported by the engine.
    pub outputs: OutputMap,
    /// Output fields that must be redacted.
    pub secret_fields: BTreeSet<String>,
    /// Fingerprint of the resolved inputs, when the engine was called.
    pub inputs_hash: Option<String>,
    /// Resources this node waited on.
    pub dependencies: Vec<ResourceId>,
    /// When the node left `NotStarted`.
    pub started_at: Option<Timestamp>,
    /// When the node reached its terminal state.
    pub finished_at: Option<Timestamp>,
    /// Time from start to finish.
    pub duration_ms: Option<u64>,
}

impl NodeReport {
    /// Returns the outputs with secret fields redacted.
    #[must_use]
    pub fn redacted_outputs(&self) -> OutputMap {
        redact(&self.outputs, &self.secret_fields)
    }

    /// Converts to a JSON value safe for logs.
    #[must_use]
    pub fn to_dict(&self) -> Json {
        json!({
            "id": self.id,
            "kind": self.kind,
            "name": self.name,
            "class": self.class,
            "state": self.state,
            "error": self.error.as_ref().map(ToString::to_string),
            "outputs": self.redacted_outputs(),
            "inputs_hash": self.inputs_hash,
            "dependencies": self.dependencies,
            "started_at": self.started_at.as_ref().map(format_timestamp),
            "finished_at": self.finished_at.as_ref().map(format_timestamp),
            "duration_ms": self.duration_ms,
        })
    }
}

/// Counts of nodes by terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// All reported nodes.
    pub total: usize,
    /// Nodes created.
    pub created: usize,
    /// Nodes that failed.
    pub failed: usize,
    /// Nodes skipped.
    pub skipped: usize,
}

/// The outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Unique id of the run (UUID v7).
    pub run_id: String,
    /// The stack name.
    pub stack: String,
    /// When the run started.
    pub started_at: Timestamp,
    /// Total wall time.
    pub duration_ms: u64,
    /// Every node except the synthetic root, in topological order.
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    /// Returns true if every node was created.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.state == NodeState::Created)
    }

    /// Returns counts by state.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let count = |state: NodeState| self.nodes.iter().filter(|n| n.state == state).count();
        RunSummary {
            total: self.nodes.len(),
            created: count(NodeState::Created),
            failed: count(NodeState::Failed),
            skipped: count(NodeState::Skipped),
        }
    }

    /// Returns every node that failed or was skipped, with its cause.
    #[must_use]
    pub fn failures(&self) -> Vec<NodeFailure> {
        self.nodes
            .iter()
            .filter(|n| n.state != NodeState::Created)
            .map(|n| NodeFailure {
                resource: n.id.clone(),
                state: n.state,
                error: n
                    .error
                    .clone()
                    .unwrap_or_else(|| OutputError::Cancelled(format!("'{}' did not finish", n.id))),
            })
            .collect()
    }

    /// Returns the report for `id`.
    #[must_use]
    pub fn node(&self, id: &ResourceId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns the report for the node with namespaced name `name`.
    #[must_use]
    pub fn node_named(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns the state of `id`.
    #[must_use]
    pub fn state_of(&self, id: &ResourceId) -> Option<NodeState> {
        self.node(id).map(|n| n.state)
    }

    /// Converts to a JSON value safe for logs.
    #[must_use]
    pub fn to_dict(&self) -> Json {
        json!({
            "run_id": self.run_id,
            "stack": self.stack,
            "started_at": format_timestamp(&self.started_at),
            "duration_ms": self.duration_ms,
            "success": self.is_success(),
            "summary": self.summary(),
            "nodes": self.nodes.iter().map(NodeReport::to_dict).collect::<Vec<_>>(),
        })
    }
}
