//! Per-node lifecycle states.

use crate::resource::ResourceId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Where a node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Not yet reached by the scheduler.
    NotStarted,
    /// Dependencies done; resolving inputs or waiting for a slot.
    Waiting,
    /// The engine call is in flight.
    Creating,
    /// Created; outputs resolved.
    Created,
    /// The engine call failed.
    Failed,
    /// Never attempted because something upstream did not complete.
    Skipped,
}

impl NodeState {
    /// Returns true for `Created`, `Failed` and `Skipped`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Created | Self::Failed | Self::Skipped)
    }

    /// Returns true if moving from `self` to `next` is a legal step.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use NodeState::{Created, Creating, Failed, NotStarted, Skipped, Waiting};
        matches!(
            (self, next),
            (NotStarted, Waiting | Skipped)
                | (Waiting, Creating | Created | Failed | Skipped)
                | (Creating, Created | Failed)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Waiting => "waiting",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Shared view of every node's state during a run.
#[derive(Debug, Default)]
pub struct NodeStateTable {
    states: DashMap<ResourceId, NodeState>,
}

impl NodeStateTable {
    /// Creates a table with every id `NotStarted`.
    #[must_use]
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a ResourceId>) -> Self {
        let states = DashMap::new();
        for id in ids {
            states.insert(id.clone(), NodeState::NotStarted);
        }
        Self { states }
    }

    /// Returns the current state of `id`.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<NodeState> {
        self.states.get(id).map(|entry| *entry)
    }

    /// Moves `id` to `next` if the step is legal.
    ///
    /// Returns false and leaves the state unchanged otherwise.
    pub fn transition(&self, id: &ResourceId, next: NodeState) -> bool {
        let Some(mut entry) = self.states.get_mut(id) else {
            warn!(resource = %id, "Transition for unknown node");
            return false;
        };
        let current = *entry;
        if current.can_transition_to(next) {
            *entry = next;
            true
        } else {
            warn!(resource = %id, from = %current, to = %next, "Illegal node transition");
            false
        }
    }

    /// Returns true once every node is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|entry| entry.is_terminal())
    }

    /// Returns ids of nodes that are not terminal.
    #[must_use]
    pub fn unfinished(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .states
            .iter()
            .filter(|entry| !entry.is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Returns how many nodes are in `state`.
    #[must_use]
    pub fn count(&self, state: NodeState) -> usize {
        self.states.iter().filter(|entry| *entry.value() == state).count()
    }

    /// Returns an ordered copy of the table.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<ResourceId, NodeState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
