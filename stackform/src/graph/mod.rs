//! The validated dependency graph of a run.
//!
//! Nodes are declarations plus a synthetic root at index 0. An edge
//! `from -> to` means `to` may not start until `from` is created.

mod builder;

pub use builder::GraphBuilder;

use crate::resource::{ResourceDeclaration, ResourceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Why one node waits for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// An input reads one of the upstream outputs.
    Data,
    /// Declared with `depends_on`.
    Explicit,
    /// The upstream node is the parent (or the root).
    Parent,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Explicit => write!(f, "explicit"),
            Self::Parent => write!(f, "parent"),
        }
    }
}

/// One dependency between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    /// Index of the dependency.
    pub from: usize,
    /// Index of the dependent.
    pub to: usize,
    /// Why the dependent waits.
    pub kind: EdgeKind,
}

/// An acyclic graph of declarations, ready for scheduling.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    stack: String,
    nodes: Vec<ResourceDeclaration>,
    index: HashMap<ResourceId, usize>,
    predecessors: Vec<BTreeSet<usize>>,
    successors: Vec<BTreeSet<usize>>,
    edges: BTreeSet<Edge>,
}

impl DependencyGraph {
    /// Index of the synthetic root.
    pub const ROOT: usize = 0;

    /// Returns the stack name.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Returns the number of nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing besides the root was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Returns the declaration at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn node(&self, index: usize) -> &ResourceDeclaration {
        &self.nodes[index]
    }

    /// Returns every node in declaration order, root first.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceDeclaration] {
        &self.nodes
    }

    /// Returns the index of `id`.
    #[must_use]
    pub fn index_of(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns the declaration with `id`.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDeclaration> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    /// Returns true if `id` is part of the graph.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes that must finish before `index` starts.
    #[must_use]
    pub fn predecessors(&self, index: usize) -> &BTreeSet<usize> {
        &self.predecessors[index]
    }

    /// Nodes waiting on `index`.
    #[must_use]
    pub fn successors(&self, index: usize) -> &BTreeSet<usize> {
        &self.successors[index]
    }

    /// Every edge with its kind. A pair may appear under several kinds.
    #[must_use]
    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    /// Returns the kinds of edges from `from` to `to`.
    #[must_use]
    pub fn edge_kinds(&self, from: usize, to: usize) -> Vec<EdgeKind> {
        self.edges
            .iter()
            .filter(|e| e.from == from && e.to == to)
            .map(|e| e.kind)
            .collect()
    }

    /// Returns node indices in a dependency-respecting order.
    ///
    /// Ties are broken by declaration order, so the result is deterministic.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &succ in &self.successors[next] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }

        order
    }

    /// Returns the ids along the dependency path order, skipping the root.
    #[must_use]
    pub fn resource_order(&self) -> Vec<&ResourceId> {
        self.topological_order()
            .into_iter()
            .filter(|&i| i != Self::ROOT)
            .map(|i| &self.nodes[i].id)
            .collect()
    }
}
