//! Builds and validates a [`DependencyGraph`] from a declaration log.

use super::{DependencyGraph, Edge, EdgeKind};
use crate::errors::{DuplicateResourceError, GraphCycleError, ReferenceKind, StackError, UnknownResourceError};
use crate::resource::{DeclarationClass, ResourceDeclaration, ResourceId};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Collects declarations and turns them into a validated graph.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    stack: String,
    declarations: Vec<ResourceDeclaration>,
}

impl GraphBuilder {
    /// Creates a builder for `stack`.
    #[must_use]
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            declarations: Vec::new(),
        }
    }

    /// Adds one declaration.
    #[must_use]
    pub fn add(mut self, declaration: ResourceDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// Adds declarations in order.
    #[must_use]
    pub fn extend(mut self, declarations: impl IntoIterator<Item = ResourceDeclaration>) -> Self {
        self.declarations.extend(declarations);
        self
    }

    /// Returns the number of declarations added.
    #[must_use]
    pub fn declaration_count(&self) -> usize {
        self.declarations.len()
    }

    /// Validates the declarations and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::DuplicateResource`] for repeated ids,
    /// [`StackError::UnknownResource`] for references to undeclared
    /// resources, and [`StackError::Cycle`] if the dependencies loop.
    pub fn build(self) -> Result<DependencyGraph, StackError> {
        let root = ResourceDeclaration::root(&self.stack);
        let mut nodes = Vec::with_capacity(self.declarations.len() + 1);
        let mut index = HashMap::new();

        for declaration in std::iter::once(root).chain(self.declarations) {
            if index.contains_key(&declaration.id) {
                return Err(DuplicateResourceError::new(declaration.id).into());
            }
            index.insert(declaration.id.clone(), nodes.len());
            nodes.push(declaration);
        }

        let mut edges = BTreeSet::new();
        for (to, declaration) in nodes.iter().enumerate() {
            if declaration.class == DeclarationClass::Root {
                continue;
            }

            let lookup = |id: &ResourceId, via: ReferenceKind| {
                index.get(id).copied().ok_or_else(|| {
                    UnknownResourceError::new(declaration.id.clone(), id.clone(), via)
                })
            };

            for owners in declaration.data_dependencies().into_values() {
                for owner in &owners {
                    edges.insert(Edge {
                        from: lookup(owner, ReferenceKind::Input)?,
                        to,
                        kind: EdgeKind::Data,
                    });
                }
            }
            for dependency in &declaration.explicit_dependencies {
                edges.insert(Edge {
                    from: lookup(dependency, ReferenceKind::Explicit)?,
                    to,
                    kind: EdgeKind::Explicit,
                });
            }
            let parent = match &declaration.parent {
                Some(parent) => lookup(parent, ReferenceKind::Parent)?,
                None => DependencyGraph::ROOT,
            };
            edges.insert(Edge {
                from: parent,
                to,
                kind: EdgeKind::Parent,
            });
        }

        // Waiting on a component means waiting on everything declared inside it.
        let parents: Vec<Option<usize>> = nodes
            .iter()
            .map(|d| d.parent.as_ref().and_then(|p| index.get(p).copied()))
            .collect();
        let mut component_waits = Vec::new();
        for edge in edges.iter().filter(|e| e.kind == EdgeKind::Explicit) {
            if nodes[edge.from].class != DeclarationClass::Component || is_within(edge.to, edge.from, &parents) {
                continue;
            }
            for child in 0..nodes.len() {
                if is_within(child, edge.from, &parents) {
                    component_waits.push(Edge {
                        from: child,
                        to: edge.to,
                        kind: EdgeKind::Explicit,
                    });
                }
            }
        }
        edges.extend(component_waits);

        let mut predecessors = vec![BTreeSet::new(); nodes.len()];
        let mut successors = vec![BTreeSet::new(); nodes.len()];
        for edge in &edges {
            predecessors[edge.to].insert(edge.from);
            successors[edge.from].insert(edge.to);
        }

        if let Some(cycle) = find_cycle(&predecessors) {
            let ids = cycle.into_iter().map(|i| nodes[i].id.clone()).collect();
            return Err(GraphCycleError::new(ids).into());
        }

        debug!(
            stack = %self.stack,
            nodes = nodes.len(),
            edges = edges.len(),
            "Built dependency graph"
        );

        Ok(DependencyGraph {
            stack: self.stack,
            nodes,
            index,
            predecessors,
            successors,
            edges,
        })
    }
}

/// Returns true if `ancestor` encloses `node` through parent links.
fn is_within(node: usize, ancestor: usize, parents: &[Option<usize>]) -> bool {
    let mut current = parents[node];
    for _ in 0..parents.len() {
        match current {
            Some(parent) if parent == ancestor => return true,
            Some(parent) => current = parents[parent],
            None => return false,
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Finds a cycle by depth-first search over dependencies.
///
/// Nodes are visited in declaration order. The returned path follows edge
/// direction and repeats its first node at the end. The walk keeps its own
/// stack, so chain depth is bounded by memory rather than the call stack.
fn find_cycle(predecessors: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; predecessors.len()];
    let mut path = Vec::new();

    for start in 0..predecessors.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::OnPath;
        path.push(start);
        let mut pending = vec![predecessors[start].iter()];

        while let Some(deps) = pending.last_mut() {
            let Some(&dep) = deps.next() else {
                pending.pop();
                if let Some(done) = path.pop() {
                    marks[done] = Mark::Done;
                }
                continue;
            };

            match marks[dep] {
                Mark::Unvisited => {
                    marks[dep] = Mark::OnPath;
                    path.push(dep);
                    pending.push(predecessors[dep].iter());
                }
                Mark::OnPath => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    cycle.reverse();
                    return Some(cycle);
                }
                Mark::Done => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Exports;
    use crate::output::Output;
    use crate::resource::BuildContext;
    use serde_json::Value as Json;
    use std::collections::BTreeSet;

    fn custom(name: &str) -> ResourceDeclaration {
        ResourceDeclaration::custom("test:Node", name)
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::new("test:Node", name)
    }

    #[test]
    fn test_three_node_cycle_names_every_id() {
        let err = GraphBuilder::new("dev")
            .add(custom("a").with_dependency(id("c")))
            .add(custom("b").with_dependency(id("a")))
            .add(custom("c").with_dependency(id("b")))
            .build()
            .unwrap_err();

        let StackError::Cycle(cycle) = err else {
            panic!("expected a cycle error, got {err}");
        };
        let names: Vec<&str> = cycle.cycle.iter().map(ResourceId::as_str).collect();
        assert_eq!(names, vec!["test:Node::a", "test:Node::b", "test:Node::c", "test:Node::a"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = GraphBuilder::new("dev")
            .add(custom("a").with_dependency(id("a")))
            .build()
            .unwrap_err();
        assert!(matches!(err, StackError::Cycle(_)));
    }

    #[test]
    fn test_data_cycle_through_outputs() {
        let a_out = Output::<Json>::with_parts(BTreeSet::from([id("a")]), false, None);
        let b_out = Output::<Json>::with_parts(BTreeSet::from([id("b")]), false, None);

        let err = GraphBuilder::new("dev")
            .add(custom("a").with_input("x", b_out))
            .add(custom("b").with_input("y", a_out))
            .build()
            .unwrap_err();
        assert!(matches!(err, StackError::Cycle(_)));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let err = GraphBuilder::new("dev")
            .add(custom("svc").with_dependency(id("missing")))
            .build()
            .unwrap_err();

        let StackError::UnknownResource(unknown) = err else {
            panic!("expected an unknown resource error");
        };
        assert_eq!(unknown.reference, id("missing"));
        assert_eq!(unknown.via, ReferenceKind::Explicit);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = GraphBuilder::new("dev")
            .add(custom("a"))
            .add(custom("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, StackError::DuplicateResource(_)));
    }

    #[test]
    fn test_components_parent_their_children() {
        let ctx = BuildContext::new("dev");
        let svc = ctx.resource("stackform:Group", "svc").register().unwrap();
        let cluster = ctx.child_scope(&svc).resource("aws:ecs:Cluster", "app").register().unwrap();

        let graph = GraphBuilder::new("dev").extend(ctx.declarations()).build().unwrap();
        let (svc_i, cluster_i) = (
            graph.index_of(svc.resource_id()).unwrap(),
            graph.index_of(cluster.resource_id()).unwrap(),
        );
        assert_eq!(graph.predecessors(cluster_i), &BTreeSet::from([svc_i]));
        assert_eq!(graph.predecessors(svc_i), &BTreeSet::from([DependencyGraph::ROOT]));
    }

    #[test]
    fn test_depending_on_component_waits_for_its_children() {
        let ctx = BuildContext::new("dev");
        let svc = ctx
            .component("stackform:Group", "svc")
            .build(|scope| {
                scope
                    .component("stackform:Group", "inner")
                    .build(|inner| {
                        inner.resource("test:Node", "leaf").register()?;
                        Ok(Exports::new())
                    })?;
                scope.resource("test:Node", "child").register()?;
                Ok(Exports::new())
            })
            .unwrap();
        let after = ctx.resource("test:Node", "after").depends_on(&svc).register().unwrap();

        let graph = GraphBuilder::new("dev").extend(ctx.declarations()).build().unwrap();
        let after_i = graph.index_of(after.resource_id()).unwrap();
        let waits: Vec<&str> = graph
            .predecessors(after_i)
            .iter()
            .filter(|&&i| i != DependencyGraph::ROOT)
            .map(|&i| graph.node(i).qualified_name.as_str())
            .collect();
        assert_eq!(waits, vec!["svc", "svc/inner", "svc/inner/leaf", "svc/child"]);

        let order = graph.resource_order();
        let position = |name: &str| order.iter().position(|id| id.as_str().ends_with(name)).unwrap();
        assert!(position("::svc/child") < position("::after"));
        assert!(position("::svc/inner/leaf") < position("::after"));
    }

    #[test]
    fn test_child_depending_on_own_component_adds_no_cycle() {
        let ctx = BuildContext::new("dev");
        ctx.component("stackform:Group", "svc")
            .build(|scope| {
                let first = scope.resource("test:Node", "first").register()?;
                scope.resource("test:Node", "second").depends_on(&first).register()?;
                Ok(Exports::new())
            })
            .unwrap();
        let decls = ctx.declarations();
        let svc_id = decls[0].id.clone();
        let extra = ResourceDeclaration::custom("test:Node", "third")
            .with_parent(&svc_id, "svc")
            .with_dependency(svc_id.clone());

        let graph = GraphBuilder::new("dev").extend(decls).add(extra).build().unwrap();
        assert_eq!(graph.len(), 5);
    }

    #[test]
    fn test_deep_chain_does_not_exhaust_the_stack() {
        let depth = 200_000;
        let mut predecessors: Vec<BTreeSet<usize>> = (0..depth)
            .map(|i| if i + 1 < depth { BTreeSet::from([i + 1]) } else { BTreeSet::new() })
            .collect();
        assert_eq!(find_cycle(&predecessors), None);

        predecessors[depth - 1].insert(0);
        let cycle = find_cycle(&predecessors).unwrap();
        assert_eq!(cycle.len(), depth + 1);
        assert_eq!(cycle.first(), cycle.last());
    }
}
