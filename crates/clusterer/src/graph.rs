//! Who-waits-on-whom graph among rejoining nodes
//!
//! The graph is rebuilt from scratch for every dependency round from the
//! awaiting sets collected in that round. A node may proceed to locking only
//! when the strongly connected component containing it is closed, i.e. no
//! member of the component waits on a node outside it.
//!
//! # Example
//!
//! ```
//! use proven_clusterer::DependencyGraph;
//! use proven_topology::NodeName;
//!
//! let a = NodeName::new("a");
//! let b = NodeName::new("b");
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_waiter(a.clone(), [b.clone()]);
//! graph.add_waiter(b.clone(), [a.clone()]);
//!
//! assert!(graph.is_closed_component(&a));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use proven_topology::NodeName;

/// Directed graph with an edge from every waiter to each node it awaits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<NodeName, BTreeSet<NodeName>>,
    nodes: BTreeSet<NodeName>,
}

impl DependencyGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` is waiting on every node in `awaiting`.
    ///
    /// Both the waiter and the awaited nodes become vertices. Calling this
    /// twice for the same waiter adds to its edge set.
    pub fn add_waiter(&mut self, node: NodeName, awaiting: impl IntoIterator<Item = NodeName>) {
        let targets = self.edges.entry(node.clone()).or_default();
        for target in awaiting {
            self.nodes.insert(target.clone());
            targets.insert(target);
        }
        self.nodes.insert(node);
    }

    /// All vertices
    #[must_use]
    pub const fn nodes(&self) -> &BTreeSet<NodeName> {
        &self.nodes
    }

    /// Nodes `node` waits on
    pub fn awaited_by(&self, node: &NodeName) -> impl Iterator<Item = &NodeName> {
        self.edges.get(node).into_iter().flatten()
    }

    /// Strongly connected component containing `node`, if it is a vertex.
    #[must_use]
    pub fn component_of(&self, node: &NodeName) -> Option<BTreeSet<NodeName>> {
        self.strongly_connected_components()
            .into_iter()
            .find(|component| component.contains(node))
    }

    /// Whether the component containing `node` has no edge leaving it.
    ///
    /// A node that is not a vertex is never closed.
    #[must_use]
    pub fn is_closed_component(&self, node: &NodeName) -> bool {
        self.component_of(node).is_some_and(|component| {
            component
                .iter()
                .flat_map(|member| self.awaited_by(member))
                .all(|target| component.contains(target))
        })
    }

    /// Partition the vertices into strongly connected components (Tarjan).
    ///
    /// Components are emitted in reverse topological order: a component is
    /// listed before any component that waits on it.
    #[must_use]
    pub fn strongly_connected_components(&self) -> Vec<BTreeSet<NodeName>> {
        let mut state = TarjanState::default();
        let mut components = Vec::new();

        for node in &self.nodes {
            if !state.indices.contains_key(node) {
                self.visit(node, &mut state, &mut components);
            }
        }

        components
    }

    fn visit<'a>(
        &'a self,
        node: &'a NodeName,
        state: &mut TarjanState<'a>,
        components: &mut Vec<BTreeSet<NodeName>>,
    ) {
        let index = state.next_index;
        state.next_index += 1;
        state.indices.insert(node, index);
        state.lowlinks.insert(node, index);
        state.stack.push(node);
        state.on_stack.insert(node);

        for target in self.awaited_by(node) {
            if let Some(&target_index) = state.indices.get(target) {
                if state.on_stack.contains(target) {
                    state.lower(node, target_index);
                }
            } else {
                self.visit(target, state, components);
                let target_lowlink = state.lowlinks.get(target).copied().unwrap_or(index);
                state.lower(node, target_lowlink);
            }
        }

        if state.lowlinks.get(node) == Some(&index) {
            let mut component = BTreeSet::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack.remove(member);
                component.insert(member.clone());
                if member == node {
                    break;
                }
            }
            components.push(component);
        }
    }
}

#[derive(Default)]
struct TarjanState<'a> {
    next_index: usize,
    indices: BTreeMap<&'a NodeName, usize>,
    lowlinks: BTreeMap<&'a NodeName, usize>,
    stack: Vec<&'a NodeName>,
    on_stack: BTreeSet<&'a NodeName>,
}

impl<'a> TarjanState<'a> {
    fn lower(&mut self, node: &'a NodeName, candidate: usize) {
        if let Some(lowlink) = self.lowlinks.get_mut(node) {
            *lowlink = (*lowlink).min(candidate);
        }
    }
}
