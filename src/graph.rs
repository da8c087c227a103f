//! Dependency graph builder.
//!
//! Builds a directed acyclic graph over resource declarations. An edge runs
//! from a resource to each resource it depends on, either explicitly through
//! `depends_on` or implicitly by referencing one of its attributes. The graph
//! rejects references to undeclared resources and reports cycles with the
//! full path.

use crate::config::{DesiredState, ResourceAddress};
use crate::error::{GraphError, Result, StackError};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt::Write as _;
use tracing::debug;

/// A validated dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes in declaration order.
    nodes: Vec<ResourceAddress>,
    /// Address to node position.
    index: HashMap<ResourceAddress, usize>,
    /// For each node, the nodes it depends on.
    dependencies: Vec<Vec<usize>>,
    /// For each node, the nodes depending on it.
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Builds the graph of a desired state.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedReference` if a dependency names an undeclared
    /// resource and `CyclicDependency` if the dependencies form a loop.
    pub fn build(desired: &DesiredState) -> Result<Self> {
        let nodes: Vec<_> = desired.resources.iter().map(|r| r.address.clone()).collect();
        let mut graph = Self::with_nodes(nodes);

        for resource in &desired.resources {
            for dep in resource.dependencies() {
                if !graph.index.contains_key(&dep) {
                    return Err(StackError::Graph(GraphError::UnresolvedReference {
                        from: resource.address.to_string(),
                        target: dep.to_string(),
                    }));
                }
                graph.add_edge(&resource.address, &dep);
            }
        }

        graph.finish()
    }

    /// Builds a graph from explicit edges `(from, to)` meaning `from` depends
    /// on `to`. Edges touching unknown nodes are ignored.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the edges form a loop.
    pub fn from_edges(
        nodes: Vec<ResourceAddress>,
        edges: &[(ResourceAddress, ResourceAddress)],
    ) -> Result<Self> {
        let mut graph = Self::with_nodes(nodes);
        for (from, to) in edges {
            if graph.index.contains_key(from) && graph.index.contains_key(to) {
                graph.add_edge(from, to);
            }
        }
        graph.finish()
    }

    fn with_nodes(nodes: Vec<ResourceAddress>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, addr)| (addr.clone(), i))
            .collect();
        let count = nodes.len();
        Self {
            nodes,
            index,
            dependencies: vec![Vec::new(); count],
            dependents: vec![Vec::new(); count],
        }
    }

    fn add_edge(&mut self, from: &ResourceAddress, to: &ResourceAddress) {
        let (Some(&f), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if !self.dependencies[f].contains(&t) {
            self.dependencies[f].push(t);
            self.dependents[t].push(f);
        }
    }

    fn finish(mut self) -> Result<Self> {
        for list in self.dependencies.iter_mut().chain(self.dependents.iter_mut()) {
            list.sort_unstable();
        }
        if let Some(cycle) = self.find_cycle() {
            return Err(StackError::Graph(GraphError::CyclicDependency {
                cycle: cycle.iter().map(|&i| self.nodes[i].to_string()).collect(),
            }));
        }
        debug!(
            "Built dependency graph with {} nodes and {} edges",
            self.nodes.len(),
            self.dependencies.iter().map(Vec::len).sum::<usize>()
        );
        Ok(self)
    }

    /// Depth-first search over dependency edges. Returns the first cycle
    /// found, with its first node repeated at the end.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = self.visit(start, &mut marks, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::InProgress;
        path.push(node);

        for &dep in &self.dependencies[node] {
            match marks[dep] {
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceAddress] {
        &self.nodes
    }

    /// Returns true if the address is a node.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Direct dependencies of a node, in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        self.index.get(address).map_or_else(Vec::new, |&i| {
            self.dependencies[i].iter().map(|&d| &self.nodes[d]).collect()
        })
    }

    /// Direct dependents of a node, in declaration order.
    #[must_use]
    pub fn dependents_of(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        self.index.get(address).map_or_else(Vec::new, |&i| {
            self.dependents[i].iter().map(|&d| &self.nodes[d]).collect()
        })
    }

    /// All edges `(from, to)` where `from` depends on `to`.
    #[must_use]
    pub fn edges(&self) -> Vec<(&ResourceAddress, &ResourceAddress)> {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(f, deps)| deps.iter().map(move |&t| (&self.nodes[f], &self.nodes[t])))
            .collect()
    }

    /// Topological order: every node after all of its dependencies. Among
    /// nodes ready at the same time, declaration order wins.
    #[must_use]
    pub fn apply_order(&self) -> Vec<&ResourceAddress> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(Reverse(node)) = ready.pop() {
            order.push(&self.nodes[node]);
            for &dependent in &self.dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        order
    }

    /// Reverse topological order: every node before all of its dependencies.
    #[must_use]
    pub fn destroy_order(&self) -> Vec<&ResourceAddress> {
        let mut order = self.apply_order();
        order.reverse();
        order
    }

    /// Returns true if `ancestor` is a direct or transitive dependency of
    /// `node`.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &ResourceAddress, node: &ResourceAddress) -> bool {
        match (self.index.get(ancestor), self.index.get(node)) {
            (Some(&a), Some(&n)) => Self::reach(n, &self.dependencies).contains(&a),
            _ => false,
        }
    }

    /// Every node that depends on `address`, directly or transitively.
    #[must_use]
    pub fn descendants(&self, address: &ResourceAddress) -> BTreeSet<&ResourceAddress> {
        self.index.get(address).map_or_else(BTreeSet::new, |&i| {
            Self::reach(i, &self.dependents)
                .into_iter()
                .map(|d| &self.nodes[d])
                .collect()
        })
    }

    fn reach(start: usize, adjacency: &[Vec<usize>]) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = adjacency[start].clone();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(&adjacency[node]);
            }
        }
        seen
    }

    /// Renders the graph in Graphviz DOT format, edges pointing from a
    /// resource to what it depends on.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stackwright {\n  rankdir = \"RL\";\n");
        for node in &self.nodes {
            let _ = writeln!(out, "  \"{node}\";");
        }
        for (from, to) in self.edges() {
            let _ = writeln!(out, "  \"{from}\" -> \"{to}\";");
        }
        out.push_str("}\n");
        out
    }
}
