//! Dependency graph of one stack.
//!
//! Edges point from the node that must settle first to the node that waits
//! for it. Implicit edges come from `$ref` properties, explicit ones from
//! `depends_on`. Node indices follow declaration order, which is also the
//! tie-breaker of the topological sort.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::model::{RemovalPolicy, Stack};
use crate::state::StackState;

/// How an edge was introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Derived from a property reference.
    Implicit,
    /// Declared with `depends_on`.
    Explicit,
}

/// A directed edge: `from` settles before `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Node that must settle first.
    pub from: String,
    /// Node that waits.
    pub to: String,
    /// Edge origin.
    pub kind: EdgeKind,
}

/// Graph vertex payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Logical id.
    pub logical_id: String,
    /// Resource kind.
    pub kind: String,
    /// Removal policy.
    pub removal_policy: RemovalPolicy,
    /// True for hook-bearing nodes.
    pub is_hook: bool,
}

/// Validated, acyclic dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    stack: String,
    graph: DiGraph<GraphNode, EdgeKind>,
    index: HashMap<String, NodeIndex>,
    dangling: Vec<DependencyEdge>,
    order: Vec<NodeIndex>,
}

/// Builds the dependency graph of a declared stack.
///
/// # Errors
///
/// Returns `GraphError::CycleDetected` with the full cycle if the stack is
/// not a DAG.
pub fn build_graph(stack: &Stack) -> Result<DependencyGraph> {
    let mut builder = GraphBuilder::new(stack.name());
    for node in stack.nodes() {
        builder.add_node(GraphNode {
            logical_id: node.logical_id.clone(),
            kind: node.kind.clone(),
            removal_policy: node.removal_policy,
            is_hook: node.is_hook(),
        });
    }
    for node in stack.nodes() {
        for target in node.referenced_nodes() {
            builder.add_edge(target, &node.logical_id, EdgeKind::Implicit);
        }
        for target in &node.depends_on {
            builder.add_edge(target, &node.logical_id, EdgeKind::Explicit);
        }
    }
    builder.finish()
}

impl DependencyGraph {
    /// Rebuilds the graph of previously applied nodes.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CycleDetected` if the record is corrupt.
    pub fn from_state(stack: &str, state: &StackState) -> Result<Self> {
        let mut builder = GraphBuilder::new(stack);
        for record in &state.resources {
            builder.add_node(GraphNode {
                logical_id: record.logical_id.clone(),
                kind: record.kind.clone(),
                removal_policy: record.removal_policy,
                is_hook: record.is_hook,
            });
        }
        for record in &state.resources {
            for dep in &record.depends_on {
                builder.add_edge(&dep.logical_id, &record.logical_id, dep.kind);
            }
        }
        builder.finish()
    }

    /// Owning stack.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// True if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// True if the node is part of the graph.
    #[must_use]
    pub fn contains(&self, logical_id: &str) -> bool {
        self.index.contains_key(logical_id)
    }

    /// Node payload.
    #[must_use]
    pub fn node(&self, logical_id: &str) -> Option<&GraphNode> {
        self.index.get(logical_id).map(|&i| &self.graph[i])
    }

    /// Nodes ancestors-first, ties broken by declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.graph[i].logical_id.as_str())
            .collect()
    }

    /// Direct dependencies of a node, in declaration order.
    #[must_use]
    pub fn dependencies(&self, logical_id: &str) -> Vec<&str> {
        self.neighbors(logical_id, Direction::Incoming)
    }

    /// Direct dependents of a node, in declaration order.
    #[must_use]
    pub fn dependents(&self, logical_id: &str) -> Vec<&str> {
        self.neighbors(logical_id, Direction::Outgoing)
    }

    /// Edges between declared nodes.
    #[must_use]
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| DependencyEdge {
                from: self.graph[e.source()].logical_id.clone(),
                to: self.graph[e.target()].logical_id.clone(),
                kind: *e.weight(),
            })
            .collect();
        edges.sort_by_key(|e| (self.index[&e.to], self.index[&e.from]));
        edges
    }

    /// Edges whose `from` is not part of the graph.
    #[must_use]
    pub fn dangling(&self) -> &[DependencyEdge] {
        &self.dangling
    }

    /// Dependencies of a node including dangling ones, with their kind.
    #[must_use]
    pub fn incoming_edges(&self, logical_id: &str) -> Vec<DependencyEdge> {
        let mut out: Vec<_> = self
            .edges()
            .into_iter()
            .filter(|e| e.to == logical_id)
            .collect();
        out.extend(self.dangling.iter().filter(|e| e.to == logical_id).cloned());
        out
    }

    fn neighbors(&self, logical_id: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(logical_id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort_unstable();
        found.dedup();
        found
            .into_iter()
            .map(|i| self.graph[i].logical_id.as_str())
            .collect()
    }
}

struct GraphBuilder {
    stack: String,
    graph: DiGraph<GraphNode, EdgeKind>,
    index: HashMap<String, NodeIndex>,
    dangling: Vec<DependencyEdge>,
}

impl GraphBuilder {
    fn new(stack: &str) -> Self {
        Self {
            stack: stack.to_string(),
            graph: DiGraph::new(),
            index: HashMap::new(),
            dangling: Vec::new(),
        }
    }

    fn add_node(&mut self, node: GraphNode) {
        let id = node.logical_id.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(id, idx);
    }

    fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        let (Some(&a), Some(&b)) = (self.index.get(from), self.index.get(to)) else {
            let edge = DependencyEdge {
                from: from.to_string(),
                to: to.to_string(),
                kind,
            };
            if !self.dangling.contains(&edge) {
                self.dangling.push(edge);
            }
            return;
        };
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, kind);
        }
    }

    fn finish(self) -> Result<DependencyGraph> {
        let Some(order) = stable_toposort(&self.graph) else {
            let cycle = find_cycle(&self.graph)
                .into_iter()
                .map(|i| self.graph[i].logical_id.clone())
                .collect();
            return Err(GraphError::CycleDetected {
                stack: self.stack,
                cycle,
            }
            .into());
        };
        Ok(DependencyGraph {
            stack: self.stack,
            graph: self.graph,
            index: self.index,
            dangling: self.dangling,
            order,
        })
    }
}

/// Kahn's algorithm, always picking the smallest ready index.
///
/// Returns `None` if the graph has a cycle.
pub(crate) fn stable_toposort<N, E>(graph: &DiGraph<N, E>) -> Option<Vec<NodeIndex>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|i| in_degree[i.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    (order.len() == graph.node_count()).then_some(order)
}

/// Groups nodes into levels: a node sits one level below its deepest
/// predecessor. Each level is in index order.
pub(crate) fn toposort_levels<N, E>(graph: &DiGraph<N, E>) -> Option<Vec<Vec<NodeIndex>>> {
    let order = stable_toposort(graph)?;
    let mut level = vec![0usize; graph.node_count()];
    for &idx in &order {
        let depth = graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|p| level[p.index()] + 1)
            .max()
            .unwrap_or(0);
        level[idx.index()] = depth;
    }

    let mut levels: Vec<Vec<NodeIndex>> = Vec::new();
    for idx in graph.node_indices() {
        let depth = level[idx.index()];
        if levels.len() <= depth {
            levels.resize_with(depth + 1, Vec::new);
        }
        levels[depth].push(idx);
    }
    Some(levels)
}

/// Finds one cycle with a depth-first search.
///
/// The returned path repeats its first node at the end.
pub(crate) fn find_cycle<N, E>(graph: &DiGraph<N, E>) -> Vec<NodeIndex> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    let mut marks = vec![Mark::White; graph.node_count()];
    for start in graph.node_indices() {
        if marks[start.index()] != Mark::White {
            continue;
        }
        let mut path: Vec<NodeIndex> = vec![start];
        let mut stack: Vec<std::vec::IntoIter<NodeIndex>> = vec![sorted_successors(graph, start)];
        marks[start.index()] = Mark::Grey;

        while let Some(successors) = stack.last_mut() {
            match successors.next() {
                Some(next) => match marks[next.index()] {
                    Mark::Grey => {
                        let from = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle = path[from..].to_vec();
                        cycle.push(next);
                        return cycle;
                    }
                    Mark::White => {
                        marks[next.index()] = Mark::Grey;
                        path.push(next);
                        stack.push(sorted_successors(graph, next));
                    }
                    Mark::Black => {}
                },
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        marks[done.index()] = Mark::Black;
                    }
                }
            }
        }
    }
    Vec::new()
}

fn sorted_successors<N, E>(graph: &DiGraph<N, E>, idx: NodeIndex) -> std::vec::IntoIter<NodeIndex> {
    let mut next: Vec<_> = graph.neighbors_directed(idx, Direction::Outgoing).collect();
    next.sort_unstable();
    next.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use crate::model::{PropertyValue, RemovalPolicy};
    use std::collections::BTreeMap;

    fn declare(stack: &mut Stack, id: &str, refs: &[&str]) {
        let props: BTreeMap<String, PropertyValue> = refs
            .iter()
            .map(|r| (format!("{r}Id"), PropertyValue::reference(*r, "id")))
            .collect();
        stack
            .declare("generic", id, props, RemovalPolicy::Destroy)
            .unwrap();
    }

    fn position(order: &[&str], id: &str) -> usize {
        order.iter().position(|n| *n == id).unwrap()
    }

    #[test]
    fn test_implicit_and_explicit_edges() {
        let mut stack = Stack::new("DataStack");
        declare(&mut stack, "Bucket", &[]);
        declare(&mut stack, "Upload", &["Bucket"]);
        declare(&mut stack, "Trigger", &[]);
        stack.add_dependency("Trigger", "Upload").unwrap();

        let graph = build_graph(&stack).unwrap();
        let edges = graph.edges();
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&DependencyEdge {
            from: "Bucket".into(),
            to: "Upload".into(),
            kind: EdgeKind::Implicit,
        }));
        assert!(edges.contains(&DependencyEdge {
            from: "Upload".into(),
            to: "Trigger".into(),
            kind: EdgeKind::Explicit,
        }));
        assert_eq!(graph.topological_order(), vec!["Bucket", "Upload", "Trigger"]);
        assert_eq!(graph.dependents("Bucket"), vec!["Upload"]);
        assert_eq!(graph.dependencies("Trigger"), vec!["Upload"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let mut stack = Stack::new("S");
        declare(&mut stack, "Z", &[]);
        declare(&mut stack, "A", &[]);
        declare(&mut stack, "M", &["Z"]);
        declare(&mut stack, "B", &[]);

        let first = build_graph(&stack).unwrap().topological_order().join(",");
        let second = build_graph(&stack).unwrap().topological_order().join(",");
        assert_eq!(first, "Z,A,M,B");
        assert_eq!(first, second);
    }

    #[test]
    fn test_every_edge_respected_in_order() {
        let mut stack = Stack::new("S");
        declare(&mut stack, "n0", &[]);
        for i in 1..12 {
            let a = format!("n{}", i / 2);
            let b = format!("n{}", i / 3);
            let id = format!("n{i}");
            declare(&mut stack, &id, &[a.as_str(), b.as_str()]);
        }
        let graph = build_graph(&stack).unwrap();
        let order = graph.topological_order();
        for edge in graph.edges() {
            assert!(position(&order, &edge.from) < position(&order, &edge.to));
        }
    }

    #[test]
    fn test_back_edge_reports_cycle_containing_it() {
        let mut stack = Stack::new("S");
        declare(&mut stack, "a", &[]);
        declare(&mut stack, "b", &["a"]);
        declare(&mut stack, "c", &["b"]);
        declare(&mut stack, "d", &["a"]);
        assert!(build_graph(&stack).is_ok());

        // a waits for c: closes a -> b -> c -> a
        stack.add_dependency("a", "c").unwrap();
        let err = build_graph(&stack).unwrap_err();
        match err {
            DeployError::Graph(GraphError::CycleDetected { stack, cycle }) => {
                assert_eq!(stack, "S");
                assert_eq!(cycle.first(), cycle.last());
                let pairs: Vec<_> = cycle.windows(2).map(|w| (w[0].as_str(), w[1].as_str())).collect();
                assert!(pairs.contains(&("c", "a")));
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut stack = Stack::new("S");
        declare(&mut stack, "a", &["a"]);
        let err = build_graph(&stack).unwrap_err();
        assert!(err.to_string().contains("a -> a"));
    }

    #[test]
    fn test_dangling_edges_are_recorded() {
        let mut stack = Stack::new("S");
        declare(&mut stack, "a", &["gone"]);
        let graph = build_graph(&stack).unwrap();
        assert_eq!(graph.dangling().len(), 1);
        assert_eq!(graph.dangling()[0].from, "gone");
        assert_eq!(graph.incoming_edges("a").len(), 1);
    }

    #[test]
    fn test_levels() {
        let mut g: DiGraph<&str, ()> = DiGraph::new();
        let auth = g.add_node("Auth");
        let data = g.add_node("Data");
        let api = g.add_node("Api");
        g.add_edge(auth, api, ());
        g.add_edge(data, api, ());

        let levels = toposort_levels(&g).unwrap();
        assert_eq!(levels, vec![vec![auth, data], vec![api]]);
    }
}
