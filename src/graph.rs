//! Pattern graph model
//!
//! The parsed representation of a query before compilation: a directed
//! graph of pattern nodes and edges with designated roots. Nodes and edges
//! live in arenas and are addressed by index, so the graph is cheap to
//! clone and the compiler can remap links without shared aliasing.

use std::cell::Cell;

use crate::constraint::RawConstraint;

/// Index of a node in a [`PatternGraph`] arena.
pub type NodeId = usize;

/// Index of an edge in a [`PatternGraph`] arena.
pub type EdgeId = usize;

/// Structural role a pattern node requires of its target-tree counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeType {
    #[default]
    General,
    Root,
    Leaf,
    Intermediate,
    Parent,
    NonRoot,
    Disjunction,
}

impl NodeType {
    pub fn token(&self) -> &'static str {
        match self {
            NodeType::General => "general",
            NodeType::Root => "root",
            NodeType::Leaf => "leaf",
            NodeType::Intermediate => "intermediate",
            NodeType::Parent => "parent",
            NodeType::NonRoot => "non_root",
            NodeType::Disjunction => "disjunction",
        }
    }

    /// Resolve a (possibly abbreviated) type token, first match wins.
    pub fn parse(s: &str) -> Option<NodeType> {
        let s = s.to_lowercase();
        if s.is_empty() {
            return None;
        }
        [
            NodeType::Root,
            NodeType::Leaf,
            NodeType::General,
            NodeType::Disjunction,
            NodeType::Intermediate,
            NodeType::NonRoot,
            NodeType::Parent,
        ]
        .into_iter()
        .find(|t| t.token().starts_with(&s))
    }
}

/// Relation a pattern edge expresses between two pattern nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeType {
    /// Structural-only connection, never matched.
    Link,
    /// Direct parent/child relation in the dependency tree.
    #[default]
    Dominance,
    /// One or more dominance hops.
    Transitive,
    /// Word-order constraint, independent of the dominance structure.
    Precedence,
}

impl EdgeType {
    pub fn token(&self) -> &'static str {
        match self {
            EdgeType::Link => "link",
            EdgeType::Dominance => "dominance",
            EdgeType::Transitive => "transitive",
            EdgeType::Precedence => "precedence",
        }
    }

    pub fn parse(s: &str) -> Option<EdgeType> {
        let s = s.to_lowercase();
        if s.is_empty() {
            return None;
        }
        [
            EdgeType::Link,
            EdgeType::Dominance,
            EdgeType::Transitive,
            EdgeType::Precedence,
        ]
        .into_iter()
        .find(|t| t.token().starts_with(&s))
    }

    /// Edge types that span the dominance tree walk.
    pub fn is_structural(&self) -> bool {
        matches!(self, EdgeType::Dominance | EdgeType::Transitive)
    }
}

/// Operator joining the root nodes of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootOp {
    #[default]
    Conjunction,
    Disjunction,
}

#[derive(Debug, Clone)]
pub struct PatternNode {
    pub id: String,
    pub node_type: NodeType,
    pub negated: bool,
    pub constraints: Vec<RawConstraint>,
    pub incoming: Vec<EdgeId>,
    pub outgoing: Vec<EdgeId>,
    height: Cell<i32>,
    descendants: Cell<i32>,
}

impl PatternNode {
    fn new(id: String) -> Self {
        Self {
            id,
            node_type: NodeType::General,
            negated: false,
            constraints: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            height: Cell::new(-1),
            descendants: Cell::new(-1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternEdge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub edge_type: EdgeType,
    pub negated: bool,
    pub constraints: Vec<RawConstraint>,
}

/// The parsed representation of a query: nodes, edges, constraints.
/// Immutable after the parser finishes building it.
#[derive(Debug, Clone, Default)]
pub struct PatternGraph {
    nodes: Vec<PatternNode>,
    edges: Vec<PatternEdge>,
    pub root_op: RootOp,
}

impl PatternGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>) -> NodeId {
        let node_id = self.nodes.len();
        self.nodes.push(PatternNode::new(id.into()));
        node_id
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId, edge_type: EdgeType) -> EdgeId {
        let edge_id = self.edges.len();
        self.edges.push(PatternEdge {
            id: String::new(),
            source,
            target,
            edge_type,
            negated: false,
            constraints: Vec::new(),
        });
        self.nodes[source].outgoing.push(edge_id);
        self.nodes[target].incoming.push(edge_id);
        self.invalidate(source);
        edge_id
    }

    pub fn node(&self, id: NodeId) -> &PatternNode {
        &self.nodes[id]
    }

    /// Mutable access invalidates the node's memoized structure counts.
    pub fn node_mut(&mut self, id: NodeId) -> &mut PatternNode {
        self.invalidate(id);
        &mut self.nodes[id]
    }

    pub fn edge(&self, id: EdgeId) -> &PatternEdge {
        &self.edges[id]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut PatternEdge {
        let source = self.edges[id].source;
        self.invalidate(source);
        &mut self.edges[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> {
        0..self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The root set: nodes without an incoming dominance or transitive edge.
    pub fn roots(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|&n| {
                !self.nodes[n]
                    .incoming
                    .iter()
                    .any(|&e| self.edges[e].edge_type.is_structural())
            })
            .collect()
    }

    /// Look a node up by its string id.
    pub fn find_node(&self, id: &str) -> Option<NodeId> {
        self.node_ids().find(|&n| self.nodes[n].id == id)
    }

    fn invalidate(&mut self, node: NodeId) {
        self.nodes[node].height.set(-1);
        self.nodes[node].descendants.set(-1);
    }

    fn structural_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[node]
            .outgoing
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|e| e.edge_type.is_structural())
            .map(|e| e.target)
    }

    /// Height of the subtree below `node`, leaves counting 1. Memoized,
    /// recomputed after a structural edit.
    pub fn height(&self, node: NodeId) -> u32 {
        let cached = self.nodes[node].height.get();
        if cached >= 0 {
            return cached as u32;
        }
        let value = 1 + self
            .structural_children(node)
            .map(|c| self.height(c))
            .max()
            .unwrap_or(0);
        self.nodes[node].height.set(value as i32);
        value
    }

    /// Number of structural descendants of `node`. Memoized.
    pub fn descendant_count(&self, node: NodeId) -> u32 {
        let cached = self.nodes[node].descendants.get();
        if cached >= 0 {
            return cached as u32;
        }
        let children: Vec<NodeId> = self.structural_children(node).collect();
        let value = children.len() as u32
            + children.iter().map(|&c| self.descendant_count(c)).sum::<u32>();
        self.nodes[node].descendants.set(value as i32);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roots_ignore_precedence() {
        let mut g = PatternGraph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, EdgeType::Dominance);
        g.add_edge(a, c, EdgeType::Precedence);

        // c has only an incoming precedence edge and stays a root
        assert_eq!(g.roots(), vec![a, c]);
    }

    #[test]
    fn test_height_and_descendants() {
        let mut g = PatternGraph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, EdgeType::Dominance);
        g.add_edge(b, c, EdgeType::Transitive);
        g.add_edge(a, d, EdgeType::Dominance);

        assert_eq!(g.height(a), 3);
        assert_eq!(g.height(d), 1);
        assert_eq!(g.descendant_count(a), 3);
        assert_eq!(g.descendant_count(b), 1);
    }

    #[test]
    fn test_memo_invalidated_on_edit() {
        let mut g = PatternGraph::new();
        let a = g.add_node("a");
        assert_eq!(g.height(a), 1);

        let b = g.add_node("b");
        g.add_edge(a, b, EdgeType::Dominance);
        assert_eq!(g.height(a), 2);
        assert_eq!(g.descendant_count(a), 1);
    }

    #[test]
    fn test_type_tokens() {
        assert_eq!(NodeType::parse("dis"), Some(NodeType::Disjunction));
        assert_eq!(NodeType::parse("ROOT"), Some(NodeType::Root));
        assert_eq!(NodeType::parse("x"), None);
        assert_eq!(EdgeType::parse("trans"), Some(EdgeType::Transitive));
        assert_eq!(EdgeType::parse("prec"), Some(EdgeType::Precedence));
    }
}
