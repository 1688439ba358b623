//! Run-scoped entity graph.
//!
//! Nodes live in a `StableDiGraph` and are looked up by permId through a side index.
//! Traversal state is kept next to the graph rather than on the nodes, so node values
//! stay immutable and a run can reset it.

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

use crate::models::{EdgeKind, EntityKind, EntityNode, PermId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisitState {
    #[default]
    Unvisited,
    Parent,
    Container,
    Both,
}

impl VisitState {
    fn as_parent(self) -> bool {
        matches!(self, VisitState::Parent | VisitState::Both)
    }

    fn as_container(self) -> bool {
        matches!(self, VisitState::Container | VisitState::Both)
    }

    fn with_parent(self) -> Self {
        match self {
            VisitState::Unvisited | VisitState::Parent => VisitState::Parent,
            VisitState::Container | VisitState::Both => VisitState::Both,
        }
    }

    fn with_container(self) -> Self {
        match self {
            VisitState::Unvisited | VisitState::Container => VisitState::Container,
            VisitState::Parent | VisitState::Both => VisitState::Both,
        }
    }
}

#[derive(Debug, Default)]
pub struct EntityGraph {
    graph: StableDiGraph<EntityNode, EdgeKind>,
    index: HashMap<PermId, NodeIndex>,
    visits: HashMap<NodeIndex, VisitState>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node unless one with the same permId exists. Returns its index.
    pub fn add_node(&mut self, node: EntityNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node.perm_id) {
            return idx;
        }
        let perm_id = node.perm_id.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(perm_id, idx);
        idx
    }

    /// Adds both endpoints if needed, then the edge if it is new.
    pub fn add_edge(&mut self, from: EntityNode, to: EntityNode, kind: EdgeKind) -> bool {
        let from = self.add_node(from);
        let to = self.add_node(to);
        self.insert_edge(from, to, kind)
    }

    /// Links two nodes already in the graph. Returns false if either is unknown or the
    /// edge already exists.
    pub fn link(&mut self, from: &PermId, to: &PermId, kind: EdgeKind) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&from), Some(&to)) => self.insert_edge(from, to, kind),
            _ => false,
        }
    }

    fn insert_edge(&mut self, from: NodeIndex, to: NodeIndex, kind: EdgeKind) -> bool {
        let exists = self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .any(|edge| edge.target() == to && *edge.weight() == kind);
        if exists {
            return false;
        }
        self.graph.add_edge(from, to, kind);
        true
    }

    pub fn contains(&self, perm_id: &PermId) -> bool {
        self.index.contains_key(perm_id)
    }

    pub fn node(&self, perm_id: &PermId) -> Option<&EntityNode> {
        self.index.get(perm_id).map(|&idx| &self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &EntityNode> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    pub fn nodes_of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &EntityNode> {
        self.nodes().filter(move |node| node.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Edges as (from, to, kind) node triples.
    pub fn edges(&self) -> impl Iterator<Item = (&EntityNode, &EntityNode, EdgeKind)> {
        self.graph.edge_indices().filter_map(move |edge| {
            let (from, to) = self.graph.edge_endpoints(edge)?;
            let kind = *self.graph.edge_weight(edge)?;
            Some((&self.graph[from], &self.graph[to], kind))
        })
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn neighbours(&self, perm_id: &PermId, kind: EdgeKind, direction: Direction) -> Vec<&EntityNode> {
        let Some(&idx) = self.index.get(perm_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, direction)
            .filter(|edge| *edge.weight() == kind)
            .map(|edge| match direction {
                Direction::Outgoing => &self.graph[edge.target()],
                Direction::Incoming => &self.graph[edge.source()],
            })
            .collect()
    }

    pub fn children(&self, perm_id: &PermId) -> Vec<&EntityNode> {
        self.neighbours(perm_id, EdgeKind::Child, Direction::Outgoing)
    }

    pub fn parents(&self, perm_id: &PermId) -> Vec<&EntityNode> {
        self.neighbours(perm_id, EdgeKind::Child, Direction::Incoming)
    }

    pub fn components(&self, perm_id: &PermId) -> Vec<&EntityNode> {
        self.neighbours(perm_id, EdgeKind::Component, Direction::Outgoing)
    }

    pub fn containers(&self, perm_id: &PermId) -> Vec<&EntityNode> {
        self.neighbours(perm_id, EdgeKind::Component, Direction::Incoming)
    }

    /// Entities reached over connection edges.
    pub fn owned(&self, perm_id: &PermId) -> Vec<&EntityNode> {
        self.neighbours(perm_id, EdgeKind::Connection, Direction::Outgoing)
    }

    pub fn visit_state(&self, perm_id: &PermId) -> VisitState {
        self.index
            .get(perm_id)
            .and_then(|idx| self.visits.get(idx))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_visited_as_parent(&self, perm_id: &PermId) -> bool {
        self.visit_state(perm_id).as_parent()
    }

    pub fn is_visited_as_container(&self, perm_id: &PermId) -> bool {
        self.visit_state(perm_id).as_container()
    }

    /// Marks the parent pass of a node. Returns true only the first time.
    pub fn mark_visited_as_parent(&mut self, perm_id: &PermId) -> bool {
        self.mark(perm_id, VisitState::as_parent, VisitState::with_parent)
    }

    /// Marks the container pass of a node. Returns true only the first time.
    pub fn mark_visited_as_container(&mut self, perm_id: &PermId) -> bool {
        self.mark(perm_id, VisitState::as_container, VisitState::with_container)
    }

    fn mark(
        &mut self,
        perm_id: &PermId,
        done: fn(VisitState) -> bool,
        next: fn(VisitState) -> VisitState,
    ) -> bool {
        let Some(&idx) = self.index.get(perm_id) else {
            return false;
        };
        let state = self.visits.entry(idx).or_default();
        if done(*state) {
            return false;
        }
        *state = next(*state);
        true
    }

    pub fn reset_visits(&mut self) {
        self.visits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityDetails;
    use chrono::Utc;

    fn object(id: &str) -> EntityNode {
        EntityNode::new(
            id,
            id,
            format!("/LAB/{id}"),
            EntityDetails::Object {
                space: Some("LAB".into()),
                project: None,
                collection: None,
            },
            Utc::now(),
        )
    }

    fn codes(nodes: Vec<&EntityNode>) -> Vec<String> {
        let mut codes: Vec<String> = nodes.into_iter().map(|n| n.code.clone()).collect();
        codes.sort();
        codes
    }

    #[test]
    fn nodes_and_edges_are_idempotent() {
        let mut graph = EntityGraph::new();
        let first = graph.add_node(object("A"));
        let mut renamed = object("A");
        renamed.code = "OTHER".into();
        assert_eq!(graph.add_node(renamed), first);
        assert_eq!(graph.node(&PermId::from("A")).unwrap().code, "A");

        assert!(graph.add_edge(object("A"), object("B"), EdgeKind::Child));
        assert!(!graph.add_edge(object("A"), object("B"), EdgeKind::Child));
        assert!(graph.add_edge(object("A"), object("B"), EdgeKind::Component));
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 2);

        assert_eq!(codes(graph.parents(&PermId::from("B"))), vec!["A"]);
        assert_eq!(codes(graph.containers(&PermId::from("B"))), vec!["A"]);
        assert!(graph.owned(&PermId::from("A")).is_empty());
        assert!(!graph.link(&PermId::from("A"), &PermId::from("Z"), EdgeKind::Child));
    }

    #[test]
    fn neighbours_follow_edge_direction_and_kind() {
        let mut graph = EntityGraph::new();
        graph.add_edge(object("A"), object("B"), EdgeKind::Child);
        graph.add_edge(object("A"), object("C"), EdgeKind::Child);
        graph.add_edge(object("C"), object("B"), EdgeKind::Component);
        assert!(graph.link(&PermId::from("B"), &PermId::from("C"), EdgeKind::Connection));

        assert_eq!(codes(graph.children(&PermId::from("A"))), vec!["B", "C"]);
        assert!(graph.parents(&PermId::from("A")).is_empty());
        assert_eq!(codes(graph.components(&PermId::from("C"))), vec!["B"]);
        assert_eq!(codes(graph.owned(&PermId::from("B"))), vec!["C"]);
        assert_eq!(graph.edges().count(), 4);
        assert_eq!(graph.nodes_of_kind(EntityKind::Object).count(), 3);
    }

    #[test]
    fn visit_marks_are_independent_and_resettable() {
        let mut graph = EntityGraph::new();
        graph.add_node(object("A"));
        let id = PermId::from("A");

        assert!(graph.mark_visited_as_parent(&id));
        assert!(!graph.mark_visited_as_parent(&id));
        assert!(!graph.is_visited_as_container(&id));
        assert!(graph.mark_visited_as_container(&id));
        assert_eq!(graph.visit_state(&id), VisitState::Both);

        graph.reset_visits();
        assert_eq!(graph.visit_state(&id), VisitState::Unvisited);
        assert!(!graph.mark_visited_as_parent(&PermId::from("missing")));
    }
}
