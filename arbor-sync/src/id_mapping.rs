//! Resolution of wire node ids to nodes of one replica.

use std::collections::HashMap;

use arbor_core::{NodeGraph, NodeId, NodeRef};

/// A message referenced a node this replica has never been introduced to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No node with id {0:?} is known to this replica")]
pub struct ResolutionError(pub NodeId);

/// `id → node` table for one replica.
#[derive(Debug, Clone, Default)]
pub struct IdMapping {
    nodes: HashMap<NodeId, NodeRef>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mapping covering `roots` and all their descendants.
    pub fn with_nodes(graph: &NodeGraph, roots: &[NodeRef]) -> Self {
        let mut mapping = Self::new();
        for root in roots {
            mapping.update_with(graph, *root);
        }
        mapping
    }

    /// Node for `id`. An unknown id means a causality violation.
    pub fn from_id(&self, id: &str) -> Result<NodeRef, ResolutionError> {
        self.try_from_id(id)
            .ok_or_else(|| ResolutionError(id.to_string()))
    }

    pub fn try_from_id(&self, id: &str) -> Option<NodeRef> {
        self.nodes.get(id).copied()
    }

    /// Resolve a reference target. `None` is the unresolved marker: it is
    /// passed through unchanged, and unknown ids resolve to it as well
    /// rather than failing.
    pub fn from_ref_id(&self, id: Option<&str>) -> Option<NodeRef> {
        id.and_then(|id| self.try_from_id(id))
    }

    /// Register `node` and, transitively, every node it contains or is
    /// annotated with. Existing entries for the same ids are overwritten.
    pub fn update_with(&mut self, graph: &NodeGraph, node: NodeRef) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let n = &graph[current];
            self.nodes.insert(n.id().to_string(), current);
            stack.extend(n.all_children());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
