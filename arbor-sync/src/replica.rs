//! A local copy of the shared model: node graph plus id mapping.
//!
//! Clients hold one replica each; the repository holds the authoritative
//! one. Nodes enter a replica either by seeding from a chunk, by being
//! introduced through an incoming chunk (new partition or child), or by
//! local creation through [`Replica::new_node`]. All three paths keep the
//! [`IdMapping`] in step with the graph.

use std::sync::Arc;

use arbor_core::{
    deserialize_chunk, serialize_subtrees, Chunk, ChunkError, Delta, GraphError, LanguageRegistry,
    MetaPointer, Node, NodeGraph, NodeId, NodeRef, ReferenceTarget,
};

use crate::id_mapping::{IdMapping, ResolutionError};
use crate::translate::PriorState;

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Node id {0} is already in use")]
    DuplicateId(NodeId),

    #[error("Classifier {0} is not a partition concept")]
    NotAPartitionConcept(MetaPointer),
}

#[derive(Debug)]
pub struct Replica {
    graph: NodeGraph,
    ids: IdMapping,
    registry: Arc<LanguageRegistry>,
}

impl Replica {
    pub fn new(registry: Arc<LanguageRegistry>) -> Self {
        Self {
            graph: NodeGraph::new(),
            ids: IdMapping::new(),
            registry,
        }
    }

    /// A replica whose partitions are the roots of `chunk`.
    pub fn from_chunk(registry: Arc<LanguageRegistry>, chunk: &Chunk) -> Result<Self, ReplicaError> {
        let mut replica = Self::new(registry);
        replica.seed(chunk)?;
        Ok(replica)
    }

    /// Add the roots of `chunk` as partitions without emitting deltas.
    pub fn seed(&mut self, chunk: &Chunk) -> Result<Vec<NodeRef>, ReplicaError> {
        let root_ids = chunk.root_ids();
        for root in chunk.nodes.iter().filter(|n| root_ids.contains(&n.id.as_str())) {
            self.check_partition_concept(&root.classifier)?;
        }
        let roots = self.introduce(chunk)?;
        self.graph.apply_silently(|graph| {
            roots
                .iter()
                .try_for_each(|root| graph.add_partition(*root))
        })?;
        log::debug!("Seeded replica with {} partition(s)", roots.len());
        Ok(roots)
    }

    /// Deserialize `chunk` into detached nodes and register them.
    ///
    /// Ids already known to this replica are rejected before any node is
    /// created.
    pub fn introduce(&mut self, chunk: &Chunk) -> Result<Vec<NodeRef>, ReplicaError> {
        if let Some(known) = chunk.nodes.iter().find(|n| self.ids.contains(&n.id)) {
            return Err(ReplicaError::DuplicateId(known.id.clone()));
        }
        let roots = deserialize_chunk(&mut self.graph, &self.registry, chunk)?;
        for root in &roots {
            self.ids.update_with(&self.graph, *root);
        }
        Ok(roots)
    }

    /// Create a detached node known to this replica.
    pub fn new_node(&mut self, id: impl Into<NodeId>, classifier: MetaPointer) -> Result<NodeRef, ReplicaError> {
        let id = id.into();
        if self.ids.contains(&id) {
            return Err(ReplicaError::DuplicateId(id));
        }
        let node = self.graph.create_node(id, classifier);
        self.ids.update_with(&self.graph, node);
        Ok(node)
    }

    /// Attach `node` as a new partition, checking its concept.
    pub fn add_partition(&mut self, node: NodeRef) -> Result<(), ReplicaError> {
        let classifier = self.graph[node].classifier().clone();
        self.check_partition_concept(&classifier)?;
        self.graph.add_partition(node)?;
        Ok(())
    }

    pub fn check_partition_concept(&self, classifier: &MetaPointer) -> Result<(), ReplicaError> {
        if self.registry.is_partition(classifier) {
            Ok(())
        } else {
            Err(ReplicaError::NotAPartitionConcept(classifier.clone()))
        }
    }

    /// Register a subtree built directly on the graph.
    pub fn register_subtree(&mut self, node: NodeRef) {
        self.ids.update_with(&self.graph, node);
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut NodeGraph {
        &mut self.graph
    }

    pub fn ids(&self) -> &IdMapping {
        &self.ids
    }

    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.registry
    }

    pub fn lookup(&self, id: &str) -> Result<NodeRef, ResolutionError> {
        self.ids.from_id(id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.ids.try_from_id(id).map(|n| &self.graph[n])
    }

    pub fn property(&self, id: &str, property: &MetaPointer) -> Option<&str> {
        self.node(id).and_then(|n| n.property(property))
    }

    /// The node a reference target points at, if it lives in this replica.
    pub fn resolve_target(&self, target: &ReferenceTarget) -> Option<NodeRef> {
        self.ids.from_ref_id(target.reference.as_deref())
    }

    /// Apply a delta that originated elsewhere. No delta is emitted.
    pub fn apply(&mut self, delta: &Delta) -> Result<(), GraphError> {
        self.graph.apply_silently(|graph| match delta {
            Delta::PartitionAdded { partition } => graph.add_partition(*partition),
            Delta::PartitionDeleted { partition } => graph.delete_partition(*partition),
            Delta::PropertyAdded { node, property, value } => {
                graph.set_property(*node, property.clone(), value.clone())
            }
            Delta::PropertyChanged { node, property, new_value, .. } => {
                graph.set_property(*node, property.clone(), new_value.clone())
            }
            Delta::PropertyDeleted { node, property, .. } => graph.delete_property(*node, property.clone()),
            Delta::ChildAdded { parent, containment, index, child } => {
                graph.add_child(*parent, containment.clone(), *index, *child)
            }
            Delta::ChildDeleted { parent, containment, index, child } => {
                let removed = graph.delete_child(*parent, containment.clone(), *index)?;
                if removed != *child {
                    log::warn!(
                        "ChildDeleted at {containment}[{index}] named {} but removed {}",
                        graph[*child].id(),
                        graph[removed].id()
                    );
                }
                Ok(())
            }
            Delta::ReferenceAdded { node, reference, index, target } => {
                graph.add_reference(*node, reference.clone(), *index, target.clone())
            }
            Delta::ReferenceDeleted { node, reference, index, .. } => {
                graph.delete_reference(*node, reference.clone(), *index).map(|_| ())
            }
        })
    }

    /// Every partition of this replica as one chunk.
    pub fn snapshot(&self) -> Chunk {
        serialize_subtrees(&self.graph, self.graph.partitions())
    }
}

impl PriorState for Replica {
    fn property_value(&self, node: &str, property: &MetaPointer) -> Option<String> {
        self.property(node, property).map(str::to_string)
    }
}
