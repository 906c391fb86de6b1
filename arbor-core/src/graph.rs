//! Node arena with delta notification.
//!
//! ```text
//!  set_property / add_child / ...
//!        │
//!        ▼
//!  NodeGraph (arena of Node) ──Delta──▸ DeltaReceiver
//!                                       (sees &NodeGraph)
//! ```
//!
//! Every public mutator validates the containment tree invariant, performs
//! the change and then hands exactly one [`Delta`] to the registered
//! receiver. Remote changes are applied through [`NodeGraph::apply_silently`]
//! so they are not reported back.

use std::ops::Index;

use crate::delta::Delta;
use crate::language::MetaPointer;
use crate::node::{Node, NodeId, NodeRef, ReferenceTarget};

/// Errors raised by graph mutations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Node handle {0:?} does not belong to this graph")]
    UnknownHandle(NodeRef),

    #[error("Node {0} already has a container")]
    AlreadyAttached(NodeId),

    #[error("Node {0} is already a partition")]
    AlreadyPartition(NodeId),

    #[error("Node {0} is not a partition")]
    NotAPartition(NodeId),

    #[error("Index {index} out of bounds for {feature} (length {len})")]
    IndexOutOfBounds {
        feature: MetaPointer,
        index: usize,
        len: usize,
    },

    #[error("Attaching node {0} would make it its own ancestor")]
    Cycle(NodeId),
}

/// Callback receiving every delta a graph emits.
///
/// The receiver is handed the graph in its post-mutation state, so it can
/// serialize whatever the delta points at before the graph changes again.
pub trait DeltaReceiver: Send {
    fn receive(&mut self, graph: &NodeGraph, delta: &Delta);
}

impl<F> DeltaReceiver for F
where
    F: FnMut(&NodeGraph, &Delta) + Send,
{
    fn receive(&mut self, graph: &NodeGraph, delta: &Delta) {
        self(graph, delta)
    }
}

/// Owner of all nodes of one replica.
#[derive(Default)]
pub struct NodeGraph {
    nodes: Vec<Node>,
    partitions: Vec<NodeRef>,
    receiver: Option<Box<dyn DeltaReceiver>>,
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGraph")
            .field("nodes", &self.nodes.len())
            .field("partitions", &self.partitions)
            .field("receiver", &self.receiver.is_some())
            .finish()
    }
}

impl Index<NodeRef> for NodeGraph {
    type Output = Node;

    /// Panics if the handle was issued by a different graph.
    fn index(&self, node: NodeRef) -> &Node {
        &self.nodes[node.0]
    }
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detached node. Creation itself is not a mutation of the
    /// model and emits nothing; attaching the node does.
    pub fn create_node(&mut self, id: impl Into<NodeId>, classifier: MetaPointer) -> NodeRef {
        self.insert_node(Node::new(id.into(), classifier))
    }

    pub fn get(&self, node: NodeRef) -> Option<&Node> {
        self.nodes.get(node.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn partitions(&self) -> &[NodeRef] {
        &self.partitions
    }

    pub fn is_partition(&self, node: NodeRef) -> bool {
        self.partitions.contains(&node)
    }

    /// Register the receiver for subsequently emitted deltas.
    pub fn set_receiver(&mut self, receiver: impl DeltaReceiver + 'static) {
        self.receiver = Some(Box::new(receiver));
    }

    pub fn take_receiver(&mut self) -> Option<Box<dyn DeltaReceiver>> {
        self.receiver.take()
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver.is_some()
    }

    /// Run `f` with the receiver detached, so none of its mutations are
    /// reported.
    pub fn apply_silently<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let receiver = self.receiver.take();
        let result = f(self);
        self.receiver = receiver;
        result
    }

    /// The topmost container of `node` (the node itself if detached).
    pub fn root_of(&self, node: NodeRef) -> NodeRef {
        let mut current = node;
        while let Some(parent) = self.nodes[current.0].parent {
            current = parent;
        }
        current
    }

    // ---------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------

    pub fn add_partition(&mut self, partition: NodeRef) -> Result<(), GraphError> {
        let node = self.node(partition)?;
        if node.parent.is_some() {
            return Err(GraphError::AlreadyAttached(node.id.clone()));
        }
        if self.partitions.contains(&partition) {
            return Err(GraphError::AlreadyPartition(node.id.clone()));
        }
        self.partitions.push(partition);
        self.emit(Delta::PartitionAdded { partition });
        Ok(())
    }

    pub fn delete_partition(&mut self, partition: NodeRef) -> Result<(), GraphError> {
        let node = self.node(partition)?;
        let position = self
            .partitions
            .iter()
            .position(|p| *p == partition)
            .ok_or_else(|| GraphError::NotAPartition(node.id.clone()))?;
        self.partitions.remove(position);
        self.emit(Delta::PartitionDeleted { partition });
        Ok(())
    }

    /// Set a property value. Emits `PropertyAdded` for a fresh value and
    /// `PropertyChanged` when replacing one; writing the current value again
    /// changes nothing and emits nothing.
    pub fn set_property(
        &mut self,
        node: NodeRef,
        property: MetaPointer,
        value: impl Into<String>,
    ) -> Result<(), GraphError> {
        let value = value.into();
        let target = self.node_mut(node)?;
        let delta = match target.properties.insert(property.clone(), value.clone()) {
            None => Delta::PropertyAdded {
                node,
                property,
                value,
            },
            Some(old_value) if old_value == value => return Ok(()),
            Some(old_value) => Delta::PropertyChanged {
                node,
                property,
                new_value: value,
                old_value,
            },
        };
        self.emit(delta);
        Ok(())
    }

    /// Remove a property value. Removing an absent value is a no-op.
    pub fn delete_property(&mut self, node: NodeRef, property: MetaPointer) -> Result<(), GraphError> {
        let target = self.node_mut(node)?;
        if let Some(old_value) = target.properties.remove(&property) {
            self.emit(Delta::PropertyDeleted {
                node,
                property,
                old_value,
            });
        }
        Ok(())
    }

    pub fn add_child(
        &mut self,
        parent: NodeRef,
        containment: MetaPointer,
        index: usize,
        child: NodeRef,
    ) -> Result<(), GraphError> {
        self.node(parent)?;
        let child_node = self.node(child)?;
        if child_node.parent.is_some() || self.partitions.contains(&child) {
            return Err(GraphError::AlreadyAttached(child_node.id.clone()));
        }
        if self.root_of(parent) == child {
            return Err(GraphError::Cycle(child_node.id.clone()));
        }

        let children = self.nodes[parent.0]
            .containments
            .entry(containment.clone())
            .or_default();
        if index > children.len() {
            return Err(GraphError::IndexOutOfBounds {
                feature: containment,
                index,
                len: children.len(),
            });
        }
        children.insert(index, child);
        self.nodes[child.0].parent = Some(parent);

        self.emit(Delta::ChildAdded {
            parent,
            containment,
            index,
            child,
        });
        Ok(())
    }

    /// Detach the child at `index`. The removed subtree stays in the arena.
    pub fn delete_child(
        &mut self,
        parent: NodeRef,
        containment: MetaPointer,
        index: usize,
    ) -> Result<NodeRef, GraphError> {
        let target = self.node_mut(parent)?;
        let len = target.children(&containment).len();
        if index >= len {
            return Err(GraphError::IndexOutOfBounds {
                feature: containment,
                index,
                len,
            });
        }
        let children = target.containments.entry(containment.clone()).or_default();
        let child = children.remove(index);
        self.nodes[child.0].parent = None;

        self.emit(Delta::ChildDeleted {
            parent,
            containment,
            index,
            child,
        });
        Ok(child)
    }

    pub fn add_reference(
        &mut self,
        node: NodeRef,
        reference: MetaPointer,
        index: usize,
        target: ReferenceTarget,
    ) -> Result<(), GraphError> {
        let source = self.node_mut(node)?;
        let targets = source.references.entry(reference.clone()).or_default();
        if index > targets.len() {
            return Err(GraphError::IndexOutOfBounds {
                feature: reference,
                index,
                len: targets.len(),
            });
        }
        targets.insert(index, target.clone());

        self.emit(Delta::ReferenceAdded {
            node,
            reference,
            index,
            target,
        });
        Ok(())
    }

    pub fn delete_reference(
        &mut self,
        node: NodeRef,
        reference: MetaPointer,
        index: usize,
    ) -> Result<ReferenceTarget, GraphError> {
        let source = self.node_mut(node)?;
        let len = source.references(&reference).len();
        if index >= len {
            return Err(GraphError::IndexOutOfBounds {
                feature: reference,
                index,
                len,
            });
        }
        let target = source
            .references
            .entry(reference.clone())
            .or_default()
            .remove(index);

        self.emit(Delta::ReferenceDeleted {
            node,
            reference,
            index,
            target: target.clone(),
        });
        Ok(target)
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    /// Append without validation or notification; used while rebuilding a
    /// subtree from a chunk.
    pub(crate) fn attach_child_raw(&mut self, parent: NodeRef, containment: MetaPointer, child: NodeRef) {
        self.nodes[parent.0]
            .containments
            .entry(containment)
            .or_default()
            .push(child);
        self.nodes[child.0].parent = Some(parent);
    }

    pub(crate) fn attach_annotation_raw(&mut self, node: NodeRef, annotation: NodeRef) {
        self.nodes[node.0].annotations.push(annotation);
        self.nodes[annotation.0].parent = Some(node);
    }

    pub(crate) fn insert_node(&mut self, node: Node) -> NodeRef {
        let handle = NodeRef(self.nodes.len());
        self.nodes.push(node);
        handle
    }

    fn node_mut(&mut self, node: NodeRef) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(node.0).ok_or(GraphError::UnknownHandle(node))
    }

    fn node(&self, node: NodeRef) -> Result<&Node, GraphError> {
        self.nodes.get(node.0).ok_or(GraphError::UnknownHandle(node))
    }

    fn emit(&mut self, delta: Delta) {
        log::trace!("Graph emitting {}", delta.kind());
        if let Some(mut receiver) = self.receiver.take() {
            receiver.receive(self, &delta);
            self.receiver = Some(receiver);
        }
    }
}
