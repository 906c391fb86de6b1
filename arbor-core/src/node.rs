use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::language::MetaPointer;

/// Opaque node identifier, unique across the whole shared model.
pub type NodeId = String;

/// Handle to a node inside one [`NodeGraph`](crate::graph::NodeGraph).
///
/// Handles are only meaningful for the graph that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub(crate) usize);

impl NodeRef {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One entry of a reference feature.
///
/// The target is kept by id so a reference can point outside the
/// replica (or at nothing yet) without losing its identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceTarget {
    pub reference: Option<NodeId>,
    pub resolve_info: Option<String>,
}

impl ReferenceTarget {
    pub fn to(id: impl Into<NodeId>) -> Self {
        Self {
            reference: Some(id.into()),
            resolve_info: None,
        }
    }

    pub fn with_resolve_info(mut self, info: impl Into<String>) -> Self {
        self.resolve_info = Some(info.into());
        self
    }
}

/// A node of the model tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) classifier: MetaPointer,
    pub(crate) properties: BTreeMap<MetaPointer, String>,
    pub(crate) containments: BTreeMap<MetaPointer, Vec<NodeRef>>,
    pub(crate) references: BTreeMap<MetaPointer, Vec<ReferenceTarget>>,
    pub(crate) annotations: Vec<NodeRef>,
    pub(crate) parent: Option<NodeRef>,
}

impl Node {
    pub(crate) fn new(id: NodeId, classifier: MetaPointer) -> Self {
        Self {
            id,
            classifier,
            properties: BTreeMap::new(),
            containments: BTreeMap::new(),
            references: BTreeMap::new(),
            annotations: Vec::new(),
            parent: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn classifier(&self) -> &MetaPointer {
        &self.classifier
    }

    pub fn property(&self, property: &MetaPointer) -> Option<&str> {
        self.properties.get(property).map(String::as_str)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&MetaPointer, &str)> {
        self.properties.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Children of one containment, in order. Empty if the feature has
    /// never been populated.
    pub fn children(&self, containment: &MetaPointer) -> &[NodeRef] {
        self.containments
            .get(containment)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn containments(&self) -> impl Iterator<Item = (&MetaPointer, &[NodeRef])> {
        self.containments.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn references(&self, reference: &MetaPointer) -> &[ReferenceTarget] {
        self.references
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_references(&self) -> impl Iterator<Item = (&MetaPointer, &[ReferenceTarget])> {
        self.references.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn annotations(&self) -> &[NodeRef] {
        &self.annotations
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    /// Every directly owned node: containment children followed by
    /// annotations.
    pub fn all_children(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.containments
            .values()
            .flatten()
            .chain(self.annotations.iter())
            .copied()
    }
}
