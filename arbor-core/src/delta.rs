//! In-process mutation notifications.
//!
//! A `Delta` describes exactly one atomic mutation of a [`NodeGraph`]
//! (crate::graph::NodeGraph). Nodes are addressed by graph handle, so a
//! delta is only meaningful together with the graph that produced or will
//! consume it. Deltas are created at mutation time, consumed right away
//! and never retained.

use crate::language::MetaPointer;
use crate::node::{NodeRef, ReferenceTarget};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    PartitionAdded {
        partition: NodeRef,
    },
    PartitionDeleted {
        partition: NodeRef,
    },
    PropertyAdded {
        node: NodeRef,
        property: MetaPointer,
        value: String,
    },
    PropertyChanged {
        node: NodeRef,
        property: MetaPointer,
        new_value: String,
        old_value: String,
    },
    PropertyDeleted {
        node: NodeRef,
        property: MetaPointer,
        old_value: String,
    },
    ChildAdded {
        parent: NodeRef,
        containment: MetaPointer,
        index: usize,
        child: NodeRef,
    },
    ChildDeleted {
        parent: NodeRef,
        containment: MetaPointer,
        index: usize,
        child: NodeRef,
    },
    ReferenceAdded {
        node: NodeRef,
        reference: MetaPointer,
        index: usize,
        target: ReferenceTarget,
    },
    ReferenceDeleted {
        node: NodeRef,
        reference: MetaPointer,
        index: usize,
        target: ReferenceTarget,
    },
}

impl Delta {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PartitionAdded { .. } => "PartitionAdded",
            Self::PartitionDeleted { .. } => "PartitionDeleted",
            Self::PropertyAdded { .. } => "PropertyAdded",
            Self::PropertyChanged { .. } => "PropertyChanged",
            Self::PropertyDeleted { .. } => "PropertyDeleted",
            Self::ChildAdded { .. } => "ChildAdded",
            Self::ChildDeleted { .. } => "ChildDeleted",
            Self::ReferenceAdded { .. } => "ReferenceAdded",
            Self::ReferenceDeleted { .. } => "ReferenceDeleted",
        }
    }
}
