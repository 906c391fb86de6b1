//! # arbor-core: node graph for the Arbor model repository
//!
//! Holds the tree-structured model that `arbor-sync` keeps consistent
//! between clients:
//!
//! - [`language`]: meta-pointers and the injected [`LanguageRegistry`]
//! - [`node`]: nodes, handles and reference targets
//! - [`graph`]: the node arena, its mutators and the delta receiver hook
//! - [`delta`]: one-mutation change notifications
//! - [`chunk`]: subtree (de)serialization for transport

pub mod chunk;
pub mod delta;
pub mod graph;
pub mod language;
pub mod node;

pub use chunk::{
    deserialize_chunk, serialize_subtree, serialize_subtrees, Chunk, ChunkError, SerializedNode,
    SERIALIZATION_FORMAT_VERSION,
};
pub use delta::Delta;
pub use graph::{DeltaReceiver, GraphError, NodeGraph};
pub use language::{Concept, Language, LanguageRegistry, MetaPointer, UsedLanguage};
pub use node::{Node, NodeId, NodeRef, ReferenceTarget};
