//! Transport-ready serialization of node subtrees.
//!
//! ```text
//! {
//!   "serializationFormatVersion": "2023.1",
//!   "languages": [{ "key": ..., "version": ... }],
//!   "nodes": [{ "id", "classifier", "properties", "containments",
//!               "references", "annotations", "parent" }]
//! }
//! ```
//!
//! Nodes are listed in pre-order, subtree roots first. Containment and
//! annotation entries name children by id; every such child must itself be
//! present in the chunk.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::graph::NodeGraph;
use crate::language::{LanguageRegistry, MetaPointer, UsedLanguage};
use crate::node::{Node, NodeId, NodeRef, ReferenceTarget};

pub const SERIALIZATION_FORMAT_VERSION: &str = "2023.1";

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("Unsupported serialization format version: {0}")]
    UnsupportedVersion(String),

    #[error("Language {key}@{version} is not registered")]
    UnknownLanguage { key: String, version: String },

    #[error("Classifier {0} is not a known concept")]
    UnknownConcept(MetaPointer),

    #[error("Node id {0} occurs more than once in the chunk")]
    DuplicateId(NodeId),

    #[error("Node {parent} lists child {child}, which is not in the chunk")]
    MissingChild { parent: NodeId, child: NodeId },

    #[error("Node {0} is claimed by more than one container")]
    MultipleContainers(NodeId),

    #[error("Malformed chunk JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub serialization_format_version: String,
    pub languages: Vec<UsedLanguage>,
    pub nodes: Vec<SerializedNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNode {
    pub id: NodeId,
    pub classifier: MetaPointer,
    #[serde(default)]
    pub properties: Vec<SerializedProperty>,
    #[serde(default)]
    pub containments: Vec<SerializedContainment>,
    #[serde(default)]
    pub references: Vec<SerializedReference>,
    #[serde(default)]
    pub annotations: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedProperty {
    pub property: MetaPointer,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedContainment {
    pub containment: MetaPointer,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedReference {
    pub reference: MetaPointer,
    pub targets: Vec<ReferenceTarget>,
}

impl Chunk {
    pub fn empty() -> Self {
        Self {
            serialization_format_version: SERIALIZATION_FORMAT_VERSION.to_string(),
            languages: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, ChunkError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ChunkError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Ids of the nodes whose parent lies outside this chunk.
    pub fn root_ids(&self) -> Vec<&str> {
        let ids: BTreeSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        self.nodes
            .iter()
            .filter(|n| n.parent.as_deref().map_or(true, |p| !ids.contains(p)))
            .map(|n| n.id.as_str())
            .collect()
    }
}

/// Serialize `root` and all of its descendants.
pub fn serialize_subtree(graph: &NodeGraph, root: NodeRef) -> Chunk {
    serialize_subtrees(graph, &[root])
}

/// Serialize several subtrees into one chunk, in the given root order.
pub fn serialize_subtrees(graph: &NodeGraph, roots: &[NodeRef]) -> Chunk {
    let mut languages = BTreeSet::new();
    let mut nodes = Vec::new();

    for &root in roots {
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            let node = &graph[current];
            languages.insert(node.classifier().used_language());

            let properties = node
                .properties()
                .map(|(property, value)| {
                    languages.insert(property.used_language());
                    SerializedProperty {
                        property: property.clone(),
                        value: Some(value.to_string()),
                    }
                })
                .collect();
            let containments = node
                .containments()
                .map(|(containment, children)| {
                    languages.insert(containment.used_language());
                    SerializedContainment {
                        containment: containment.clone(),
                        children: children.iter().map(|c| graph[*c].id().to_string()).collect(),
                    }
                })
                .collect();
            let references = node
                .all_references()
                .map(|(reference, targets)| {
                    languages.insert(reference.used_language());
                    SerializedReference {
                        reference: reference.clone(),
                        targets: targets.to_vec(),
                    }
                })
                .collect();

            nodes.push(SerializedNode {
                id: node.id().to_string(),
                classifier: node.classifier().clone(),
                properties,
                containments,
                references,
                annotations: node.annotations().iter().map(|a| graph[*a].id().to_string()).collect(),
                parent: node.parent().map(|p| graph[p].id().to_string()),
            });

            // Reverse so the first child is visited first.
            let children: Vec<NodeRef> = node.all_children().collect();
            stack.extend(children.into_iter().rev());
        }
    }

    Chunk {
        serialization_format_version: SERIALIZATION_FORMAT_VERSION.to_string(),
        languages: languages.into_iter().collect(),
        nodes,
    }
}

/// Rebuild the nodes of `chunk` inside `graph`.
///
/// The new nodes are created detached from anything already in the graph;
/// the returned handles are the chunk's roots in chunk order. Nothing is
/// added to the graph if validation fails.
pub fn deserialize_chunk(
    graph: &mut NodeGraph,
    registry: &LanguageRegistry,
    chunk: &Chunk,
) -> Result<Vec<NodeRef>, ChunkError> {
    if chunk.serialization_format_version != SERIALIZATION_FORMAT_VERSION {
        return Err(ChunkError::UnsupportedVersion(
            chunk.serialization_format_version.clone(),
        ));
    }
    validate(registry, chunk)?;

    let mut handles: HashMap<&str, NodeRef> = HashMap::with_capacity(chunk.nodes.len());
    for serialized in &chunk.nodes {
        let mut node = Node::new(serialized.id.clone(), serialized.classifier.clone());
        for property in &serialized.properties {
            if let Some(value) = &property.value {
                node.properties.insert(property.property.clone(), value.clone());
            }
        }
        for reference in &serialized.references {
            node.references
                .insert(reference.reference.clone(), reference.targets.clone());
        }
        handles.insert(serialized.id.as_str(), graph.insert_node(node));
    }

    for serialized in &chunk.nodes {
        let parent = handles[serialized.id.as_str()];
        for containment in &serialized.containments {
            for child in &containment.children {
                graph.attach_child_raw(parent, containment.containment.clone(), handles[child.as_str()]);
            }
        }
        for annotation in &serialized.annotations {
            graph.attach_annotation_raw(parent, handles[annotation.as_str()]);
        }
    }

    Ok(chunk
        .root_ids()
        .into_iter()
        .map(|id| handles[id])
        .collect())
}

fn validate(registry: &LanguageRegistry, chunk: &Chunk) -> Result<(), ChunkError> {
    let mut ids = BTreeSet::new();
    for node in &chunk.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(ChunkError::DuplicateId(node.id.clone()));
        }
        let used = node.classifier.used_language();
        if !registry.knows_language(&used) {
            return Err(ChunkError::UnknownLanguage {
                key: used.key,
                version: used.version,
            });
        }
        if registry.concept(&node.classifier).is_none() {
            return Err(ChunkError::UnknownConcept(node.classifier.clone()));
        }
    }

    let mut contained = BTreeSet::new();
    for node in &chunk.nodes {
        let owned = node
            .containments
            .iter()
            .flat_map(|c| c.children.iter())
            .chain(node.annotations.iter());
        for child in owned {
            if !ids.contains(child.as_str()) {
                return Err(ChunkError::MissingChild {
                    parent: node.id.clone(),
                    child: child.clone(),
                });
            }
            if !contained.insert(child.as_str()) {
                return Err(ChunkError::MultipleContainers(child.clone()));
            }
        }
    }
    Ok(())
}
