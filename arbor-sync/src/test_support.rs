//! Shared fixtures for unit tests.

use std::sync::Arc;

use arbor_core::{Language, LanguageRegistry, MetaPointer, NodeGraph, NodeRef};

pub(crate) fn mp(key: &str) -> MetaPointer {
    MetaPointer::new("test-lang", "1", key)
}

pub(crate) fn test_language() -> Language {
    Language::new("test-lang", "1", "Test")
        .with_concept("Partition", "Partition", true)
        .with_concept("Documentation", "Documentation", false)
        .with_concept("Item", "Item", false)
}

pub(crate) fn test_registry() -> LanguageRegistry {
    LanguageRegistry::new().with_language(test_language())
}

pub(crate) fn shared_registry() -> Arc<LanguageRegistry> {
    Arc::new(test_registry())
}

pub(crate) fn text() -> MetaPointer {
    mp("text")
}

pub(crate) fn documentation() -> MetaPointer {
    mp("documentation")
}

pub(crate) fn items() -> MetaPointer {
    mp("containment_0_1")
}

pub(crate) fn see_also() -> MetaPointer {
    mp("seeAlso")
}

/// `partition` holding a `doc` node with the given text under
/// `documentation` and a single `item-0` under `containment_0_1`.
/// Built without notifications.
pub(crate) fn documentation_partition(graph: &mut NodeGraph, doc_text: &str) -> NodeRef {
    graph.apply_silently(|graph| {
        let partition = graph.create_node("partition", mp("Partition"));
        let doc = graph.create_node("doc", mp("Documentation"));
        let item = graph.create_node("item-0", mp("Item"));
        graph.set_property(doc, text(), doc_text).unwrap();
        graph.add_child(partition, documentation(), 0, doc).unwrap();
        graph.add_child(partition, items(), 0, item).unwrap();
        partition
    })
}
