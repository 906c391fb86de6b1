//! Conversions between graph deltas and wire messages.
//!
//! ```text
//!  client graph ──Delta──▸ delta_to_command ──Command──▸ repository
//!  repository ──command_to_event──▸ Event ──broadcast──▸ every client
//!  client ──event_to_delta──▸ Delta ──Replica::apply──▸ client graph
//! ```
//!
//! Nodes are named by id on the wire and by handle in deltas. Chunks carried
//! by additions are deserialized into the receiving replica before the
//! delta is built, so every handle in the result is valid there.

use arbor_core::{serialize_subtree, Chunk, Delta, GraphError, MetaPointer, NodeGraph, NodeRef, SerializedNode};

use crate::id_mapping::ResolutionError;
use crate::protocol::{Command, CommandId, CommandKind, CommandSource, Event, EventKind};
use crate::replica::{Replica, ReplicaError};

/// Placeholder `oldValue` when the prior value is not known.
pub const UNKNOWN_OLD_VALUE: &str = "???";

/// Read access to the state a command is about to overwrite.
pub trait PriorState {
    fn property_value(&self, node: &str, property: &MetaPointer) -> Option<String>;
}

/// Knows nothing; every old value becomes [`UNKNOWN_OLD_VALUE`].
pub struct NoPriorState;

impl PriorState for NoPriorState {
    fn property_value(&self, _node: &str, _property: &MetaPointer) -> Option<String> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("{kind} chunk must have exactly one root, found {roots}")]
    RootCount { kind: &'static str, roots: usize },
}

/// Express a local delta as a command for the repository.
pub fn delta_to_command(graph: &NodeGraph, delta: &Delta, command_id: impl Into<CommandId>) -> Command {
    let id = |node: &NodeRef| graph[*node].id().to_string();
    let kind = match delta {
        Delta::PartitionAdded { partition } => CommandKind::AddPartition {
            new_partition: serialize_subtree(graph, *partition),
        },
        Delta::PartitionDeleted { partition } => CommandKind::DeletePartition {
            deleted_partition: id(partition),
        },
        Delta::PropertyAdded { node, property, value } => CommandKind::AddProperty {
            node: id(node),
            property: property.clone(),
            new_value: value.clone(),
        },
        Delta::PropertyChanged { node, property, new_value, .. } => CommandKind::ChangeProperty {
            node: id(node),
            property: property.clone(),
            new_value: new_value.clone(),
        },
        Delta::PropertyDeleted { node, property, .. } => CommandKind::DeleteProperty {
            node: id(node),
            property: property.clone(),
        },
        Delta::ChildAdded { parent, containment, index, child } => CommandKind::AddChild {
            parent: id(parent),
            new_child: serialize_subtree(graph, *child),
            containment: containment.clone(),
            index: *index,
        },
        Delta::ChildDeleted { parent, containment, index, child } => CommandKind::DeleteChild {
            parent: id(parent),
            containment: containment.clone(),
            index: *index,
            deleted_child: id(child),
        },
        Delta::ReferenceAdded { node, reference, index, target } => CommandKind::AddReference {
            node: id(node),
            reference: reference.clone(),
            index: *index,
            new_target: target.clone(),
        },
        Delta::ReferenceDeleted { node, reference, index, target } => CommandKind::DeleteReference {
            node: id(node),
            reference: reference.clone(),
            index: *index,
            deleted_target: target.clone(),
        },
    };
    Command::new(command_id, kind)
}

/// Turn an accepted command into the event broadcast for it.
///
/// Old values are looked up in `prior`, which should be the state before
/// the command is applied.
pub fn command_to_event(
    command: Command,
    participation_id: &str,
    sequence_number: u64,
    prior: &dyn PriorState,
) -> Event {
    let old_value = |node: &str, property: &MetaPointer| {
        prior
            .property_value(node, property)
            .unwrap_or_else(|| UNKNOWN_OLD_VALUE.to_string())
    };
    let kind = match command.kind {
        CommandKind::AddPartition { new_partition } => EventKind::PartitionAdded { new_partition },
        CommandKind::DeletePartition { deleted_partition } => {
            EventKind::PartitionDeleted { deleted_partition }
        }
        CommandKind::AddProperty { node, property, new_value } => EventKind::PropertyAdded {
            node,
            property,
            new_value,
        },
        CommandKind::ChangeProperty { node, property, new_value } => {
            let old_value = old_value(&node, &property);
            EventKind::PropertyChanged {
                node,
                property,
                new_value,
                old_value,
            }
        }
        CommandKind::DeleteProperty { node, property } => {
            let old_value = old_value(&node, &property);
            EventKind::PropertyDeleted { node, property, old_value }
        }
        CommandKind::AddChild { parent, new_child, containment, index } => EventKind::ChildAdded {
            parent,
            new_child,
            containment,
            index,
        },
        CommandKind::DeleteChild { parent, containment, index, deleted_child } => {
            EventKind::ChildDeleted {
                parent,
                containment,
                index,
                deleted_child,
            }
        }
        CommandKind::AddReference { node, reference, index, new_target } => {
            EventKind::ReferenceAdded {
                node,
                reference,
                index,
                new_target,
            }
        }
        CommandKind::DeleteReference { node, reference, index, deleted_target } => {
            EventKind::ReferenceDeleted {
                node,
                reference,
                index,
                deleted_target,
            }
        }
    };
    let origin = CommandSource {
        participation_id: participation_id.to_string(),
        command_id: command.command_id,
    };
    Event::new(kind, sequence_number, vec![origin])
}

/// Resolve an incoming event against `replica`.
///
/// Every id the event names must already be known, except for the nodes
/// inside an added chunk, which are introduced here. Existing ids, the
/// insertion index and the partition concept are checked before any chunk
/// is deserialized, so a failed translation leaves the replica untouched
/// and the resulting delta applies cleanly.
pub fn event_to_delta(event: &Event, replica: &mut Replica) -> Result<Delta, TranslationError> {
    let delta = match &event.kind {
        EventKind::PartitionAdded { new_partition } => {
            let root = single_root(new_partition, "PartitionAdded")?;
            replica.check_partition_concept(&root.classifier)?;
            let partition = introduce_single(replica, new_partition, "PartitionAdded")?;
            Delta::PartitionAdded { partition }
        }
        EventKind::PartitionDeleted { deleted_partition } => Delta::PartitionDeleted {
            partition: replica.lookup(deleted_partition)?,
        },
        EventKind::PropertyAdded { node, property, new_value } => Delta::PropertyAdded {
            node: replica.lookup(node)?,
            property: property.clone(),
            value: new_value.clone(),
        },
        EventKind::PropertyChanged { node, property, new_value, old_value } => {
            Delta::PropertyChanged {
                node: replica.lookup(node)?,
                property: property.clone(),
                new_value: new_value.clone(),
                old_value: old_value.clone(),
            }
        }
        EventKind::PropertyDeleted { node, property, old_value } => Delta::PropertyDeleted {
            node: replica.lookup(node)?,
            property: property.clone(),
            old_value: old_value.clone(),
        },
        EventKind::ChildAdded { parent, new_child, containment, index } => {
            let parent = replica.lookup(parent)?;
            let len = replica.graph()[parent].children(containment).len();
            if *index > len {
                return Err(GraphError::IndexOutOfBounds {
                    feature: containment.clone(),
                    index: *index,
                    len,
                }
                .into());
            }
            let child = introduce_single(replica, new_child, "ChildAdded")?;
            Delta::ChildAdded {
                parent,
                containment: containment.clone(),
                index: *index,
                child,
            }
        }
        EventKind::ChildDeleted { parent, containment, index, deleted_child } => {
            Delta::ChildDeleted {
                parent: replica.lookup(parent)?,
                containment: containment.clone(),
                index: *index,
                child: replica.lookup(deleted_child)?,
            }
        }
        EventKind::ReferenceAdded { node, reference, index, new_target } => {
            Delta::ReferenceAdded {
                node: replica.lookup(node)?,
                reference: reference.clone(),
                index: *index,
                target: new_target.clone(),
            }
        }
        EventKind::ReferenceDeleted { node, reference, index, deleted_target } => {
            Delta::ReferenceDeleted {
                node: replica.lookup(node)?,
                reference: reference.clone(),
                index: *index,
                target: deleted_target.clone(),
            }
        }
    };
    Ok(delta)
}

fn single_root<'a>(chunk: &'a Chunk, kind: &'static str) -> Result<&'a SerializedNode, TranslationError> {
    let root_ids = chunk.root_ids();
    if root_ids.len() != 1 {
        return Err(TranslationError::RootCount { kind, roots: root_ids.len() });
    }
    chunk
        .nodes
        .iter()
        .find(|n| n.id == root_ids[0])
        .ok_or(TranslationError::RootCount { kind, roots: 0 })
}

fn introduce_single(
    replica: &mut Replica,
    chunk: &Chunk,
    kind: &'static str,
) -> Result<NodeRef, TranslationError> {
    single_root(chunk, kind)?;
    let introduced = replica.introduce(chunk)?;
    introduced
        .first()
        .copied()
        .ok_or(TranslationError::RootCount { kind, roots: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        documentation, documentation_partition, items, mp, see_also, shared_registry, text,
    };
    use arbor_core::ReferenceTarget;
    use std::sync::{Arc, Mutex};

    /// Two replicas of the same partition; the first records its deltas
    /// as commands.
    fn pair() -> (Replica, Replica, Arc<Mutex<Vec<Command>>>) {
        let mut source = NodeGraph::new();
        let partition = documentation_partition(&mut source, "(some text)");
        let chunk = serialize_subtree(&source, partition);

        let mut local = Replica::from_chunk(shared_registry(), &chunk).unwrap();
        let remote = Replica::from_chunk(shared_registry(), &chunk).unwrap();

        let outbox = Arc::new(Mutex::new(Vec::new()));
        let sink = outbox.clone();
        let mut counter = 0;
        local.graph_mut().set_receiver(move |graph: &NodeGraph, delta: &Delta| {
            counter += 1;
            sink.lock().unwrap().push(delta_to_command(graph, delta, format!("c-{counter}")));
        });
        (local, remote, outbox)
    }

    /// Forward every recorded command to `remote` and return the deltas
    /// applied there.
    fn forward(outbox: &Arc<Mutex<Vec<Command>>>, remote: &mut Replica) -> Vec<Delta> {
        let commands: Vec<Command> = outbox.lock().unwrap().drain(..).collect();
        let mut applied = Vec::new();
        for (seq, command) in commands.into_iter().enumerate() {
            let event = command_to_event(command, "p-1", seq as u64, &*remote);
            let delta = event_to_delta(&event, remote).unwrap();
            remote.apply(&delta).unwrap();
            applied.push(delta);
        }
        applied
    }

    #[test]
    fn test_property_change_roundtrip() {
        let (mut local, mut remote, outbox) = pair();
        let doc = local.lookup("doc").unwrap();
        local.graph_mut().set_property(doc, text(), "bye bye").unwrap();

        let commands = outbox.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command_id, "c-1");
        assert!(matches!(&commands[0].kind, CommandKind::ChangeProperty { node, new_value, .. }
            if node == "doc" && new_value == "bye bye"));

        let deltas = forward(&outbox, &mut remote);
        assert!(matches!(&deltas[0], Delta::PropertyChanged { old_value, .. } if old_value == "(some text)"));
        assert_eq!(remote.property("doc", &text()), Some("bye bye"));
    }

    #[test]
    fn test_property_add_and_delete_roundtrip() {
        let (mut local, mut remote, outbox) = pair();
        let item = local.lookup("item-0").unwrap();
        let graph = local.graph_mut();
        graph.set_property(item, mp("name"), "first").unwrap();
        graph.delete_property(item, mp("name")).unwrap();

        let deltas = forward(&outbox, &mut remote);
        assert_eq!(deltas[0].kind(), "PropertyAdded");
        assert!(matches!(&deltas[1], Delta::PropertyDeleted { old_value, .. } if old_value == "first"));
        assert_eq!(remote.property("item-0", &mp("name")), None);
    }

    #[test]
    fn test_child_insertion_roundtrip() {
        let (mut local, mut remote, outbox) = pair();
        let partition = local.lookup("partition").unwrap();
        let child = local.new_node("item-1", mp("Item")).unwrap();
        let grandchild = local.new_node("item-1-doc", mp("Documentation")).unwrap();
        let graph = local.graph_mut();
        graph
            .apply_silently(|g| g.add_child(child, documentation(), 0, grandchild))
            .unwrap();
        graph.add_child(partition, items(), 0, child).unwrap();

        let commands = outbox.lock().unwrap().clone();
        match &commands[0].kind {
            CommandKind::AddChild { new_child, index, .. } => {
                assert_eq!(*index, 0);
                assert_eq!(new_child.root_ids(), vec!["item-1"]);
                assert_eq!(new_child.nodes.len(), 2);
            }
            other => panic!("expected AddChild, got {other:?}"),
        }

        forward(&outbox, &mut remote);
        let remote_partition = remote.lookup("partition").unwrap();
        let order: Vec<&str> = remote.graph()[remote_partition]
            .children(&items())
            .iter()
            .map(|c| remote.graph()[*c].id())
            .collect();
        assert_eq!(order, vec!["item-1", "item-0"]);
        assert!(remote.ids().contains("item-1-doc"));
    }

    #[test]
    fn test_child_deletion_roundtrip() {
        let (mut local, mut remote, outbox) = pair();
        let partition = local.lookup("partition").unwrap();
        let removed = local.graph_mut().delete_child(partition, items(), 0).unwrap();
        assert_eq!(local.graph()[removed].id(), "item-0");

        let deltas = forward(&outbox, &mut remote);
        assert!(matches!(&deltas[0], Delta::ChildDeleted { index: 0, .. }));
        let remote_partition = remote.lookup("partition").unwrap();
        assert!(remote.graph()[remote_partition].children(&items()).is_empty());
    }

    #[test]
    fn test_reference_roundtrip() {
        let (mut local, mut remote, outbox) = pair();
        let item = local.lookup("item-0").unwrap();
        let graph = local.graph_mut();
        graph
            .add_reference(item, see_also(), 0, ReferenceTarget::to("doc").with_resolve_info("Doc"))
            .unwrap();
        graph
            .add_reference(item, see_also(), 1, ReferenceTarget::default())
            .unwrap();
        graph.delete_reference(item, see_also(), 0).unwrap();

        forward(&outbox, &mut remote);
        let remote_item = remote.lookup("item-0").unwrap();
        let targets = remote.graph()[remote_item].references(&see_also());
        assert_eq!(targets.len(), 1);
        assert_eq!(remote.resolve_target(&targets[0]), None);
    }

    #[test]
    fn test_partition_roundtrip() {
        let (mut local, mut remote, outbox) = pair();
        let second = local.new_node("second", mp("Partition")).unwrap();
        local.add_partition(second).unwrap();
        let first = local.lookup("partition").unwrap();
        local.graph_mut().delete_partition(first).unwrap();

        forward(&outbox, &mut remote);
        let ids: Vec<&str> = remote
            .graph()
            .partitions()
            .iter()
            .map(|p| remote.graph()[*p].id())
            .collect();
        assert_eq!(ids, vec!["second"]);
    }

    #[test]
    fn test_unknown_old_value_placeholder() {
        let command = Command::new(
            "c",
            CommandKind::ChangeProperty {
                node: "doc".into(),
                property: text(),
                new_value: "v".into(),
            },
        );
        let event = command_to_event(command, "p-9", 4, &NoPriorState);

        assert_eq!(event.sequence_number, 4);
        assert_eq!(
            event.origin_commands,
            vec![CommandSource {
                participation_id: "p-9".into(),
                command_id: "c".into()
            }]
        );
        assert!(matches!(event.kind, EventKind::PropertyChanged { old_value, .. } if old_value == UNKNOWN_OLD_VALUE));
    }

    #[test]
    fn test_unknown_node_fails_without_side_effects() {
        let (_, mut remote, _) = pair();
        let before = remote.graph().len();
        let event = Event::new(
            EventKind::ChildAdded {
                parent: "ghost".into(),
                new_child: serialize_subtree(remote.graph(), remote.lookup("item-0").unwrap()),
                containment: items(),
                index: 0,
            },
            0,
            Vec::new(),
        );

        let err = event_to_delta(&event, &mut remote).unwrap_err();
        assert!(matches!(err, TranslationError::Resolution(ResolutionError(id)) if id == "ghost"));
        assert_eq!(remote.graph().len(), before);
    }

    #[test]
    fn test_multi_root_chunk_rejected() {
        let (_, mut remote, _) = pair();
        let event = Event::new(
            EventKind::PartitionAdded {
                new_partition: Chunk::empty(),
            },
            0,
            Vec::new(),
        );
        assert!(matches!(
            event_to_delta(&event, &mut remote),
            Err(TranslationError::RootCount { roots: 0, .. })
        ));
    }

    fn fresh_chunk(id: &str, concept: &str) -> Chunk {
        let mut scratch = NodeGraph::new();
        let node = scratch.create_node(id, mp(concept));
        serialize_subtree(&scratch, node)
    }

    fn child_added(new_child: Chunk, index: usize) -> Event {
        Event::new(
            EventKind::ChildAdded {
                parent: "partition".into(),
                new_child,
                containment: items(),
                index,
            },
            0,
            Vec::new(),
        )
    }

    #[test]
    fn test_child_chunk_reusing_known_id_rejected() {
        let (_, mut remote, _) = pair();
        let before = remote.graph().len();
        let doc = remote.lookup("doc").unwrap();

        let err = event_to_delta(&child_added(fresh_chunk("doc", "Item"), 0), &mut remote).unwrap_err();
        assert!(matches!(err, TranslationError::Replica(ReplicaError::DuplicateId(id)) if id == "doc"));
        assert_eq!(remote.graph().len(), before);
        assert_eq!(remote.lookup("doc").unwrap(), doc);
    }

    #[test]
    fn test_out_of_bounds_child_add_introduces_nothing() {
        let (_, mut remote, _) = pair();
        let before = remote.graph().len();
        let known = remote.ids().len();

        let err = event_to_delta(&child_added(fresh_chunk("orphan", "Item"), 99), &mut remote).unwrap_err();
        assert!(matches!(err, TranslationError::Graph(GraphError::IndexOutOfBounds { index: 99, len: 1, .. })));
        assert!(!remote.ids().contains("orphan"));
        assert_eq!(remote.ids().len(), known);
        assert_eq!(remote.graph().len(), before);
    }

    #[test]
    fn test_child_add_at_end_accepted() {
        let (_, mut remote, _) = pair();
        let delta = event_to_delta(&child_added(fresh_chunk("item-1", "Item"), 1), &mut remote).unwrap();
        remote.apply(&delta).unwrap();
        let partition = remote.lookup("partition").unwrap();
        assert_eq!(remote.graph()[partition].children(&items()).len(), 2);
    }

    #[test]
    fn test_partition_of_non_partition_concept_rejected() {
        let (_, mut remote, _) = pair();
        let event = Event::new(
            EventKind::PartitionAdded {
                new_partition: fresh_chunk("loose-item", "Item"),
            },
            0,
            Vec::new(),
        );

        let err = event_to_delta(&event, &mut remote).unwrap_err();
        assert!(matches!(err, TranslationError::Replica(ReplicaError::NotAPartitionConcept(c)) if c == mp("Item")));
        assert!(!remote.ids().contains("loose-item"));
    }
}
