use std::hint::black_box;
use std::sync::Arc;

use arbor_core::{serialize_subtree, Chunk, Delta, Language, LanguageRegistry, MetaPointer, NodeGraph};
use arbor_sync::{
    command_to_event, delta_to_command, event_to_delta, Command, CommandKind, EventBroadcast, Message,
    NoPriorState, OrderingBuffer, Replica, Repository, DELTA_PROTOCOL_VERSION,
};
use criterion::{criterion_group, criterion_main, Criterion};

fn mp(key: &str) -> MetaPointer {
    MetaPointer::new("bench-lang", "1", key)
}

fn registry() -> Arc<LanguageRegistry> {
    let language = Language::new("bench-lang", "1", "Bench")
        .with_concept("Partition", "Partition", true)
        .with_concept("Item", "Item", false);
    Arc::new(LanguageRegistry::new().with_language(language))
}

/// A partition holding `n` items, each with a name.
fn partition_chunk(n: usize) -> Chunk {
    let mut graph = NodeGraph::new();
    let partition = graph.create_node("partition", mp("Partition"));
    for i in 0..n {
        let item = graph.create_node(format!("item-{i}"), mp("Item"));
        graph.set_property(item, mp("name"), format!("item {i}")).unwrap();
        graph.add_child(partition, mp("items"), i, item).unwrap();
    }
    serialize_subtree(&graph, partition)
}

fn rename(i: u64) -> Command {
    Command::new(
        format!("cmd-{i}"),
        CommandKind::ChangeProperty {
            node: "item-0".into(),
            property: mp("name"),
            new_value: format!("renamed {i}"),
        },
    )
}

fn bench_ordering_in_order(c: &mut Criterion) {
    c.bench_function("ordering_in_order_1000", |b| {
        b.iter(|| {
            let mut buffer = OrderingBuffer::new(|p: &u64| *p, 0);
            for p in 0..1000u64 {
                black_box(buffer.admit(black_box(p)).unwrap());
            }
        })
    });
}

fn bench_ordering_reversed(c: &mut Criterion) {
    c.bench_function("ordering_reversed_1000", |b| {
        b.iter(|| {
            let mut buffer = OrderingBuffer::new(|p: &u64| *p, 0);
            for p in (0..1000u64).rev() {
                black_box(buffer.admit(black_box(p)).unwrap());
            }
        })
    });
}

fn bench_command_encode(c: &mut Criterion) {
    let message = Message::from(rename(1));

    c.bench_function("command_encode", |b| {
        b.iter(|| {
            black_box(black_box(&message).encode().unwrap());
        })
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = command_to_event(rename(1), "participation-1", 1, &NoPriorState);
    let encoded = Message::from(event).encode().unwrap();

    c.bench_function("event_decode", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_partition_decode_100(c: &mut Criterion) {
    let event = command_to_event(
        Command::new(
            "cmd-partition",
            CommandKind::AddPartition {
                new_partition: partition_chunk(100),
            },
        ),
        "participation-1",
        0,
        &NoPriorState,
    );
    let encoded = Message::from(event).encode().unwrap();

    c.bench_function("partition_added_decode_100_nodes", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_translate_roundtrip(c: &mut Criterion) {
    let mut source = Replica::from_chunk(registry(), &partition_chunk(10)).unwrap();
    let mut target = Replica::from_chunk(registry(), &partition_chunk(10)).unwrap();
    let item = source.lookup("item-0").unwrap();

    c.bench_function("translate_property_roundtrip", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let delta = Delta::PropertyChanged {
                node: item,
                property: mp("name"),
                new_value: format!("renamed {i}"),
                old_value: String::new(),
            };
            let command = delta_to_command(source.graph(), &delta, format!("cmd-{i}"));
            let event = command_to_event(command, "participation-1", i, &source);
            let remote = event_to_delta(&event, &mut target).unwrap();
            target.apply(&remote).unwrap();
            source.apply(&delta).unwrap();
        })
    });
}

fn bench_repository_commands(c: &mut Criterion) {
    c.bench_function("repository_1000_commands", |b| {
        b.iter(|| {
            let mut repository = Repository::new(registry(), 2048, 0);
            repository.seed(&partition_chunk(10)).unwrap();
            let (participation, _rx) = repository.sign_on("bench", DELTA_PROTOCOL_VERSION);
            for i in 0..1000u64 {
                black_box(repository.handle_command(&participation, rename(i)).unwrap());
            }
        })
    });
}

fn bench_broadcast_100_subscribers(c: &mut Criterion) {
    let event = command_to_event(rename(1), "participation-1", 1, &NoPriorState);

    c.bench_function("broadcast_1000_events_100_subscribers", |b| {
        b.iter(|| {
            let broadcast = EventBroadcast::new(2048);
            let receivers: Vec<_> = (0..100).map(|_| broadcast.subscribe()).collect();
            for _ in 0..1000 {
                black_box(broadcast.broadcast(black_box(&event)).unwrap());
            }
            black_box(receivers);
        })
    });
}

criterion_group!(
    benches,
    bench_ordering_in_order,
    bench_ordering_reversed,
    bench_command_encode,
    bench_event_decode,
    bench_partition_decode_100,
    bench_translate_roundtrip,
    bench_repository_commands,
    bench_broadcast_100_subscribers,
);
criterion_main!(benches);
