//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use arbor_core::{serialize_subtree, Chunk, Language, LanguageRegistry, MetaPointer, NodeGraph};
use arbor_sync::{ClientConfig, ClientEvent, DeltaClient, Replica, RepositoryServer, ServerConfig};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn mp(key: &str) -> MetaPointer {
    MetaPointer::new("test-lang", "1", key)
}

pub fn text() -> MetaPointer {
    mp("text")
}

pub fn items() -> MetaPointer {
    mp("containment_0_1")
}

pub fn registry() -> Arc<LanguageRegistry> {
    let language = Language::new("test-lang", "1", "Test")
        .with_concept("Partition", "Partition", true)
        .with_concept("Documentation", "Documentation", false)
        .with_concept("Item", "Item", false);
    Arc::new(LanguageRegistry::new().with_language(language))
}

/// `partition` with a documentation node `doc` reading "(some text)" and
/// one child `item-0` under `containment_0_1`.
pub fn seed_chunk() -> Chunk {
    let mut graph = NodeGraph::new();
    let partition = graph.create_node("partition", mp("Partition"));
    let doc = graph.create_node("doc", mp("Documentation"));
    let item = graph.create_node("item-0", mp("Item"));
    graph.set_property(doc, text(), "(some text)").unwrap();
    graph.add_child(partition, mp("documentation"), 0, doc).unwrap();
    graph.add_child(partition, items(), 0, item).unwrap();
    serialize_subtree(&graph, partition)
}

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a seeded repository on a free port, return the port.
pub async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        first_sequence_number: 0,
    };
    let server = RepositoryServer::new(config, registry());
    server.seed(&seed_chunk()).await.unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// A connected, signed-on client with a replica seeded like the repository.
pub async fn signed_on_client(port: u16, client_id: &str) -> (DeltaClient, mpsc::Receiver<ClientEvent>) {
    let config = ClientConfig {
        url: format!("ws://127.0.0.1:{port}"),
        client_id: client_id.to_string(),
        query_timeout: WAIT,
        ..ClientConfig::default()
    };
    let replica = Replica::from_chunk(registry(), &seed_chunk()).unwrap();
    let mut client = DeltaClient::new(config, replica);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.sign_on(format!("{client_id}-sign-on")).await.unwrap();
    (client, events)
}

/// Wait for the first notification matching `pred`.
pub async fn wait_for(
    events: &mut mpsc::Receiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("notification channel closed");
    })
    .await
    .expect("timed out waiting for client notification")
}

pub async fn text_of(client: &DeltaClient, node: &str) -> Option<String> {
    client
        .with_replica(|r| r.property(node, &text()).map(str::to_string))
        .await
}

pub async fn child_ids(client: &DeltaClient) -> Vec<String> {
    client
        .with_replica(|r| {
            let partition = r.lookup("partition").unwrap();
            r.graph()[partition]
                .children(&items())
                .iter()
                .map(|c| r.graph()[*c].id().to_string())
                .collect()
        })
        .await
}
