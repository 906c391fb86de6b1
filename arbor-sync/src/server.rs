//! WebSocket front end of the repository.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──▸ Client A
//!            ├── Repository (mutex) ───┤
//! Client B ──┘   │  sequencing         └──▸ Client B
//!                │  authoritative replica
//!                └─ EventBroadcast
//! ```
//!
//! Each connection runs its own task. Queries are answered directly on the
//! connection; commands go through the shared [`Repository`], whose events
//! come back to every signed-on connection through its broadcast receiver.
//! Frames are JSON text messages.

use std::error::Error;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use arbor_core::{Chunk, LanguageRegistry};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::broadcast::Frame;
use crate::protocol::{Message, ParticipationId, QueryRequest, QueryResponse, RequestKind, ResponseKind};
use crate::replica::ReplicaError;
use crate::repository::Repository;

type ConnectionResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it lags
    pub broadcast_capacity: usize,
    /// Sequence number of the first event of every participation
    pub first_sequence_number: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            first_sequence_number: 0,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `ARBOR_BIND_ADDR`, `ARBOR_BROADCAST_CAPACITY`
    /// and `ARBOR_FIRST_SEQUENCE_NUMBER`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ServerConfig::from_env`], reading variables from `lookup`.
    /// Unparsable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("ARBOR_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = parse_var(&lookup, "ARBOR_BROADCAST_CAPACITY") {
            config.broadcast_capacity = capacity;
        }
        if let Some(first) = parse_var(&lookup, "ARBOR_FIRST_SEQUENCE_NUMBER") {
            config.first_sequence_number = first;
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub events_committed: u64,
}

/// The repository server.
pub struct RepositoryServer {
    config: ServerConfig,
    repository: Arc<Mutex<Repository>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RepositoryServer {
    pub fn new(config: ServerConfig, registry: Arc<LanguageRegistry>) -> Self {
        let repository = Repository::new(registry, config.broadcast_capacity, config.first_sequence_number);
        Self {
            config,
            repository: Arc::new(Mutex::new(repository)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults(registry: Arc<LanguageRegistry>) -> Self {
        Self::new(ServerConfig::default(), registry)
    }

    /// Load initial partitions before serving.
    pub async fn seed(&self, chunk: &Chunk) -> Result<(), ReplicaError> {
        self.repository.lock().await.seed(chunk)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Repository listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let repository = self.repository.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, repository, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        repository: Arc<Mutex<Repository>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut participation: Option<ParticipationId> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                match Message::decode(text.as_str()) {
                                    Ok(Message::Request(request)) => {
                                        let response =
                                            answer(request, &repository, &mut participation, &mut broadcast_rx).await;
                                        let frame = Message::Response(response).encode()?;
                                        ws_sender.send(WsMessage::Text(frame.into())).await?;
                                    }
                                    Ok(Message::Command(command)) => match &participation {
                                        Some(pid) => {
                                            if let Err(e) = repository.lock().await.handle_command(pid, command) {
                                                log::warn!("Command from {addr} not committed: {e}");
                                            }
                                        }
                                        None => log::warn!(
                                            "Dropping command {} from {addr}: connection has not signed on",
                                            command.command_id
                                        ),
                                    },
                                    Ok(other) => {
                                        log::warn!("Ignoring unexpected {} from {addr}", other.kind());
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(WsMessage::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(WsMessage::Ping(data))) => {
                                ws_sender.send(WsMessage::Pong(data)).await?;
                            }

                            Some(Ok(WsMessage::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {addr}");
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = async {
                        if let Some(ref mut rx) = broadcast_rx {
                            rx.recv().await
                        } else {
                            // Not signed on yet
                            std::future::pending().await
                        }
                    } => {
                        match frame {
                            Ok(frame) => {
                                ws_sender.send(WsMessage::Text((*frame).clone().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // Missed events cannot be replayed; the client would stall.
                                log::warn!("Participation {participation:?} lagged by {n} events, closing");
                                break;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            ConnectionResult::Ok(())
        }
        .await;

        if let Some(pid) = participation {
            repository.lock().await.sign_off(&pid);
        }
        stats.write().await.active_connections -= 1;
        result
    }

    /// Server statistics, including repository counters.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let repository = self.repository.lock().await;
        stats.active_sessions = repository.session_count();
        stats.events_committed = repository.events_committed();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Answer one query, updating the connection's participation.
async fn answer(
    request: QueryRequest,
    repository: &Mutex<Repository>,
    participation: &mut Option<ParticipationId>,
    broadcast_rx: &mut Option<broadcast::Receiver<Frame>>,
) -> QueryResponse {
    let mut repository = repository.lock().await;
    let kind = match request.kind {
        RequestKind::SignOnRequest { client_id, delta_protocol_version } => {
            if let Some(previous) = participation.take() {
                repository.sign_off(&previous);
            }
            let (pid, rx) = repository.sign_on(&client_id, &delta_protocol_version);
            *participation = Some(pid.clone());
            *broadcast_rx = Some(rx);
            ResponseKind::SignOnResponse { participation_id: pid }
        }
        RequestKind::SignOffRequest {} => {
            if let Some(pid) = participation.take() {
                repository.sign_off(&pid);
            }
            *broadcast_rx = None;
            ResponseKind::SignOffResponse {}
        }
        RequestKind::ListPartitionsRequest {} => ResponseKind::ListPartitionsResponse {
            partitions: repository.partitions(),
        },
    };
    QueryResponse::new(request.query_id, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DELTA_PROTOCOL_VERSION;
    use crate::test_support::{documentation_partition, shared_registry};
    use arbor_core::{serialize_subtree, NodeGraph};
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.first_sequence_number, 0);
    }

    #[test]
    fn test_server_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ARBOR_BIND_ADDR", "0.0.0.0:8080"),
            ("ARBOR_BROADCAST_CAPACITY", "512"),
            ("ARBOR_FIRST_SEQUENCE_NUMBER", "1"),
        ]
        .into();
        let config = ServerConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(
            config,
            ServerConfig {
                bind_addr: "0.0.0.0:8080".into(),
                broadcast_capacity: 512,
                first_sequence_number: 1,
            }
        );
    }

    #[test]
    fn test_server_config_ignores_invalid_numbers() {
        let config = ServerConfig::from_lookup(|name| {
            (name == "ARBOR_BROADCAST_CAPACITY").then(|| "lots".to_string())
        });
        assert_eq!(config, ServerConfig::default());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RepositoryServer::with_defaults(shared_registry());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_answer_tracks_participation() {
        let server = RepositoryServer::with_defaults(shared_registry());
        let mut participation = None;
        let mut rx = None;

        let response = answer(
            QueryRequest::sign_on("q-1", "client-a"),
            &server.repository,
            &mut participation,
            &mut rx,
        )
        .await;
        assert_eq!(response.query_id, "q-1");
        let ResponseKind::SignOnResponse { participation_id } = response.kind else {
            panic!("expected SignOnResponse");
        };
        assert_eq!(participation.as_deref(), Some(participation_id.as_str()));
        assert!(rx.is_some());
        assert_eq!(server.stats().await.active_sessions, 1);

        let response = answer(
            QueryRequest::new("q-2", RequestKind::SignOffRequest {}),
            &server.repository,
            &mut participation,
            &mut rx,
        )
        .await;
        assert_eq!(response.kind, ResponseKind::SignOffResponse {});
        assert!(participation.is_none());
        assert!(rx.is_none());
        assert_eq!(server.stats().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_answer_lists_seeded_partitions() {
        let server = RepositoryServer::with_defaults(shared_registry());
        let mut graph = NodeGraph::new();
        let partition = documentation_partition(&mut graph, "(some text)");
        server.seed(&serialize_subtree(&graph, partition)).await.unwrap();

        let response = answer(
            QueryRequest::new("q", RequestKind::ListPartitionsRequest {}),
            &server.repository,
            &mut None,
            &mut None,
        )
        .await;
        let ResponseKind::ListPartitionsResponse { partitions } = response.kind else {
            panic!("expected ListPartitionsResponse");
        };
        assert_eq!(partitions.root_ids(), vec!["partition"]);
        assert_eq!(partitions.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_sign_on_replaces_participation() {
        let server = RepositoryServer::with_defaults(shared_registry());
        let mut participation = None;
        let mut rx = None;
        for query in ["q-1", "q-2"] {
            answer(
                QueryRequest::new(
                    query,
                    RequestKind::SignOnRequest {
                        client_id: "client-a".into(),
                        delta_protocol_version: DELTA_PROTOCOL_VERSION.into(),
                    },
                ),
                &server.repository,
                &mut participation,
                &mut rx,
            )
            .await;
        }
        assert_eq!(server.stats().await.active_sessions, 1);
    }
}
