//! WebSocket delta client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Sign-on/sign-off and partition queries with timeouts
//! - Local edits turned into commands through the graph's delta receiver
//! - Ordered application of incoming events to the local replica
//! - Commit notification for sent commands
//!
//! ```text
//!  edit(|replica| ...) ──Delta──▸ outbox ──Command──▸ writer task ──▸ ws
//!  ws ──▸ reader task ──Event──▸ OrderingBuffer ──▸ event_to_delta ──▸ replica
//! ```
//!
//! Events are ordered per originating participation, since the repository
//! numbers each participation's events independently.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use arbor_core::{Chunk, GraphError, NodeGraph};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use uuid::Uuid;

use crate::ordering::{OrderingBuffer, OrderingViolation};
use crate::protocol::{
    Command, CommandId, CommandKind, Event, Message, ParticipationId, ProtocolError, QueryId, QueryRequest,
    QueryResponse, RequestKind, ResponseKind,
};
use crate::replica::{Replica, ReplicaError};
use crate::translate::{delta_to_command, event_to_delta, TranslationError};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Repository URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Sent with the sign-on request
    pub client_id: String,
    /// Sequence number of the first event expected from each participation
    pub first_sequence_number: u64,
    pub query_timeout: Duration,
    /// Capacity of the outgoing and notification channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            client_id: "arbor-client".to_string(),
            first_sequence_number: 0,
            query_timeout: Duration::from_secs(5),
            channel_capacity: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// An event was processed in order. `own` marks events caused by this
    /// client's commands.
    EventApplied {
        sequence_number: u64,
        kind: &'static str,
        own: bool,
    },
    /// An incoming message could not be processed.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Not signed on")]
    NotSignedOn,

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Ordering(#[from] OrderingViolation),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error("Query {0} timed out")]
    QueryTimeout(QueryId),

    #[error("Unexpected {kind} in answer to query {query_id}")]
    UnexpectedResponse { query_id: QueryId, kind: &'static str },

    #[error("Command {0} was dropped before its event arrived")]
    CommitDropped(CommandId),
}

/// A sent command awaiting its event.
#[derive(Debug)]
pub struct PendingCommand {
    command_id: CommandId,
    committed: oneshot::Receiver<u64>,
}

impl PendingCommand {
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Wait for the event caused by this command; yields its sequence
    /// number. Fails if the client disconnects first.
    pub async fn committed(self) -> Result<u64, ClientError> {
        let Self { command_id, committed } = self;
        committed.await.map_err(|_| ClientError::CommitDropped(command_id))
    }
}

struct PendingEntry {
    locally_applied: bool,
    committed: oneshot::Sender<u64>,
}

type EventBuffer = OrderingBuffer<Event, fn(&Event) -> u64>;

fn sequence_number(event: &Event) -> u64 {
    event.sequence_number
}

/// Buffered events per origin between two stall warnings.
const STALL_WARNING_INTERVAL: usize = 64;

fn stall_warning_due(pending: usize) -> bool {
    pending > 0 && pending % STALL_WARNING_INTERVAL == 0
}

/// State shared between the client handle and its reader task.
struct Shared {
    replica: Replica,
    outbox: Arc<std::sync::Mutex<Vec<Command>>>,
    participation_id: Option<ParticipationId>,
    ordering: HashMap<ParticipationId, EventBuffer>,
    first_sequence_number: u64,
    pending_commands: HashMap<CommandId, PendingEntry>,
    pending_queries: HashMap<QueryId, oneshot::Sender<QueryResponse>>,
}

impl Shared {
    /// Take over `replica`, recording every delta it emits as a command.
    fn new(mut replica: Replica, first_sequence_number: u64) -> Self {
        let outbox = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = outbox.clone();
        replica.graph_mut().set_receiver(move |graph: &NodeGraph, delta: &arbor_core::Delta| {
            let command = delta_to_command(graph, delta, format!("cmd-{}", Uuid::new_v4()));
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(command);
        });
        Self {
            replica,
            outbox,
            participation_id: None,
            ordering: HashMap::new(),
            first_sequence_number,
            pending_commands: HashMap::new(),
            pending_queries: HashMap::new(),
        }
    }

    fn take_outbox(&mut self) -> Vec<Command> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn register_command(&mut self, command_id: &str, locally_applied: bool) -> PendingCommand {
        let (committed_tx, committed_rx) = oneshot::channel();
        self.pending_commands.insert(
            command_id.to_string(),
            PendingEntry {
                locally_applied,
                committed: committed_tx,
            },
        );
        PendingCommand {
            command_id: command_id.to_string(),
            committed: committed_rx,
        }
    }

    fn signed_on(&mut self, participation_id: ParticipationId) {
        self.participation_id = Some(participation_id);
        self.ordering.clear();
    }

    /// Drop everything tied to the current connection.
    fn reset(&mut self) {
        self.participation_id = None;
        self.ordering.clear();
        self.pending_commands.clear();
        self.pending_queries.clear();
    }

    /// Admit one event and process every event that became ready.
    fn receive_event(&mut self, event: Event) -> Vec<ClientEvent> {
        let origin = event
            .origin_commands
            .first()
            .map(|o| o.participation_id.clone())
            .unwrap_or_default();
        let first = self.first_sequence_number;
        let buffer = self
            .ordering
            .entry(origin.clone())
            .or_insert_with(|| OrderingBuffer::new(sequence_number as fn(&Event) -> u64, first));
        let admitted = buffer.admit(event);
        if admitted.as_ref().is_ok_and(Vec::is_empty) && stall_warning_due(buffer.pending_len()) {
            log::warn!(
                "Events from {origin} stalled: waiting for #{} with {} buffered",
                buffer.next_expected(),
                buffer.pending_len()
            );
        }

        match admitted {
            Ok(ready) => ready.into_iter().map(|event| self.process(event)).collect(),
            Err(violation) => {
                log::error!("Rejected event: {violation}");
                vec![ClientEvent::Failed(ClientError::from(violation).to_string())]
            }
        }
    }

    fn process(&mut self, event: Event) -> ClientEvent {
        let own_command = self
            .participation_id
            .as_deref()
            .and_then(|pid| event.origin_for(pid))
            .map(|origin| origin.command_id.clone());
        let pending = own_command
            .as_deref()
            .and_then(|command_id| self.pending_commands.remove(command_id));

        // Structural edits made locally are already in the replica.
        let already_applied =
            pending.as_ref().is_some_and(|p| p.locally_applied) && !event.kind.is_idempotent();
        let result = if already_applied {
            log::debug!("Event #{} echoes a local {}", event.sequence_number, event.kind.kind());
            Ok(())
        } else {
            self.apply(&event)
        };

        if let Some(entry) = pending {
            let _ = entry.committed.send(event.sequence_number);
        }

        match result {
            Ok(()) => ClientEvent::EventApplied {
                sequence_number: event.sequence_number,
                kind: event.kind.kind(),
                own: own_command.is_some(),
            },
            Err(e) => {
                log::error!("Failed to apply event #{} ({}): {e}", event.sequence_number, event.kind.kind());
                ClientEvent::Failed(e.to_string())
            }
        }
    }

    fn apply(&mut self, event: &Event) -> Result<(), ClientError> {
        let delta = event_to_delta(event, &mut self.replica)?;
        self.replica.apply(&delta)?;
        Ok(())
    }

    fn answer(&mut self, response: QueryResponse) {
        match self.pending_queries.remove(&response.query_id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => log::warn!("Response to unknown query {}", response.query_id),
        }
    }
}

/// Outgoing frame plus acknowledgement of its transport write.
type Outgoing = (WsMessage, oneshot::Sender<Result<(), tungstenite::Error>>);

/// The delta client.
pub struct DeltaClient {
    config: ClientConfig,
    shared: Arc<Mutex<Shared>>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Outgoing>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl DeltaClient {
    /// Create a client operating on `replica`.
    pub fn new(config: ClientConfig, replica: Replica) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));
        let shared = Shared::new(replica, config.first_sequence_number);
        Self {
            config,
            shared: Arc::new(Mutex::new(shared)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the notification receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the repository.
    ///
    /// Spawns background tasks for reading and writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to the WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(self.config.channel_capacity.max(1));
        tokio::spawn(async move {
            while let Some((frame, ack)) = out_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                let result = ws_writer.send(frame).await;
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed || closing {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: process incoming frames
        let shared = self.shared.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        for notification in handle_frame(text.as_str(), &shared).await {
                            notify(&event_tx, notification);
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        log::warn!("WebSocket read failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            shared.lock().await.reset();
            *state.write().await = ConnectionState::Disconnected;
            notify(&event_tx, ClientEvent::Disconnected);
        });

        *self.state.write().await = ConnectionState::Connected;
        notify(&self.event_tx, ClientEvent::Connected);
        log::info!("Connected to {}", self.config.url);
        Ok(())
    }

    /// Send one message. Resolves once the frame is written to the
    /// transport, not when the repository has acted on it.
    pub async fn send_message(&self, message: Message) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let frame = message.encode()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send((WsMessage::Text(frame.into()), ack_tx))
            .await
            .map_err(|_| ClientError::NotConnected)?;
        ack_rx.await.map_err(|_| ClientError::NotConnected)??;
        Ok(())
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, ClientError> {
        let query_id = request.query_id.clone();
        let (tx, rx) = oneshot::channel();
        self.shared.lock().await.pending_queries.insert(query_id.clone(), tx);

        if let Err(e) = self.send_message(request.into()).await {
            self.shared.lock().await.pending_queries.remove(&query_id);
            return Err(e);
        }
        match timeout(self.config.query_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                self.shared.lock().await.pending_queries.remove(&query_id);
                Err(ClientError::QueryTimeout(query_id))
            }
        }
    }

    /// Sign on and remember the participation id.
    pub async fn sign_on(&self, query_id: impl Into<QueryId>) -> Result<ParticipationId, ClientError> {
        let request = QueryRequest::sign_on(query_id, self.config.client_id.clone());
        let response = self.query(request).await?;
        match response.kind {
            ResponseKind::SignOnResponse { participation_id } => {
                self.shared.lock().await.signed_on(participation_id.clone());
                log::info!("Signed on as {participation_id}");
                Ok(participation_id)
            }
            other => Err(ClientError::UnexpectedResponse {
                query_id: response.query_id,
                kind: other.kind(),
            }),
        }
    }

    pub async fn sign_off(&self, query_id: impl Into<QueryId>) -> Result<(), ClientError> {
        let response = self.query(QueryRequest::new(query_id, RequestKind::SignOffRequest {})).await?;
        match response.kind {
            ResponseKind::SignOffResponse {} => {
                self.shared.lock().await.participation_id = None;
                Ok(())
            }
            other => Err(ClientError::UnexpectedResponse {
                query_id: response.query_id,
                kind: other.kind(),
            }),
        }
    }

    /// The repository's current partitions.
    pub async fn list_partitions(&self, query_id: impl Into<QueryId>) -> Result<Chunk, ClientError> {
        let response = self
            .query(QueryRequest::new(query_id, RequestKind::ListPartitionsRequest {}))
            .await?;
        match response.kind {
            ResponseKind::ListPartitionsResponse { partitions } => Ok(partitions),
            other => Err(ClientError::UnexpectedResponse {
                query_id: response.query_id,
                kind: other.kind(),
            }),
        }
    }

    /// Edit the local replica and send a command for every resulting delta.
    ///
    /// Commands for deltas emitted before `f` fails are still sent, since
    /// the replica already reflects them.
    pub async fn edit<F>(&self, f: F) -> Result<Vec<PendingCommand>, ClientError>
    where
        F: FnOnce(&mut Replica) -> Result<(), ReplicaError>,
    {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let (outcome, commands, pending) = {
            let mut shared = self.shared.lock().await;
            if shared.participation_id.is_none() {
                return Err(ClientError::NotSignedOn);
            }
            let outcome = f(&mut shared.replica);
            let commands = shared.take_outbox();
            let pending: Vec<PendingCommand> = commands
                .iter()
                .map(|c| shared.register_command(&c.command_id, true))
                .collect();
            (outcome, commands, pending)
        };

        log::debug!("Local edit produced {} command(s)", commands.len());
        for command in commands {
            self.send_message(command.into()).await?;
        }
        outcome?;
        Ok(pending)
    }

    /// Send a command that was not applied locally; its event is applied
    /// like any other.
    pub async fn send_command(&self, kind: CommandKind) -> Result<PendingCommand, ClientError> {
        let command = Command::new(format!("cmd-{}", Uuid::new_v4()), kind);
        let pending = {
            let mut shared = self.shared.lock().await;
            if shared.participation_id.is_none() {
                return Err(ClientError::NotSignedOn);
            }
            shared.register_command(&command.command_id, false)
        };
        self.send_message(command.into()).await?;
        Ok(pending)
    }

    /// Close the connection. Afterwards every send fails with
    /// [`ClientError::NotConnected`].
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.take().ok_or(ClientError::NotConnected)?;
        *self.state.write().await = ConnectionState::Disconnected;
        self.shared.lock().await.reset();

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send((WsMessage::Close(None), ack_tx))
            .await
            .map_err(|_| ClientError::NotConnected)?;
        drop(tx);
        ack_rx.await.map_err(|_| ClientError::NotConnected)??;
        log::info!("Disconnected from {}", self.config.url);
        Ok(())
    }

    /// Run `f` against the local replica.
    pub async fn with_replica<R>(&self, f: impl FnOnce(&Replica) -> R) -> R {
        f(&self.shared.lock().await.replica)
    }

    pub async fn participation_id(&self) -> Option<ParticipationId> {
        self.shared.lock().await.participation_id.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Number of sent commands whose event has not arrived yet.
    pub async fn pending_commands(&self) -> usize {
        self.shared.lock().await.pending_commands.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

async fn handle_frame(text: &str, shared: &Mutex<Shared>) -> Vec<ClientEvent> {
    match Message::decode(text) {
        Ok(Message::Event(event)) => shared.lock().await.receive_event(event),
        Ok(Message::Response(response)) => {
            shared.lock().await.answer(response);
            Vec::new()
        }
        Ok(other) => {
            log::warn!("Ignoring unexpected {} from repository", other.kind());
            Vec::new()
        }
        Err(e) => {
            log::error!("Undecodable frame from repository: {e}");
            vec![ClientEvent::Failed(e.to_string())]
        }
    }
}

fn notify(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if let Err(e) = event_tx.try_send(event) {
        log::debug!("Client notification dropped: {e}");
    }
}
