//! Repository-side session management and command sequencing.
//!
//! ```text
//!  Command (from participation P)
//!     │  next sequence number of P
//!     ▼
//!  command_to_event ──▸ Event{seq, originCommands=[P, commandId]}
//!     │                      │
//!     ▼                      ▼
//!  authoritative replica   EventBroadcast ──▸ every participation
//! ```
//!
//! The repository owns no transport. The server holds it behind a mutex and
//! calls into it once per decoded message, which serializes command
//! handling for the whole repository.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_core::{Chunk, LanguageRegistry};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, EventBroadcast, Frame};
use crate::protocol::{Command, Event, ParticipationId, ProtocolError, DELTA_PROTOCOL_VERSION};
use crate::replica::{Replica, ReplicaError};
use crate::translate::{command_to_event, event_to_delta};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Unknown participation: {0}")]
    UnknownParticipation(ParticipationId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One signed-on client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participation {
    pub participation_id: ParticipationId,
    pub client_id: String,
    pub next_sequence_number: u64,
}

pub struct Repository {
    replica: Replica,
    participations: HashMap<ParticipationId, Participation>,
    broadcast: EventBroadcast,
    first_sequence_number: u64,
    events_committed: u64,
}

impl Repository {
    pub fn new(registry: Arc<LanguageRegistry>, broadcast_capacity: usize, first_sequence_number: u64) -> Self {
        Self {
            replica: Replica::new(registry),
            participations: HashMap::new(),
            broadcast: EventBroadcast::new(broadcast_capacity),
            first_sequence_number,
            events_committed: 0,
        }
    }

    /// Load initial partitions into the authoritative replica.
    pub fn seed(&mut self, chunk: &Chunk) -> Result<(), ReplicaError> {
        let roots = self.replica.seed(chunk)?;
        log::info!("Repository seeded with {} partition(s)", roots.len());
        Ok(())
    }

    /// Open a participation and subscribe it to the event stream.
    ///
    /// A differing protocol version is logged but accepted.
    pub fn sign_on(&mut self, client_id: &str, protocol_version: &str) -> (ParticipationId, broadcast::Receiver<Frame>) {
        if protocol_version != DELTA_PROTOCOL_VERSION {
            log::warn!(
                "Client {client_id} speaks delta protocol {protocol_version}, repository speaks {DELTA_PROTOCOL_VERSION}"
            );
        }
        let participation_id = format!("participation-{}", Uuid::new_v4());
        self.participations.insert(
            participation_id.clone(),
            Participation {
                participation_id: participation_id.clone(),
                client_id: client_id.to_string(),
                next_sequence_number: self.first_sequence_number,
            },
        );
        log::info!("Client {client_id} signed on as {participation_id}");
        (participation_id, self.broadcast.subscribe())
    }

    /// Close a participation. Returns whether it existed.
    pub fn sign_off(&mut self, participation_id: &str) -> bool {
        match self.participations.remove(participation_id) {
            Some(p) => {
                log::info!("Client {} signed off ({participation_id})", p.client_id);
                true
            }
            None => false,
        }
    }

    /// Sequence, apply and broadcast one command.
    ///
    /// Failing to apply the event to the authoritative replica does not
    /// stop the broadcast; the event is the commit.
    pub fn handle_command(&mut self, participation_id: &str, command: Command) -> Result<Event, RepositoryError> {
        let participation = self
            .participations
            .get_mut(participation_id)
            .ok_or_else(|| RepositoryError::UnknownParticipation(participation_id.to_string()))?;
        let sequence_number = participation.next_sequence_number;
        participation.next_sequence_number += 1;

        log::debug!(
            "Command {} ({}) from {participation_id} → event #{sequence_number}",
            command.command_id,
            command.kind.kind()
        );
        let event = command_to_event(command, participation_id, sequence_number, &self.replica);

        match event_to_delta(&event, &mut self.replica) {
            Ok(delta) => {
                if let Err(e) = self.replica.apply(&delta) {
                    log::debug!("Authoritative replica rejected {}: {e}", delta.kind());
                }
            }
            Err(e) => log::debug!("Authoritative replica cannot resolve {}: {e}", event.kind.kind()),
        }

        let reached = self.broadcast.broadcast(&event)?;
        self.events_committed += 1;
        log::debug!("Event #{sequence_number} broadcast to {reached} participation(s)");
        Ok(event)
    }

    /// Every partition of the authoritative replica.
    pub fn partitions(&self) -> Chunk {
        self.replica.snapshot()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn participation(&self, participation_id: &str) -> Option<&Participation> {
        self.participations.get(participation_id)
    }

    pub fn session_count(&self) -> usize {
        self.participations.len()
    }

    pub fn events_committed(&self) -> u64 {
        self.events_committed
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }
}
