//! # arbor-sync: delta synchronization for Arbor model repositories
//!
//! Keeps replicas of a shared node graph consistent through a central
//! repository over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Command (JSON)   ┌──────────────────┐
//! │ DeltaClient  │ ─────────────────▸ │ RepositoryServer │
//! │ (per client) │ ◂───────────────── │ (central)        │
//! └──────┬───────┘   Event (JSON)     └────────┬─────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                    ┌──────────────────┐
//! │ Replica      │                    │ Repository       │
//! │ (local)      │                    │ sequencing +     │
//! └──────────────┘                    │ authority        │
//!                                     └────────┬─────────┘
//!                                              │
//!                                     ┌────────┴─────────┐
//!                                     │ EventBroadcast   │
//!                                     │ (fan-out)        │
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages keyed by `messageKind`
//! - [`ordering`]: monotone priority buffer for in-order event delivery
//! - [`id_mapping`]: node id resolution within one replica
//! - [`replica`]: node graph plus id mapping
//! - [`translate`]: Delta ⇄ Command ⇄ Event conversion
//! - [`broadcast`]: event fan-out with backpressure
//! - [`repository`]: participations, sequencing, authoritative replica
//! - [`server`]: WebSocket repository server
//! - [`client`]: WebSocket delta client

pub mod broadcast;
pub mod client;
pub mod id_mapping;
pub mod ordering;
pub mod protocol;
pub mod replica;
pub mod repository;
pub mod server;
pub mod translate;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, EventBroadcast};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, DeltaClient, PendingCommand};
pub use id_mapping::{IdMapping, ResolutionError};
pub use ordering::{accept, OrderingBuffer, OrderingViolation};
pub use protocol::{
    Command, CommandKind, CommandSource, Event, EventKind, Message, ProtocolError, ProtocolMessage, QueryRequest,
    QueryResponse, RequestKind, ResponseKind, DELTA_PROTOCOL_VERSION,
};
pub use replica::{Replica, ReplicaError};
pub use repository::{Participation, Repository, RepositoryError};
pub use server::{RepositoryServer, ServerConfig, ServerStats};
pub use translate::{
    command_to_event, delta_to_command, event_to_delta, NoPriorState, PriorState, TranslationError,
    UNKNOWN_OLD_VALUE,
};
