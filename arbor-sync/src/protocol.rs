//! JSON wire protocol for delta synchronization.
//!
//! Every frame is one flat JSON object discriminated by `messageKind`:
//! ```text
//! { "messageKind": "ChangeProperty", "commandId": "c-17",
//!   "node": "doc-1", "property": {...}, "newValue": "bye bye",
//!   "protocolMessages": [] }
//! ```
//!
//! Families:
//! - [`Command`]: client → repository, carries `commandId`
//! - [`Event`]: repository → every client, carries `sequenceNumber` and
//!   `originCommands`
//! - [`QueryRequest`] / [`QueryResponse`]: request/response pairs keyed by
//!   `queryId`
//!
//! Decoding dispatches on `messageKind` first; an unrecognized kind is a
//! [`ProtocolError::UnknownMessageKind`].

use arbor_core::{Chunk, MetaPointer, NodeId, ReferenceTarget};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DELTA_PROTOCOL_VERSION: &str = "2025.1";

pub type CommandId = String;
pub type ParticipationId = String;
pub type QueryId = String;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unrecognized messageKind: {0}")]
    UnknownMessageKind(String),

    #[error("Message has no messageKind")]
    MissingMessageKind,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Free-form annotation attached to any message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Correlates an event with a command that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSource {
    pub participation_id: ParticipationId,
    pub command_id: CommandId,
}

// ───────────────────────────────────────────────────────────────────
// Commands
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: CommandId,
    #[serde(flatten)]
    pub kind: CommandKind,
    #[serde(default)]
    pub protocol_messages: Vec<ProtocolMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageKind", rename_all_fields = "camelCase")]
pub enum CommandKind {
    AddPartition {
        new_partition: Chunk,
    },
    DeletePartition {
        deleted_partition: NodeId,
    },
    AddProperty {
        node: NodeId,
        property: MetaPointer,
        new_value: String,
    },
    ChangeProperty {
        node: NodeId,
        property: MetaPointer,
        new_value: String,
    },
    DeleteProperty {
        node: NodeId,
        property: MetaPointer,
    },
    AddChild {
        parent: NodeId,
        new_child: Chunk,
        containment: MetaPointer,
        index: usize,
    },
    DeleteChild {
        parent: NodeId,
        containment: MetaPointer,
        index: usize,
        deleted_child: NodeId,
    },
    AddReference {
        node: NodeId,
        reference: MetaPointer,
        index: usize,
        new_target: ReferenceTarget,
    },
    DeleteReference {
        node: NodeId,
        reference: MetaPointer,
        index: usize,
        deleted_target: ReferenceTarget,
    },
}

impl CommandKind {
    pub const KINDS: &'static [&'static str] = &[
        "AddPartition",
        "DeletePartition",
        "AddProperty",
        "ChangeProperty",
        "DeleteProperty",
        "AddChild",
        "DeleteChild",
        "AddReference",
        "DeleteReference",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddPartition { .. } => "AddPartition",
            Self::DeletePartition { .. } => "DeletePartition",
            Self::AddProperty { .. } => "AddProperty",
            Self::ChangeProperty { .. } => "ChangeProperty",
            Self::DeleteProperty { .. } => "DeleteProperty",
            Self::AddChild { .. } => "AddChild",
            Self::DeleteChild { .. } => "DeleteChild",
            Self::AddReference { .. } => "AddReference",
            Self::DeleteReference { .. } => "DeleteReference",
        }
    }
}

impl Command {
    pub fn new(command_id: impl Into<CommandId>, kind: CommandKind) -> Self {
        Self {
            command_id: command_id.into(),
            kind,
            protocol_messages: Vec::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub sequence_number: u64,
    pub origin_commands: Vec<CommandSource>,
    #[serde(default)]
    pub protocol_messages: Vec<ProtocolMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageKind", rename_all_fields = "camelCase")]
pub enum EventKind {
    PartitionAdded {
        new_partition: Chunk,
    },
    PartitionDeleted {
        deleted_partition: NodeId,
    },
    PropertyAdded {
        node: NodeId,
        property: MetaPointer,
        new_value: String,
    },
    PropertyChanged {
        node: NodeId,
        property: MetaPointer,
        new_value: String,
        old_value: String,
    },
    PropertyDeleted {
        node: NodeId,
        property: MetaPointer,
        old_value: String,
    },
    ChildAdded {
        parent: NodeId,
        new_child: Chunk,
        containment: MetaPointer,
        index: usize,
    },
    ChildDeleted {
        parent: NodeId,
        containment: MetaPointer,
        index: usize,
        deleted_child: NodeId,
    },
    ReferenceAdded {
        node: NodeId,
        reference: MetaPointer,
        index: usize,
        new_target: ReferenceTarget,
    },
    ReferenceDeleted {
        node: NodeId,
        reference: MetaPointer,
        index: usize,
        deleted_target: ReferenceTarget,
    },
}

impl EventKind {
    pub const KINDS: &'static [&'static str] = &[
        "PartitionAdded",
        "PartitionDeleted",
        "PropertyAdded",
        "PropertyChanged",
        "PropertyDeleted",
        "ChildAdded",
        "ChildDeleted",
        "ReferenceAdded",
        "ReferenceDeleted",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PartitionAdded { .. } => "PartitionAdded",
            Self::PartitionDeleted { .. } => "PartitionDeleted",
            Self::PropertyAdded { .. } => "PropertyAdded",
            Self::PropertyChanged { .. } => "PropertyChanged",
            Self::PropertyDeleted { .. } => "PropertyDeleted",
            Self::ChildAdded { .. } => "ChildAdded",
            Self::ChildDeleted { .. } => "ChildDeleted",
            Self::ReferenceAdded { .. } => "ReferenceAdded",
            Self::ReferenceDeleted { .. } => "ReferenceDeleted",
        }
    }

    /// Whether applying this event twice leaves the same state as applying
    /// it once. Only property assignments qualify; list and tree insertions
    /// do not.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::PropertyAdded { .. } | Self::PropertyChanged { .. } | Self::PropertyDeleted { .. }
        )
    }
}

impl Event {
    pub fn new(kind: EventKind, sequence_number: u64, origin_commands: Vec<CommandSource>) -> Self {
        Self {
            kind,
            sequence_number,
            origin_commands,
            protocol_messages: Vec::new(),
        }
    }

    /// The origin entry naming `participation_id`, if any.
    pub fn origin_for(&self, participation_id: &str) -> Option<&CommandSource> {
        self.origin_commands
            .iter()
            .find(|o| o.participation_id == participation_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Queries
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_id: QueryId,
    #[serde(flatten)]
    pub kind: RequestKind,
    #[serde(default)]
    pub protocol_messages: Vec<ProtocolMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageKind", rename_all_fields = "camelCase")]
pub enum RequestKind {
    SignOnRequest {
        client_id: String,
        delta_protocol_version: String,
    },
    SignOffRequest {},
    ListPartitionsRequest {},
}

impl RequestKind {
    pub const KINDS: &'static [&'static str] =
        &["SignOnRequest", "SignOffRequest", "ListPartitionsRequest"];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignOnRequest { .. } => "SignOnRequest",
            Self::SignOffRequest {} => "SignOffRequest",
            Self::ListPartitionsRequest {} => "ListPartitionsRequest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub query_id: QueryId,
    #[serde(flatten)]
    pub kind: ResponseKind,
    #[serde(default)]
    pub protocol_messages: Vec<ProtocolMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageKind", rename_all_fields = "camelCase")]
pub enum ResponseKind {
    SignOnResponse { participation_id: ParticipationId },
    SignOffResponse {},
    ListPartitionsResponse { partitions: Chunk },
}

impl ResponseKind {
    pub const KINDS: &'static [&'static str] =
        &["SignOnResponse", "SignOffResponse", "ListPartitionsResponse"];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignOnResponse { .. } => "SignOnResponse",
            Self::SignOffResponse {} => "SignOffResponse",
            Self::ListPartitionsResponse { .. } => "ListPartitionsResponse",
        }
    }
}

impl QueryRequest {
    pub fn new(query_id: impl Into<QueryId>, kind: RequestKind) -> Self {
        Self {
            query_id: query_id.into(),
            kind,
            protocol_messages: Vec::new(),
        }
    }

    pub fn sign_on(query_id: impl Into<QueryId>, client_id: impl Into<String>) -> Self {
        Self::new(
            query_id,
            RequestKind::SignOnRequest {
                client_id: client_id.into(),
                delta_protocol_version: DELTA_PROTOCOL_VERSION.to_string(),
            },
        )
    }
}

impl QueryResponse {
    pub fn new(query_id: impl Into<QueryId>, kind: ResponseKind) -> Self {
        Self {
            query_id: query_id.into(),
            kind,
            protocol_messages: Vec::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFamily {
    Command,
    Event,
    Request,
    Response,
}

impl MessageFamily {
    /// Family of a `messageKind` value, or `None` if the kind is unknown.
    pub fn of(kind: &str) -> Option<Self> {
        if CommandKind::KINDS.contains(&kind) {
            Some(Self::Command)
        } else if EventKind::KINDS.contains(&kind) {
            Some(Self::Event)
        } else if RequestKind::KINDS.contains(&kind) {
            Some(Self::Request)
        } else if ResponseKind::KINDS.contains(&kind) {
            Some(Self::Response)
        } else {
            None
        }
    }
}

/// Any frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Event(Event),
    Request(QueryRequest),
    Response(QueryResponse),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(c) => c.kind.kind(),
            Self::Event(e) => e.kind.kind(),
            Self::Request(r) => r.kind.kind(),
            Self::Response(r) => r.kind.kind(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("messageKind")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingMessageKind)?
            .to_string();
        let family =
            MessageFamily::of(&kind).ok_or_else(|| ProtocolError::UnknownMessageKind(kind.clone()))?;
        let malformed = |e: serde_json::Error| ProtocolError::Malformed(format!("{kind}: {e}"));

        Ok(match family {
            MessageFamily::Command => Self::Command(serde_json::from_value(value).map_err(malformed)?),
            MessageFamily::Event => Self::Event(serde_json::from_value(value).map_err(malformed)?),
            MessageFamily::Request => Self::Request(serde_json::from_value(value).map_err(malformed)?),
            MessageFamily::Response => Self::Response(serde_json::from_value(value).map_err(malformed)?),
        })
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<QueryRequest> for Message {
    fn from(request: QueryRequest) -> Self {
        Self::Request(request)
    }
}

impl From<QueryResponse> for Message {
    fn from(response: QueryResponse) -> Self {
        Self::Response(response)
    }
}
