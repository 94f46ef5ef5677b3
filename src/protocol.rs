//! Wire protocol and message model for the portal chat layer.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬───────────┬──────────┐
//! │ event    │ room     │ sender_id │ payload  │
//! │ 1 byte   │ variable │ variable  │ variable │
//! └──────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! The payload carries a bincode-encoded [`ChatMessage`] for message events,
//! a [`ClientIdentity`] for `Hello`, and is empty for joins and heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broadcast receiver ids carry this literal token instead of a user id.
pub const BROADCAST_RECEIVER_ID: &str = "broadcast";

/// Who a participant is within the portal.
///
/// The three `All*` variants are broadcast-group kinds: they appear only as
/// the receiver of a broadcast message, never as a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Admin,
    Teacher,
    Student,
    AllTeachers,
    AllStudents,
    All,
}

impl ParticipantKind {
    /// Whether this kind addresses a broadcast group rather than a person.
    pub fn is_broadcast_group(&self) -> bool {
        matches!(self, Self::AllTeachers | Self::AllStudents | Self::All)
    }

    /// Room token for broadcast-group kinds, `None` for individual kinds.
    pub fn room_token(&self) -> Option<&'static str> {
        match self {
            Self::AllTeachers => Some("teachers"),
            Self::AllStudents => Some("students"),
            Self::All => Some("all"),
            _ => None,
        }
    }
}

/// A person (or broadcast group) on one end of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub kind: ParticipantKind,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, kind: ParticipantKind, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            display_name: display_name.into(),
        }
    }

    /// The synthetic receiver for a broadcast to the given group kind.
    ///
    /// Returns `None` when `kind` is an individual kind.
    pub fn broadcast_group(kind: ParticipantKind) -> Option<Self> {
        let token = kind.room_token()?;
        Some(Self {
            id: BROADCAST_RECEIVER_ID.to_string(),
            kind,
            display_name: token.to_string(),
        })
    }
}

/// The central message entity.
///
/// Constructed client-side at send time with a client-assigned timestamp.
/// `persisted_id` is absent until the durable store accepts the create
/// request; the transient live-channel copy and the persisted copy of the
/// same message are collapsed by the reconciliation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Participant,
    pub receiver: Participant,
    pub subject: String,
    pub content: String,
    /// Owning-tenant (school) identifier.
    pub school: String,
    pub timestamp: DateTime<Utc>,
    /// Derived pairwise room id; `None` for broadcasts.
    pub chat_room_id: Option<String>,
    pub is_broadcast: bool,
    /// Assigned by the durable store on create.
    pub persisted_id: Option<String>,
    /// Opaque attachment reference; no binary transport in this layer.
    pub attachment_ref: Option<String>,
}

impl ChatMessage {
    /// Build a new one-to-one message, timestamped now.
    pub fn direct(
        sender: Participant,
        receiver: Participant,
        subject: impl Into<String>,
        content: impl Into<String>,
        school: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            receiver,
            subject: subject.into(),
            content: content.into(),
            school: school.into(),
            timestamp: Utc::now(),
            chat_room_id: None,
            is_broadcast: false,
            persisted_id: None,
            attachment_ref: None,
        }
    }

    /// Build a new broadcast message to the given group kind, timestamped now.
    ///
    /// Fails with [`ChatError::InvalidAddress`] when `audience` is not a
    /// broadcast-group kind.
    pub fn broadcast(
        sender: Participant,
        audience: ParticipantKind,
        subject: impl Into<String>,
        content: impl Into<String>,
        school: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let receiver = Participant::broadcast_group(audience).ok_or_else(|| {
            ChatError::InvalidAddress(format!("{audience:?} is not a broadcast group"))
        })?;
        Ok(Self {
            sender,
            receiver,
            subject: subject.into(),
            content: content.into(),
            school: school.into(),
            timestamp: Utc::now(),
            chat_room_id: None,
            is_broadcast: true,
            persisted_id: None,
            attachment_ref: None,
        })
    }

    /// A copy of this message with the given room id attached.
    pub fn with_room(&self, room_id: impl Into<String>) -> Self {
        Self {
            chat_room_id: Some(room_id.into()),
            ..self.clone()
        }
    }

    /// A copy of this message with different content (codec boundary).
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    /// A message with no sender id or no content is dropped before merge.
    pub fn is_well_formed(&self) -> bool {
        !self.sender.id.trim().is_empty() && !self.content.is_empty()
    }

    /// Content signature: identifies a message before the store assigns an id.
    ///
    /// Known approximation — two messages from the same sender with identical
    /// content in the same timestamp instant collide.
    pub fn signature(&self) -> String {
        format!("{}|{}|{}", self.sender.id, self.content, self.timestamp.to_rfc3339())
    }
}

/// Connection identity metadata, sent as the first frame after connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub user_id: String,
    pub kind: ParticipantKind,
    pub school: String,
}

/// Named live-channel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// Identity metadata, first frame after connect
    Hello = 1,
    /// Join a pairwise conversation room
    JoinChat = 2,
    /// Join a role broadcast room
    JoinRoleRoom = 3,
    /// Client → relay: one-to-one message
    SendMessage = 4,
    /// Client → relay: role broadcast
    SendBroadcast = 5,
    /// Relay → client: one-to-one message delivery
    ReceiveMessage = 6,
    /// Relay → client: broadcast delivery
    BroadcastMessage = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Top-level wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: EventType,
    /// Target room id or role-room token; empty when not room-addressed.
    pub room: String,
    pub sender_id: String,
    /// Event payload (varies by event type).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a hello frame carrying connection identity.
    pub fn hello(identity: &ClientIdentity) -> Result<Self, ChatError> {
        let payload = bincode::serde::encode_to_vec(identity, bincode::config::standard())
            .map_err(|e| ChatError::SerializationError(e.to_string()))?;
        Ok(Self {
            event: EventType::Hello,
            room: String::new(),
            sender_id: identity.user_id.clone(),
            payload,
        })
    }

    /// Create a join request for a pairwise room.
    pub fn join_chat(room: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            event: EventType::JoinChat,
            room: room.into(),
            sender_id: sender_id.into(),
            payload: Vec::new(),
        }
    }

    /// Create a join request for a role broadcast room.
    pub fn join_role_room(room: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            event: EventType::JoinRoleRoom,
            room: room.into(),
            sender_id: sender_id.into(),
            payload: Vec::new(),
        }
    }

    /// Create an outgoing one-to-one message frame.
    pub fn send_message(msg: &ChatMessage) -> Result<Self, ChatError> {
        Self::with_message(EventType::SendMessage, msg.chat_room_id.clone().unwrap_or_default(), msg)
    }

    /// Create an outgoing broadcast frame targeting a role room.
    pub fn send_broadcast(room: impl Into<String>, msg: &ChatMessage) -> Result<Self, ChatError> {
        Self::with_message(EventType::SendBroadcast, room, msg)
    }

    /// Create an incoming one-to-one delivery frame (relay → client).
    pub fn receive_message(msg: &ChatMessage) -> Result<Self, ChatError> {
        Self::with_message(EventType::ReceiveMessage, msg.chat_room_id.clone().unwrap_or_default(), msg)
    }

    /// Create an incoming broadcast delivery frame (relay → client).
    pub fn broadcast_message(room: impl Into<String>, msg: &ChatMessage) -> Result<Self, ChatError> {
        Self::with_message(EventType::BroadcastMessage, room, msg)
    }

    /// Create a ping frame.
    pub fn ping(sender_id: impl Into<String>) -> Self {
        Self {
            event: EventType::Ping,
            room: String::new(),
            sender_id: sender_id.into(),
            payload: Vec::new(),
        }
    }

    /// Create a pong frame.
    pub fn pong(sender_id: impl Into<String>) -> Self {
        Self {
            event: EventType::Pong,
            room: String::new(),
            sender_id: sender_id.into(),
            payload: Vec::new(),
        }
    }

    fn with_message(
        event: EventType,
        room: impl Into<String>,
        msg: &ChatMessage,
    ) -> Result<Self, ChatError> {
        let payload = bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map_err(|e| ChatError::SerializationError(e.to_string()))?;
        Ok(Self {
            event,
            room: room.into(),
            sender_id: msg.sender.id.clone(),
            payload,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ChatError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ChatError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChatError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ChatError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the embedded [`ChatMessage`] from a message-bearing frame.
    pub fn message(&self) -> Result<ChatMessage, ChatError> {
        match self.event {
            EventType::SendMessage
            | EventType::SendBroadcast
            | EventType::ReceiveMessage
            | EventType::BroadcastMessage => {}
            other => {
                return Err(ChatError::MalformedEvent(format!(
                    "{other:?} frame carries no message"
                )))
            }
        }
        let (msg, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ChatError::MalformedEvent(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the embedded [`ClientIdentity`] from a hello frame.
    pub fn identity(&self) -> Result<ClientIdentity, ChatError> {
        if self.event != EventType::Hello {
            return Err(ChatError::MalformedEvent(format!(
                "{:?} frame carries no identity",
                self.event
            )));
        }
        let (id, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ChatError::MalformedEvent(e.to_string()))?;
        Ok(id)
    }
}

/// Errors raised by the chat layer.
#[derive(Debug, Clone)]
pub enum ChatError {
    /// A participant id was missing or empty.
    InvalidAddress(String),
    /// A frame emission was attempted while the transport is down.
    TransportUnavailable,
    /// Connection (re)establishment gave up after bounded attempts.
    ConnectionFailed(String),
    /// The codec could not reverse a payload.
    DecodeFailure(String),
    /// A live event missing required fields; dropped, never merged.
    MalformedEvent(String),
    /// A durable-store round trip failed.
    FetchFailure(String),
    /// The durable store has no record with the given id.
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddress(e) => write!(f, "Invalid address: {e}"),
            Self::TransportUnavailable => write!(f, "Transport unavailable"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::DecodeFailure(e) => write!(f, "Decode failure: {e}"),
            Self::MalformedEvent(e) => write!(f, "Malformed event: {e}"),
            Self::FetchFailure(e) => write!(f, "Fetch failure: {e}"),
            Self::NotFound(e) => write!(f, "Not found: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ChatError {}
