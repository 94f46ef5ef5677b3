//! # portal-chat — Real-time messaging layer for the school portal
//!
//! Dual-channel chat: the durable message store (portal backend) is the
//! authoritative record, while a WebSocket relay delivers the same messages
//! with low latency to whoever is online. The client reconciles both into
//! one deduplicated, time-ordered view.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   create/fetch    ┌───────────────┐
//! │ ChatSession│ ◄───────────────► │ MessageStore  │
//! │ (per user) │                   │ (authoritative)│
//! └─────┬──────┘                   └───────────────┘
//!       │
//! ┌─────┴──────┐    WebSocket      ┌───────────────┐
//! │ ChatClient │ ◄───────────────► │ Relay         │
//! │            │   Binary frames   │ (room fan-out)│
//! └─────┬──────┘                   └───────────────┘
//!       │
//!       ▼
//! ┌──────────────┐
//! │ Conversation │  merge: dedup by persisted id / content
//! │ (reconciled) │  signature, sort by client timestamp
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames, message model, participant kinds
//! - [`rooms`] — Deterministic room addressing and relay-side fan-out
//! - [`codec`] — Optional symmetric payload obfuscation
//! - [`client`] — WebSocket client with bounded reconnect and pub/sub
//! - [`store`] — Durable-store contract plus an in-memory implementation
//! - [`reconcile`] — Merge of fetched history with live events
//! - [`session`] — Per-user orchestration of store + live channel
//! - [`relay`] — In-process WebSocket relay (dev and tests)

pub mod client;
pub mod codec;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod rooms;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use client::{ChatClient, ChatEvent, ClientConfig, ConnectionState, ReconnectPolicy};
pub use codec::{MessageCodec, UNREADABLE_PLACEHOLDER};
pub use protocol::{
    ChatError, ChatMessage, ClientIdentity, EventType, Frame, Participant, ParticipantKind,
};
pub use reconcile::{Conversation, ConversationState, DedupKey};
pub use relay::{Relay, RelayConfig, RelayStats};
pub use rooms::{direct_room_id, BroadcastGroup, RoleRoom, RoomManager};
pub use session::ChatSession;
pub use store::{InMemoryStore, InboxEntry, MessageStore};
