//! WebSocket chat client: connection lifecycle plus domain pub/sub.
//!
//! Provides:
//! - One live connection per client, lazily created, idempotent `connect`
//! - Bounded automatic reconnection with exponential backoff
//! - Room joins (pairwise and role rooms), replayed after reconnect
//! - Message/broadcast emission with the silent-no-op-when-offline rule
//!   (the durable store write is the source of truth; the live channel is
//!   a latency optimization)
//! - Fan-out subscription streams for incoming messages and broadcasts

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::codec::MessageCodec;
use crate::protocol::{ChatError, ChatMessage, ClientIdentity, EventType, Frame};
use crate::rooms::{direct_room_id, RoleRoom};

/// Client connection state. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Bounded reconnection gave up; an explicit `connect()` resumes.
    Failed,
}

/// Lifecycle events emitted by the client.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Connected,
    Disconnected,
    /// Automatic reconnection exhausted its attempt budget.
    ReconnectFailed(String),
}

/// Bounded reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9900`.
    pub url: String,
    /// Identity metadata sent as the first frame; absent identity is legal.
    pub identity: Option<ClientIdentity>,
    /// Optional payload obfuscation; both ends must hold the same key.
    pub codec: Option<MessageCodec>,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            identity: None,
            codec: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_codec(mut self, codec: MessageCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Rooms this client has joined; membership is additive and replayed
/// verbatim after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinedRoom {
    Chat(String),
    Role(RoleRoom),
}

impl JoinedRoom {
    fn frame(&self, sender_id: &str) -> Frame {
        match self {
            Self::Chat(room) => Frame::join_chat(room.clone(), sender_id),
            Self::Role(role) => Frame::join_role_room(role.token(), sender_id),
        }
    }
}

/// State shared between the client handle and its connection tasks.
struct Inner {
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    outgoing_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    joined_rooms: RwLock<HashSet<JoinedRoom>>,
    messages_tx: broadcast::Sender<ChatMessage>,
    broadcasts_tx: broadcast::Sender<ChatMessage>,
    event_tx: mpsc::Sender<ChatEvent>,
    /// Set by an explicit `disconnect()`; suppresses auto-reconnect.
    shutdown: AtomicBool,
    /// Connection generation; stale reader tasks must not clobber a newer
    /// connection's state.
    generation: AtomicU64,
}

impl Inner {
    fn sender_id(&self) -> String {
        self.config
            .identity
            .as_ref()
            .map(|i| i.user_id.clone())
            .unwrap_or_default()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Emit a pre-built frame, failing fast when the transport is down.
    async fn send_frame(&self, frame: &Frame) -> Result<(), ChatError> {
        let encoded = frame.encode()?;
        let tx = self.outgoing_tx.read().await.clone();
        match tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ChatError::TransportUnavailable),
            None => Err(ChatError::TransportUnavailable),
        }
    }

    /// One connect/reconnect cycle: bounded attempts with backoff.
    ///
    /// Boxed rather than `async fn`: the reader task inside [`establish`]
    /// awaits this function again, and the resulting recursive opaque
    /// future has no finite type. Type-erasing it here breaks the cycle.
    fn connect_with_retry(
        inner: Arc<Inner>,
        label: ConnectionState,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChatError>> + Send>> {
        Box::pin(async move {
            inner.set_state(label).await;
            let policy = inner.config.reconnect.clone();
            let mut attempt = 0u32;
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    inner.set_state(ConnectionState::Disconnected).await;
                    return Err(ChatError::ConnectionFailed("client disconnected".to_string()));
                }
                match Inner::establish(&inner).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        *inner.last_error.write().await = Some(e.to_string());
                        attempt += 1;
                        if attempt >= policy.max_attempts {
                            inner.set_state(ConnectionState::Failed).await;
                            return Err(ChatError::ConnectionFailed(e.to_string()));
                        }
                        let delay = policy.base_delay * 2u32.saturating_pow(attempt - 1);
                        log::debug!("connect attempt {attempt} failed ({e}); retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }

    /// Single handshake: open the socket, spawn writer/reader tasks, send
    /// identity, replay room joins.
    async fn establish(inner: &Arc<Inner>) -> Result<(), ChatError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&inner.config.url)
            .await
            .map_err(|e| ChatError::ConnectionFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *inner.outgoing_tx.write().await = Some(out_tx.clone());

        // Writer task: forward the outgoing channel to the socket; closing
        // the channel closes the connection politely.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        if let Some(identity) = &inner.config.identity {
            let hello = Frame::hello(identity)?;
            let _ = out_tx.send(hello.encode()?).await;
        }

        // Room membership is cheap and idempotent to rejoin
        let sender_id = inner.sender_id();
        {
            let rooms = inner.joined_rooms.read().await;
            for room in rooms.iter() {
                if let Ok(encoded) = room.frame(&sender_id).encode() {
                    let _ = out_tx.send(encoded).await;
                }
            }
        }

        inner.set_state(ConnectionState::Connected).await;
        *inner.last_error.write().await = None;
        let _ = inner.event_tx.send(ChatEvent::Connected).await;

        // Reader task: deliver incoming frames; on connection loss, start
        // the bounded reconnect cycle unless shut down explicitly.
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        reader_inner.handle_frame(&bytes).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if reader_inner.generation.load(Ordering::SeqCst) != generation {
                return; // superseded by a newer connection
            }
            *reader_inner.outgoing_tx.write().await = None;
            reader_inner.set_state(ConnectionState::Disconnected).await;
            let _ = reader_inner.event_tx.send(ChatEvent::Disconnected).await;

            if !reader_inner.shutdown.load(Ordering::SeqCst) {
                let retry_inner = reader_inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = Inner::connect_with_retry(
                        retry_inner.clone(),
                        ConnectionState::Reconnecting,
                    )
                    .await
                    {
                        log::warn!("reconnect gave up: {e}");
                        let _ = retry_inner
                            .event_tx
                            .send(ChatEvent::ReconnectFailed(e.to_string()))
                            .await;
                    }
                });
            }
        });

        Ok(())
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("undecodable frame dropped: {e}");
                return;
            }
        };
        match frame.event {
            EventType::ReceiveMessage | EventType::BroadcastMessage => {
                let msg = match frame.message() {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("malformed {:?} dropped: {e}", frame.event);
                        return;
                    }
                };
                let msg = match &self.config.codec {
                    Some(codec) => msg.with_content(codec.decode(&msg.content)),
                    None => msg,
                };
                if !msg.is_well_formed() {
                    log::warn!("live event missing sender or content dropped");
                    return;
                }
                let tx = if frame.event == EventType::ReceiveMessage {
                    &self.messages_tx
                } else {
                    &self.broadcasts_tx
                };
                // No subscribers is fine
                let _ = tx.send(msg);
            }
            EventType::Pong => log::trace!("pong from relay"),
            other => log::debug!("unhandled event from relay: {other:?}"),
        }
    }
}

/// The chat client handle.
///
/// All methods take `&self`; the handle may be shared freely. The single
/// underlying connection is shared by every conversation and broadcast
/// subscription in the process.
pub struct ChatClient {
    inner: Arc<Inner>,
    event_rx: Option<mpsc::Receiver<ChatEvent>>,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (messages_tx, _) = broadcast::channel(256);
        let (broadcasts_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                last_error: RwLock::new(None),
                outgoing_tx: RwLock::new(None),
                joined_rooms: RwLock::new(HashSet::new()),
                messages_tx,
                broadcasts_tx,
                event_tx,
                shutdown: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the lifecycle event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay. Idempotent: an already-connected client
    /// returns immediately. Retries transport failures up to the configured
    /// attempt budget, then fails with [`ChatError::ConnectionFailed`].
    pub async fn connect(&self) -> Result<(), ChatError> {
        if self.state().await == ConnectionState::Connected {
            return Ok(());
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        Inner::connect_with_retry(self.inner.clone(), ConnectionState::Connecting).await
    }

    /// Tear the connection down; a later `connect()` starts fresh.
    pub async fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Dropping the outgoing sender ends the writer task, which sends a
        // Close frame; the reader then winds down without reconnecting.
        *self.inner.outgoing_tx.write().await = None;
        self.inner.set_state(ConnectionState::Disconnected).await;
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Reason for the most recent connection failure, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().await.clone()
    }

    /// Join the pairwise room for `self_id` and `peer_id`.
    ///
    /// The room id is returned synchronously so outgoing messages can be
    /// tagged before the join round-trip completes; the join itself is
    /// fire-and-forget. Offline joins are recorded and replayed on the next
    /// (re)connect.
    pub async fn join_room(&self, self_id: &str, peer_id: &str) -> Result<String, ChatError> {
        let room = direct_room_id(self_id, peer_id)?;
        self.inner
            .joined_rooms
            .write()
            .await
            .insert(JoinedRoom::Chat(room.clone()));
        let frame = Frame::join_chat(room.clone(), self_id);
        match self.inner.send_frame(&frame).await {
            Err(ChatError::TransportUnavailable) => {
                log::debug!("offline: join of {room} deferred to next connect");
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        Ok(room)
    }

    /// Join a role broadcast room.
    pub async fn join_role_room(&self, role: RoleRoom) -> Result<(), ChatError> {
        self.inner
            .joined_rooms
            .write()
            .await
            .insert(JoinedRoom::Role(role));
        let frame = Frame::join_role_room(role.token(), self.inner.sender_id());
        match self.inner.send_frame(&frame).await {
            Err(ChatError::TransportUnavailable) => {
                log::debug!("offline: join of {} deferred to next connect", role.token());
                Ok(())
            }
            other => other,
        }
    }

    /// Emit a one-to-one message on the live channel.
    ///
    /// A new value is built with the derived room id (caller-owned state is
    /// never mutated) and the codec applied. Offline emission is a silent
    /// no-op: the caller has already written to the durable store, which is
    /// authoritative.
    pub async fn send(&self, msg: &ChatMessage) -> Result<(), ChatError> {
        let room = match &msg.chat_room_id {
            Some(room) => room.clone(),
            None => direct_room_id(&msg.sender.id, &msg.receiver.id)?,
        };
        let outgoing = self.seal(msg.with_room(room));
        let frame = Frame::send_message(&outgoing)?;
        match self.inner.send_frame(&frame).await {
            Err(ChatError::TransportUnavailable) => {
                log::debug!("offline: live emission skipped (store copy is authoritative)");
                Ok(())
            }
            other => other,
        }
    }

    /// Emit a broadcast on the live channel, routed by the receiver's
    /// broadcast-group kind. Same offline rule as [`send`](Self::send).
    pub async fn send_broadcast(&self, msg: &ChatMessage) -> Result<(), ChatError> {
        let role = RoleRoom::from_kind(msg.receiver.kind).ok_or_else(|| {
            ChatError::InvalidAddress(format!(
                "receiver kind {:?} is not a broadcast group",
                msg.receiver.kind
            ))
        })?;
        let mut outgoing = self.seal(msg.clone());
        outgoing.is_broadcast = true;
        outgoing.chat_room_id = None;
        let frame = Frame::send_broadcast(role.token(), &outgoing)?;
        match self.inner.send_frame(&frame).await {
            Err(ChatError::TransportUnavailable) => {
                log::debug!("offline: broadcast emission skipped");
                Ok(())
            }
            other => other,
        }
    }

    /// Subscribe to incoming one-to-one messages. Every subscriber sees
    /// every event; unsubscribing is dropping the receiver.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.messages_tx.subscribe()
    }

    /// Subscribe to incoming broadcasts.
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.broadcasts_tx.subscribe()
    }

    /// Number of rooms this client has joined (including deferred joins).
    pub async fn joined_room_count(&self) -> usize {
        self.inner.joined_rooms.read().await.len()
    }

    fn seal(&self, msg: ChatMessage) -> ChatMessage {
        match &self.inner.config.codec {
            Some(codec) => {
                let sealed = codec.encode(&msg.content);
                msg.with_content(sealed)
            }
            None => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Participant, ParticipantKind};

    fn client() -> ChatClient {
        ChatClient::new(ClientConfig::new("ws://127.0.0.1:1"))
    }

    fn direct_msg() -> ChatMessage {
        ChatMessage::direct(
            Participant::new("t1", ParticipantKind::Teacher, "T"),
            Participant::new("s1", ParticipantKind::Student, "S"),
            "subj",
            "body",
            "school-1",
        )
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = client();
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(client.last_error().await.is_none());
        assert_eq!(client.joined_room_count().await, 0);
    }

    #[tokio::test]
    async fn test_offline_send_is_silent_noop() {
        let client = client();
        client.send(&direct_msg()).await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_broadcast_is_silent_noop() {
        let client = client();
        let msg = ChatMessage::broadcast(
            Participant::new("t1", ParticipantKind::Teacher, "T"),
            ParticipantKind::AllStudents,
            "s",
            "c",
            "school-1",
        )
        .unwrap();
        client.send_broadcast(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_does_not_mutate_caller_message() {
        let client = client();
        let msg = direct_msg();
        client.send(&msg).await.unwrap();
        assert!(msg.chat_room_id.is_none());
    }

    #[tokio::test]
    async fn test_join_room_returns_id_synchronously() {
        let client = client();
        let room = client.join_room("t1", "s1").await.unwrap();
        assert_eq!(room, "s1_t1");
        assert_eq!(client.joined_room_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_room_rejects_missing_id() {
        let client = client();
        let err = client.join_room("", "s1").await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidAddress(_)));
        // No join recorded either
        assert_eq!(client.joined_room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_role_room_recorded_offline() {
        let client = client();
        client.join_role_room(RoleRoom::Teachers).await.unwrap();
        assert_eq!(client.joined_room_count().await, 1);
        // Idempotent
        client.join_role_room(RoleRoom::Teachers).await.unwrap();
        assert_eq!(client.joined_room_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_broadcast_rejects_individual_receiver() {
        let client = client();
        let err = client.send_broadcast(&direct_msg()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_bounded_attempts() {
        // Nothing listens on this port; keep backoff tiny
        let config = ClientConfig::new("ws://127.0.0.1:1").with_reconnect(ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
        });
        let client = ChatClient::new(config);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ChatError::ConnectionFailed(_)));
        assert_eq!(client.state().await, ConnectionState::Failed);
        assert!(client.last_error().await.is_some());
    }

    #[tokio::test]
    async fn test_take_event_rx_single_use() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_reconnect_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }
}
