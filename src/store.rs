//! Durable message store collaborator.
//!
//! The store itself lives outside this crate (the portal backend); this
//! module defines the request/response contract the messaging layer depends
//! on, plus an in-memory implementation used by tests and local development.
//!
//! The store is authoritative: `create` assigns the persisted id and
//! normalizes the broadcast flag, and a history fetch re-establishes the
//! base set of a conversation regardless of what arrived live.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::{ChatError, ChatMessage, Participant, ParticipantKind};

/// One conversation in the inbox summary.
#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub peer: Participant,
    pub last_message: ChatMessage,
    pub unread: usize,
}

/// Request/response operations against the durable message store.
#[allow(async_fn_in_trait)]
pub trait MessageStore {
    /// Persist a message; the returned copy carries the assigned id.
    async fn create(&self, msg: ChatMessage) -> Result<ChatMessage, ChatError>;

    /// All messages between two participants, either direction.
    async fn fetch_conversation(
        &self,
        self_id: &str,
        self_kind: ParticipantKind,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, ChatError>;

    /// Conversation summaries with last-message previews.
    async fn fetch_inbox(
        &self,
        self_id: &str,
        self_kind: ParticipantKind,
    ) -> Result<Vec<InboxEntry>, ChatError>;

    /// Broadcast messages visible to this participant.
    async fn fetch_broadcasts(
        &self,
        self_id: &str,
        self_kind: ParticipantKind,
    ) -> Result<Vec<ChatMessage>, ChatError>;

    /// Delete a persisted message by id.
    async fn delete(&self, message_id: &str) -> Result<(), ChatError>;
}

/// A shared store handle is itself a store.
impl<T: MessageStore> MessageStore for Arc<T> {
    async fn create(&self, msg: ChatMessage) -> Result<ChatMessage, ChatError> {
        (**self).create(msg).await
    }

    async fn fetch_conversation(
        &self,
        self_id: &str,
        self_kind: ParticipantKind,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        (**self).fetch_conversation(self_id, self_kind, peer_id).await
    }

    async fn fetch_inbox(
        &self,
        self_id: &str,
        self_kind: ParticipantKind,
    ) -> Result<Vec<InboxEntry>, ChatError> {
        (**self).fetch_inbox(self_id, self_kind).await
    }

    async fn fetch_broadcasts(
        &self,
        self_id: &str,
        self_kind: ParticipantKind,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        (**self).fetch_broadcasts(self_id, self_kind).await
    }

    async fn delete(&self, message_id: &str) -> Result<(), ChatError> {
        (**self).delete(message_id).await
    }
}

/// In-memory store for tests and local development.
///
/// Assigns sequential persisted ids and mimics the backend's normalization
/// of the broadcast flag. `fail_fetches` forces the fetch operations to
/// fail, for exercising the Empty-with-error path.
pub struct InMemoryStore {
    messages: Arc<RwLock<Vec<ChatMessage>>>,
    next_id: AtomicU64,
    fail_fetches: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            fail_fetches: AtomicBool::new(false),
        }
    }

    /// Make subsequent fetches fail (or succeed again).
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    fn check_available(&self) -> Result<(), ChatError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(ChatError::FetchFailure("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Whether `msg` is a broadcast visible to a participant of `kind`.
    fn broadcast_visible(msg: &ChatMessage, kind: ParticipantKind) -> bool {
        match msg.receiver.kind {
            ParticipantKind::All => true,
            ParticipantKind::AllTeachers => kind == ParticipantKind::Teacher,
            ParticipantKind::AllStudents => kind == ParticipantKind::Student,
            _ => false,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for InMemoryStore {
    async fn create(&self, msg: ChatMessage) -> Result<ChatMessage, ChatError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut persisted = msg;
        persisted.persisted_id = Some(format!("m{id}"));
        // Normalize: the receiver kind decides, whatever the caller set
        persisted.is_broadcast = persisted.receiver.kind.is_broadcast_group();
        self.messages.write().await.push(persisted.clone());
        Ok(persisted)
    }

    async fn fetch_conversation(
        &self,
        self_id: &str,
        _self_kind: ParticipantKind,
        peer_id: &str,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.check_available()?;
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| {
                !m.is_broadcast
                    && ((m.sender.id == self_id && m.receiver.id == peer_id)
                        || (m.sender.id == peer_id && m.receiver.id == self_id))
            })
            .cloned()
            .collect())
    }

    async fn fetch_inbox(
        &self,
        self_id: &str,
        _self_kind: ParticipantKind,
    ) -> Result<Vec<InboxEntry>, ChatError> {
        self.check_available()?;
        let messages = self.messages.read().await;
        let mut entries: Vec<InboxEntry> = Vec::new();
        for msg in messages.iter().filter(|m| !m.is_broadcast) {
            let peer = if msg.sender.id == self_id {
                &msg.receiver
            } else if msg.receiver.id == self_id {
                &msg.sender
            } else {
                continue;
            };
            let incoming = msg.receiver.id == self_id;
            match entries.iter_mut().find(|e| e.peer.id == peer.id) {
                Some(entry) => {
                    if msg.timestamp >= entry.last_message.timestamp {
                        entry.last_message = msg.clone();
                    }
                    if incoming {
                        entry.unread += 1;
                    }
                }
                None => entries.push(InboxEntry {
                    peer: peer.clone(),
                    last_message: msg.clone(),
                    unread: usize::from(incoming),
                }),
            }
        }
        // Most recent conversation first
        entries.sort_by(|a, b| b.last_message.timestamp.cmp(&a.last_message.timestamp));
        Ok(entries)
    }

    async fn fetch_broadcasts(
        &self,
        self_id: &str,
        self_kind: ParticipantKind,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.check_available()?;
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| {
                m.is_broadcast
                    && (Self::broadcast_visible(m, self_kind) || m.sender.id == self_id)
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, message_id: &str) -> Result<(), ChatError> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| m.persisted_id.as_deref() != Some(message_id));
        if messages.len() == before {
            return Err(ChatError::NotFound(format!("no message with id {message_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teacher() -> Participant {
        Participant::new("t1", ParticipantKind::Teacher, "Ms. Frizzle")
    }

    fn student() -> Participant {
        Participant::new("s1", ParticipantKind::Student, "Arnold")
    }

    #[tokio::test]
    async fn test_create_assigns_persisted_id() {
        let store = InMemoryStore::new();
        let msg = ChatMessage::direct(teacher(), student(), "subj", "body", "school-1");
        let a = store.create(msg.clone()).await.unwrap();
        let b = store.create(msg).await.unwrap();
        assert_eq!(a.persisted_id.as_deref(), Some("m1"));
        assert_eq!(b.persisted_id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_create_normalizes_broadcast_flag() {
        let store = InMemoryStore::new();
        let mut msg = ChatMessage::broadcast(
            teacher(),
            ParticipantKind::AllStudents,
            "subj",
            "body",
            "school-1",
        )
        .unwrap();
        msg.is_broadcast = false; // caller got it wrong
        let persisted = store.create(msg).await.unwrap();
        assert!(persisted.is_broadcast);
    }

    #[tokio::test]
    async fn test_fetch_conversation_both_directions() {
        let store = InMemoryStore::new();
        store
            .create(ChatMessage::direct(teacher(), student(), "s", "from teacher", "sch"))
            .await
            .unwrap();
        store
            .create(ChatMessage::direct(student(), teacher(), "s", "from student", "sch"))
            .await
            .unwrap();
        store
            .create(ChatMessage::direct(
                Participant::new("x9", ParticipantKind::Admin, "Other"),
                student(),
                "s",
                "unrelated",
                "sch",
            ))
            .await
            .unwrap();

        let convo = store
            .fetch_conversation("t1", ParticipantKind::Teacher, "s1")
            .await
            .unwrap();
        assert_eq!(convo.len(), 2);
        assert!(convo.iter().all(|m| m.content != "unrelated"));
    }

    #[tokio::test]
    async fn test_fetch_inbox_groups_by_peer() {
        let store = InMemoryStore::new();
        store
            .create(ChatMessage::direct(student(), teacher(), "s", "one", "sch"))
            .await
            .unwrap();
        store
            .create(ChatMessage::direct(student(), teacher(), "s", "two", "sch"))
            .await
            .unwrap();
        store
            .create(ChatMessage::direct(teacher(), student(), "s", "reply", "sch"))
            .await
            .unwrap();

        let inbox = store.fetch_inbox("t1", ParticipantKind::Teacher).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].peer.id, "s1");
        assert_eq!(inbox[0].unread, 2);
        assert_eq!(inbox[0].last_message.content, "reply");
    }

    #[tokio::test]
    async fn test_fetch_broadcasts_filters_by_audience() {
        let store = InMemoryStore::new();
        store
            .create(
                ChatMessage::broadcast(teacher(), ParticipantKind::AllStudents, "s", "to students", "sch")
                    .unwrap(),
            )
            .await
            .unwrap();
        store
            .create(
                ChatMessage::broadcast(teacher(), ParticipantKind::AllTeachers, "s", "to teachers", "sch")
                    .unwrap(),
            )
            .await
            .unwrap();
        store
            .create(
                ChatMessage::broadcast(teacher(), ParticipantKind::All, "s", "to everyone", "sch")
                    .unwrap(),
            )
            .await
            .unwrap();

        let seen = store
            .fetch_broadcasts("s1", ParticipantKind::Student)
            .await
            .unwrap();
        let contents: Vec<&str> = seen.iter().map(|m| m.content.as_str()).collect();
        assert!(contents.contains(&"to students"));
        assert!(contents.contains(&"to everyone"));
        assert!(!contents.contains(&"to teachers"));
    }

    #[tokio::test]
    async fn test_sender_sees_own_broadcasts() {
        let store = InMemoryStore::new();
        store
            .create(
                ChatMessage::broadcast(teacher(), ParticipantKind::AllStudents, "s", "notice", "sch")
                    .unwrap(),
            )
            .await
            .unwrap();
        let own = store
            .fetch_broadcasts("t1", ParticipantKind::Teacher)
            .await
            .unwrap();
        assert_eq!(own.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryStore::new();
        let persisted = store
            .create(ChatMessage::direct(teacher(), student(), "s", "x", "sch"))
            .await
            .unwrap();
        let id = persisted.persisted_id.unwrap();

        store.delete(&id).await.unwrap();
        assert_eq!(store.len().await, 0);
        assert!(matches!(store.delete(&id).await, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_fetches_toggle() {
        let store = InMemoryStore::new();
        store.set_fail_fetches(true);
        assert!(matches!(
            store.fetch_conversation("t1", ParticipantKind::Teacher, "s1").await,
            Err(ChatError::FetchFailure(_))
        ));

        store.set_fail_fetches(false);
        assert!(store
            .fetch_conversation("t1", ParticipantKind::Teacher, "s1")
            .await
            .is_ok());
    }
}
