//! Session orchestration: durable store + live channel, one open scope.
//!
//! Control flow for opening a conversation:
//! ```text
//! open_direct(peer)
//!   │  derive room id, join it (fire-and-forget)
//!   │  subscribe to live messages, then fetch history
//!   ▼
//! Conversation (base set = fetched batch)
//!   ▲
//!   └── router task: live events for this room merge in
//! ```
//!
//! Sending writes to the store first (authoritative, assigns the persisted
//! id) and then emits the persisted copy on the live channel; the receiving
//! side discards whichever copy arrives second.
//!
//! Switching scope aborts the previous router task before subscribing the
//! new one, so events never leak across conversations; reopening a
//! conversation re-fetches from the store and discards stale live state.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::ChatClient;
use crate::protocol::{ChatError, ChatMessage, Participant, ParticipantKind};
use crate::reconcile::{Conversation, ConversationState};
use crate::rooms::{direct_room_id, RoleRoom};
use crate::store::{InboxEntry, MessageStore};

/// What the session is currently looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Direct { peer_id: String, room_id: String },
    Broadcasts,
}

/// One participant's chat session.
pub struct ChatSession<S: MessageStore> {
    client: ChatClient,
    store: S,
    me: Participant,
    school: String,
    conversation: Arc<Mutex<Conversation>>,
    router: Option<JoinHandle<()>>,
    scope: Option<Scope>,
}

impl<S: MessageStore> ChatSession<S> {
    pub fn new(client: ChatClient, store: S, me: Participant, school: impl Into<String>) -> Self {
        Self {
            client,
            store,
            me,
            school: school.into(),
            conversation: Arc::new(Mutex::new(Conversation::new())),
            router: None,
            scope: None,
        }
    }

    pub fn client(&self) -> &ChatClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ChatClient {
        &mut self.client
    }

    pub fn me(&self) -> &Participant {
        &self.me
    }

    /// Connect the underlying live channel. Idempotent.
    pub async fn connect(&self) -> Result<(), ChatError> {
        self.client.connect().await
    }

    /// Open the one-to-one conversation with `peer`.
    ///
    /// Returns the room id. A fetch failure leaves the conversation Empty
    /// with the error recorded; [`refresh`](Self::refresh) retries.
    pub async fn open_direct(&mut self, peer: &Participant) -> Result<String, ChatError> {
        self.stop_router();

        let room_id = self.client.join_room(&self.me.id, &peer.id).await?;
        let conversation = Arc::new(Mutex::new(Conversation::new()));
        self.conversation = conversation.clone();

        // Subscribe before fetching so no live event falls in the gap
        let mut rx = self.client.subscribe_messages();

        match self
            .store
            .fetch_conversation(&self.me.id, self.me.kind, &peer.id)
            .await
        {
            Ok(batch) => conversation.lock().await.load(batch),
            Err(e) => conversation.lock().await.mark_fetch_failed(e.to_string()),
        }

        let room = room_id.clone();
        self.router = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg.chat_room_id.as_deref() == Some(room.as_str()) {
                            conversation.lock().await.apply_live(msg);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("conversation router lagged by {n} events");
                    }
                    Err(_) => break,
                }
            }
        }));

        self.scope = Some(Scope::Direct {
            peer_id: peer.id.clone(),
            room_id: room_id.clone(),
        });
        Ok(room_id)
    }

    /// Open the broadcast stream for this participant's role.
    ///
    /// Joins the role room matching `me.kind` (when there is one) plus the
    /// global room, fetches visible broadcast history, and merges live
    /// broadcasts as they arrive.
    pub async fn open_broadcasts(&mut self) -> Result<(), ChatError> {
        self.stop_router();

        if let Some(role) = RoleRoom::from_role(self.me.kind) {
            self.client.join_role_room(role).await?;
        }
        self.client.join_role_room(RoleRoom::All).await?;

        let conversation = Arc::new(Mutex::new(Conversation::new()));
        self.conversation = conversation.clone();

        let mut rx = self.client.subscribe_broadcasts();

        match self.store.fetch_broadcasts(&self.me.id, self.me.kind).await {
            Ok(batch) => conversation.lock().await.load(batch),
            Err(e) => conversation.lock().await.mark_fetch_failed(e.to_string()),
        }

        self.router = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        conversation.lock().await.apply_live(msg);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("broadcast router lagged by {n} events");
                    }
                    Err(_) => break,
                }
            }
        }));

        self.scope = Some(Scope::Broadcasts);
        Ok(())
    }

    /// Send a one-to-one message: persist, then emit the persisted copy.
    pub async fn send_direct(
        &self,
        peer: &Participant,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ChatMessage, ChatError> {
        let room_id = direct_room_id(&self.me.id, &peer.id)?;
        let msg = ChatMessage::direct(self.me.clone(), peer.clone(), subject, content, &self.school)
            .with_room(&room_id);

        let persisted = self.store.create(msg).await?;
        self.client.send(&persisted).await?;

        // The relay never echoes to the sender; show our own message locally
        if let Some(Scope::Direct { peer_id, .. }) = &self.scope {
            if peer_id == &peer.id {
                self.conversation.lock().await.apply_live(persisted.clone());
            }
        }
        Ok(persisted)
    }

    /// Send a role broadcast: persist, then emit the persisted copy.
    pub async fn send_broadcast(
        &self,
        audience: ParticipantKind,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ChatMessage, ChatError> {
        let msg = ChatMessage::broadcast(self.me.clone(), audience, subject, content, &self.school)?;

        let persisted = self.store.create(msg).await?;
        self.client.send_broadcast(&persisted).await?;

        if self.scope == Some(Scope::Broadcasts) {
            self.conversation.lock().await.apply_live(persisted.clone());
        }
        Ok(persisted)
    }

    /// Re-fetch the open scope from the store, discarding accumulated live
    /// state first.
    pub async fn refresh(&self) -> Result<(), ChatError> {
        let scope = match &self.scope {
            Some(scope) => scope.clone(),
            None => return Ok(()),
        };
        self.conversation.lock().await.refresh();

        let fetched = match &scope {
            Scope::Direct { peer_id, .. } => {
                self.store
                    .fetch_conversation(&self.me.id, self.me.kind, peer_id)
                    .await
            }
            Scope::Broadcasts => self.store.fetch_broadcasts(&self.me.id, self.me.kind).await,
        };
        match fetched {
            Ok(batch) => {
                self.conversation.lock().await.load(batch);
                Ok(())
            }
            Err(e) => {
                self.conversation.lock().await.mark_fetch_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// The merged, time-ordered view of the open scope.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.conversation.lock().await.messages().to_vec()
    }

    pub async fn conversation_state(&self) -> ConversationState {
        self.conversation.lock().await.state()
    }

    pub async fn fetch_error(&self) -> Option<String> {
        self.conversation.lock().await.fetch_error().map(str::to_string)
    }

    /// Conversation summaries for this participant.
    pub async fn inbox(&self) -> Result<Vec<InboxEntry>, ChatError> {
        self.store.fetch_inbox(&self.me.id, self.me.kind).await
    }

    /// Delete a persisted message.
    pub async fn delete(&self, message_id: &str) -> Result<(), ChatError> {
        self.store.delete(message_id).await
    }

    /// Close the open scope and tear down the live connection.
    pub async fn close(&mut self) {
        self.stop_router();
        self.scope = None;
        self.client.disconnect().await;
    }

    fn stop_router(&mut self) {
        if let Some(handle) = self.router.take() {
            handle.abort();
        }
    }
}

impl<S: MessageStore> Drop for ChatSession<S> {
    fn drop(&mut self) {
        self.stop_router();
    }
}
