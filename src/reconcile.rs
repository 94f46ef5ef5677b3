//! Reconciliation of durable-store history with live-channel events.
//!
//! A sender writes to the durable store and emits on the live channel
//! concurrently; the receiver cannot assume which copy arrives first. The
//! merge here is order-independent and idempotent under at-least-once
//! delivery: the same message may arrive any number of times through either
//! path and appears exactly once in the merged view.
//!
//! State machine per open conversation:
//! ```text
//! Empty ──fetch ok──► Loaded ──live event──► Loaded
//!   ▲                    │
//!   └─────refresh────────┘      (refresh discards accumulated live state)
//! ```

use std::collections::HashSet;

use crate::protocol::ChatMessage;

/// Which phase a conversation is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// No authoritative base set yet (initial, after refresh, or after a
    /// failed fetch).
    Empty,
    /// A fetched batch forms the base set; live events merge into it.
    Loaded,
}

/// Deduplication key for a message.
///
/// A persisted message is identified by its store id; before persistence it
/// is identified by the content signature (sender id + content + timestamp).
/// The signature is a known approximation, not a guaranteed-unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Persisted(String),
    Signature(String),
}

/// A single conversation's merged, deduplicated, time-ordered view.
pub struct Conversation {
    state: ConversationState,
    fetch_error: Option<String>,
    messages: Vec<ChatMessage>,
    seen: HashSet<DedupKey>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            state: ConversationState::Empty,
            fetch_error: None,
            messages: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Reason the last fetch failed, if the conversation is Empty because of it.
    pub fn fetch_error(&self) -> Option<&str> {
        self.fetch_error.as_deref()
    }

    /// The merged view, always sorted by timestamp ascending.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Install a fetched batch as the base set.
    ///
    /// Replaces everything accumulated so far; the store is authoritative.
    /// The batch itself is deduplicated and malformed entries are dropped.
    pub fn load(&mut self, batch: Vec<ChatMessage>) {
        self.messages.clear();
        self.seen.clear();
        self.fetch_error = None;
        self.state = ConversationState::Loaded;
        for msg in batch {
            self.merge(msg);
        }
    }

    /// Merge one live event into the view.
    ///
    /// Returns `true` when the message was new. Malformed events (missing
    /// sender id or content) are logged and dropped; duplicates are
    /// discarded silently. Live events only merge into a `Loaded`
    /// conversation: without a base set there is nothing sound to merge
    /// into, and the next successful fetch delivers the event's persisted
    /// copy anyway.
    pub fn apply_live(&mut self, msg: ChatMessage) -> bool {
        if self.state != ConversationState::Loaded {
            log::debug!("live event before a base set is loaded; dropped");
            return false;
        }
        if !msg.is_well_formed() {
            log::warn!(
                "dropping malformed live event (sender={:?}, subject={:?})",
                msg.sender.id,
                msg.subject
            );
            return false;
        }
        self.merge(msg)
    }

    /// Discard the whole merged view ahead of a re-fetch.
    ///
    /// Accumulated live events are not carried forward; the next
    /// [`load`](Self::load) re-establishes the base set from the store.
    pub fn refresh(&mut self) {
        self.messages.clear();
        self.seen.clear();
        self.fetch_error = None;
        self.state = ConversationState::Empty;
    }

    /// Record a failed history fetch; the conversation stays Empty and the
    /// caller may retry.
    pub fn mark_fetch_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("history fetch failed: {reason}");
        self.fetch_error = Some(reason);
        self.state = ConversationState::Empty;
    }

    /// The fetched copy of a message carries a persisted id while its live
    /// echo may not, so membership is checked under both keys — either
    /// match collapses the two copies. A persisted duplicate of a
    /// transient entry replaces it in place, so the merged view ends up
    /// with the store-assigned id whichever copy arrived first.
    fn merge(&mut self, msg: ChatMessage) -> bool {
        let signature = DedupKey::Signature(msg.signature());
        let persisted = msg.persisted_id.clone().map(DedupKey::Persisted);

        if let Some(key) = &persisted {
            if self.seen.contains(key) {
                log::trace!("duplicate message discarded ({key:?})");
                return false;
            }
        }
        if self.seen.contains(&signature) {
            if let Some(key) = persisted {
                if let Some(existing) = self
                    .messages
                    .iter_mut()
                    .find(|m| m.persisted_id.is_none() && m.signature() == msg.signature())
                {
                    *existing = msg;
                    self.seen.insert(key);
                }
            }
            return false;
        }

        self.seen.insert(signature);
        if let Some(key) = persisted {
            self.seen.insert(key);
        }
        // Insert after the last message with an earlier-or-equal timestamp
        // so equal timestamps keep arrival order (stable).
        let at = self.messages.partition_point(|m| m.timestamp <= msg.timestamp);
        self.messages.insert(at, msg);
        true
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Participant, ParticipantKind};
    use chrono::{Duration, Utc};

    fn party(id: &str) -> Participant {
        Participant::new(id, ParticipantKind::Student, id.to_uppercase())
    }

    fn msg_at(sender: &str, content: &str, offset_secs: i64) -> ChatMessage {
        let mut m = ChatMessage::direct(party(sender), party("peer"), "subj", content, "school-1");
        m.timestamp = Utc::now() + Duration::seconds(offset_secs);
        m
    }

    fn persisted(mut m: ChatMessage, id: &str) -> ChatMessage {
        m.persisted_id = Some(id.to_string());
        m
    }

    #[test]
    fn test_initial_state_empty() {
        let conv = Conversation::new();
        assert_eq!(conv.state(), ConversationState::Empty);
        assert!(conv.is_empty());
        assert!(conv.fetch_error().is_none());
    }

    #[test]
    fn test_load_installs_sorted_base_set() {
        let mut conv = Conversation::new();
        conv.load(vec![
            msg_at("u1", "third", 3),
            msg_at("u1", "first", 1),
            msg_at("u2", "second", 2),
        ]);
        assert_eq!(conv.state(), ConversationState::Loaded);
        let contents: Vec<&str> = conv.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_out_of_order_live_delivery() {
        // "Hi" at t1, "Hello" at t2, delivered out of order
        let mut conv = Conversation::new();
        conv.load(Vec::new());
        let hi = msg_at("u1", "Hi", 1);
        let hello = msg_at("u2", "Hello", 2);

        assert!(conv.apply_live(hello.clone()));
        assert!(conv.apply_live(hi.clone()));

        let contents: Vec<&str> = conv.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi", "Hello"]);
    }

    #[test]
    fn test_idempotent_merge() {
        let mut conv = Conversation::new();
        conv.load(Vec::new());
        let m = msg_at("u1", "once", 1);

        assert!(conv.apply_live(m.clone()));
        assert!(!conv.apply_live(m.clone()));
        assert!(!conv.apply_live(m));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_fetch_copy_and_live_echo_collapse() {
        // Same persisted message arrives once via fetch and once as a live echo
        let mut conv = Conversation::new();
        let m = persisted(msg_at("u1", "hello", 1), "m1");
        conv.load(vec![m.clone()]);

        assert!(!conv.apply_live(m));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_unpersisted_echo_of_fetched_message_collapses() {
        // The live echo may race the store write and carry no persisted id;
        // the signature still matches the fetched copy.
        let mut conv = Conversation::new();
        let transient = msg_at("u1", "hello", 1);
        let stored = persisted(transient.clone(), "m1");
        conv.load(vec![stored]);

        assert!(!conv.apply_live(transient));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_persisted_echo_of_transient_live_copy_collapses() {
        // Opposite arrival order: live copy first, persisted copy second.
        let mut conv = Conversation::new();
        conv.load(Vec::new());
        let transient = msg_at("u1", "hello", 1);
        let stored = persisted(transient.clone(), "m1");

        assert!(conv.apply_live(transient));
        assert!(!conv.apply_live(stored));
        assert_eq!(conv.len(), 1);
        // The store-assigned id wins over the transient entry
        assert_eq!(conv.messages()[0].persisted_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_persisted_copy_upgrades_transient_entry_once() {
        let mut conv = Conversation::new();
        conv.load(Vec::new());
        let transient = msg_at("u1", "hello", 1);
        let stored = persisted(transient.clone(), "m1");

        conv.apply_live(transient);
        conv.apply_live(stored.clone());
        // Further arrivals of either copy change nothing
        assert!(!conv.apply_live(stored));
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].persisted_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_live_event_without_base_set_dropped() {
        let mut conv = Conversation::new();
        assert!(!conv.apply_live(msg_at("u1", "too early", 1)));
        assert!(conv.is_empty());
        assert_eq!(conv.state(), ConversationState::Empty);
    }

    #[test]
    fn test_live_event_after_failed_fetch_dropped() {
        let mut conv = Conversation::new();
        conv.mark_fetch_failed("store timed out");

        assert!(!conv.apply_live(msg_at("u1", "while degraded", 1)));
        assert!(conv.is_empty());
        assert_eq!(conv.fetch_error(), Some("store timed out"));

        // The retry's fetched batch carries the message instead
        conv.load(vec![persisted(msg_at("u1", "while degraded", 1), "m1")]);
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_order_independence() {
        let msgs = vec![
            persisted(msg_at("u1", "a", 1), "m1"),
            msg_at("u2", "b", 2),
            persisted(msg_at("u1", "c", 3), "m3"),
            msg_at("u2", "d", 4),
        ];

        // All 24 permutations of arrival order converge to the same view
        let expected = vec!["a", "b", "c", "d"];
        let n = msgs.len();
        let mut indices: Vec<Vec<usize>> = Vec::new();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    for l in 0..n {
                        let perm = vec![i, j, k, l];
                        let mut sorted = perm.clone();
                        sorted.sort_unstable();
                        sorted.dedup();
                        if sorted.len() == n {
                            indices.push(perm);
                        }
                    }
                }
            }
        }
        assert_eq!(indices.len(), 24);

        for perm in indices {
            let mut conv = Conversation::new();
            conv.load(Vec::new());
            for idx in perm {
                conv.apply_live(msgs[idx].clone());
            }
            let contents: Vec<&str> = conv.messages().iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, expected);
        }
    }

    #[test]
    fn test_refresh_discards_live_state() {
        let mut conv = Conversation::new();
        conv.load(vec![msg_at("u1", "base", 1)]);
        conv.apply_live(msg_at("u2", "live-only", 2));
        assert_eq!(conv.len(), 2);

        conv.refresh();
        assert_eq!(conv.state(), ConversationState::Empty);
        assert!(conv.is_empty());

        // Re-fetch: the merged set equals exactly the new batch
        let batch = vec![msg_at("u1", "fresh", 3)];
        conv.load(batch);
        let contents: Vec<&str> = conv.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["fresh"]);
    }

    #[test]
    fn test_malformed_event_dropped() {
        let mut conv = Conversation::new();
        conv.load(Vec::new());

        let mut missing_content = msg_at("u1", "x", 1);
        missing_content.content.clear();
        assert!(!conv.apply_live(missing_content));

        let mut missing_sender = msg_at("u1", "y", 2);
        missing_sender.sender.id.clear();
        assert!(!conv.apply_live(missing_sender));

        assert!(conv.is_empty());
    }

    #[test]
    fn test_fetch_failure_leaves_empty_with_error() {
        let mut conv = Conversation::new();
        conv.mark_fetch_failed("store timed out");
        assert_eq!(conv.state(), ConversationState::Empty);
        assert_eq!(conv.fetch_error(), Some("store timed out"));

        // A successful retry clears the flag
        conv.load(vec![msg_at("u1", "ok", 1)]);
        assert!(conv.fetch_error().is_none());
        assert_eq!(conv.state(), ConversationState::Loaded);
    }

    #[test]
    fn test_batch_deduplicated_on_load() {
        let mut conv = Conversation::new();
        let m = persisted(msg_at("u1", "dup", 1), "m1");
        conv.load(vec![m.clone(), m.clone(), m]);
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut conv = Conversation::new();
        conv.load(Vec::new());
        let a = msg_at("u1", "first-arrival", 1);
        let mut b = msg_at("u2", "second-arrival", 0);
        b.timestamp = a.timestamp;

        conv.apply_live(a);
        conv.apply_live(b);
        let contents: Vec<&str> = conv.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first-arrival", "second-arrival"]);
    }
}
