//! Room addressing and relay-side fan-out.
//!
//! Two participants must arrive at the same pairwise room id without
//! coordination, so [`direct_room_id`] is a pure function of the two ids.
//! Role broadcast rooms use fixed tokens ([`RoleRoom`]); they are not
//! tenant-scoped at this layer — the durable-store backend filters by school.
//!
//! The fan-out side ([`BroadcastGroup`], [`RoomManager`]) uses tokio
//! broadcast channels for O(1) send to all subscribers; each connection gets
//! an independent receiver buffering up to `capacity` frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ChatError, ParticipantKind};

/// Separator for pairwise room ids.
const ROOM_SEPARATOR: char = '_';

/// Derive the pairwise conversation room id for two participants.
///
/// The two ids are sorted lexicographically and joined, so
/// `direct_room_id(a, b) == direct_room_id(b, a)` for all pairs.
/// Empty or whitespace-only ids fail with [`ChatError::InvalidAddress`].
pub fn direct_room_id(a: &str, b: &str) -> Result<String, ChatError> {
    if a.trim().is_empty() || b.trim().is_empty() {
        return Err(ChatError::InvalidAddress(
            "participant id missing for room derivation".to_string(),
        ));
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Ok(format!("{lo}{ROOM_SEPARATOR}{hi}"))
}

/// Canonical role broadcast rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleRoom {
    Teachers,
    Students,
    All,
}

impl RoleRoom {
    /// The wire token for this room.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Teachers => "teachers",
            Self::Students => "students",
            Self::All => "all",
        }
    }

    /// Map a broadcast-group receiver kind to its room.
    pub fn from_kind(kind: ParticipantKind) -> Option<Self> {
        match kind {
            ParticipantKind::AllTeachers => Some(Self::Teachers),
            ParticipantKind::AllStudents => Some(Self::Students),
            ParticipantKind::All => Some(Self::All),
            _ => None,
        }
    }

    /// Map an individual role to the room that role listens on.
    pub fn from_role(kind: ParticipantKind) -> Option<Self> {
        match kind {
            ParticipantKind::Teacher => Some(Self::Teachers),
            ParticipantKind::Student => Some(Self::Students),
            _ => None,
        }
    }

    /// Parse a role name as used by callers (`"teacher"`, `"student"`, `"all"`).
    pub fn from_role_str(role: &str) -> Option<Self> {
        match role {
            "teacher" | "teachers" => Some(Self::Teachers),
            "student" | "students" => Some(Self::Students),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// A frame travelling through a room, tagged with its origin connection so
/// the relay never echoes a frame back to the connection that sent it.
#[derive(Debug)]
pub struct RoomEnvelope {
    pub origin: Uuid,
    pub bytes: Vec<u8>,
}

/// A peer as tracked inside a relay room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPeer {
    pub conn_id: Uuid,
    pub user_id: String,
}

/// Fan-out group for a single room.
///
/// All connections in the same room share one broadcast channel. A frame
/// sent by one connection is delivered to the N-1 others (origin filtering
/// happens at the receiving side via [`RoomEnvelope::origin`]).
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEnvelope>>,
    peers: Arc<RwLock<HashMap<Uuid, RoomPeer>>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per lagging receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Add a connection to this room; returns its receiver.
    ///
    /// Re-adding the same connection is idempotent membership-wise, but a
    /// fresh receiver is handed back each time.
    pub async fn add_peer(&self, peer: RoomPeer) -> broadcast::Receiver<Arc<RoomEnvelope>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer.conn_id, peer);
        self.sender.subscribe()
    }

    /// Remove a connection from this room.
    pub async fn remove_peer(&self, conn_id: &Uuid) -> Option<RoomPeer> {
        let mut peers = self.peers.write().await;
        peers.remove(conn_id)
    }

    /// Fan a pre-encoded frame out to every receiver.
    ///
    /// Returns the number of receivers the frame reached. Lock-free.
    pub fn fan_out(&self, origin: Uuid, bytes: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(RoomEnvelope { origin, bytes }))
            .unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn_id)
    }

    /// Frames fanned out through this room so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids (pairwise ids and role tokens alike) to broadcast groups.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for the given room id.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Look up an existing room without creating it.
    pub async fn get(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Remove a room once its last connection has left.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.peer_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
