//! WebSocket relay with room-based frame routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room "s1_t1"  ── BroadcastGroup ──► Client B
//! Client B ──┘
//!
//! Client C ──── Room "teachers" ── BroadcastGroup ──► every teacher online
//! ```
//!
//! The relay holds no message state: it re-frames `SendMessage` as
//! `ReceiveMessage` (and `SendBroadcast` as `BroadcastMessage`) and fans the
//! frame out to every other connection in the target room. Durable delivery
//! is the message store's job; a message relayed to nobody is not an error.
//!
//! A connection may join any number of rooms; joins are idempotent and
//! membership lasts until the connection closes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{EventType, Frame};
use crate::rooms::{RoleRoom, RoomManager, RoomPeer};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9900".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The live-channel relay.
pub struct Relay {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Start accepting WebSocket connections. Runs the accept loop forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        log::info!("connection {conn_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection state
        let mut user_id = String::new();
        let mut joined: HashSet<String> = HashSet::new();
        let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        // Frames fanned out by rooms this connection joined arrive here
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("undecodable frame from {conn_id}: {e}");
                                    continue;
                                }
                            };

                            match frame.event {
                                EventType::Hello => {
                                    match frame.identity() {
                                        Ok(identity) => {
                                            user_id = identity.user_id.clone();
                                            log::info!(
                                                "connection {conn_id} is {} ({:?}, school {})",
                                                identity.user_id, identity.kind, identity.school
                                            );
                                        }
                                        Err(e) => log::warn!("bad hello from {conn_id}: {e}"),
                                    }
                                }

                                EventType::JoinChat | EventType::JoinRoleRoom => {
                                    let room_id = frame.room.clone();
                                    if room_id.trim().is_empty() {
                                        log::warn!("join with empty room from {conn_id}");
                                        continue;
                                    }
                                    if frame.event == EventType::JoinRoleRoom
                                        && RoleRoom::from_role_str(&room_id).is_none()
                                    {
                                        log::warn!("unknown role room {room_id:?} from {conn_id}");
                                        continue;
                                    }
                                    if joined.contains(&room_id) {
                                        continue; // idempotent rejoin
                                    }

                                    let group = rooms.get_or_create(&room_id).await;
                                    let mut rx = group
                                        .add_peer(RoomPeer {
                                            conn_id,
                                            user_id: if user_id.is_empty() {
                                                frame.sender_id.clone()
                                            } else {
                                                user_id.clone()
                                            },
                                        })
                                        .await;
                                    joined.insert(room_id.clone());

                                    // Forward room traffic to this connection,
                                    // skipping frames it originated itself.
                                    let forward_tx = out_tx.clone();
                                    forwarders.push(tokio::spawn(async move {
                                        loop {
                                            match rx.recv().await {
                                                Ok(env) => {
                                                    if env.origin == conn_id {
                                                        continue;
                                                    }
                                                    if forward_tx.send(env.bytes.clone()).await.is_err() {
                                                        break;
                                                    }
                                                }
                                                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                                    log::warn!("connection {conn_id} lagged by {n} frames");
                                                }
                                                Err(_) => break,
                                            }
                                        }
                                    }));

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = rooms.room_count().await;
                                    }
                                    log::info!("connection {conn_id} joined room {room_id}");
                                }

                                EventType::SendMessage => {
                                    let message = match frame.message() {
                                        Ok(m) => m,
                                        Err(e) => {
                                            log::warn!("dropping malformed message from {conn_id}: {e}");
                                            continue;
                                        }
                                    };
                                    let room_id = frame.room.clone();
                                    if room_id.is_empty() {
                                        log::warn!("message without room from {conn_id} dropped");
                                        continue;
                                    }
                                    // Re-frame for delivery; a room nobody joined
                                    // simply has no listeners.
                                    if let Some(group) = rooms.get(&room_id).await {
                                        match Frame::receive_message(&message)
                                            .and_then(|f| f.encode())
                                        {
                                            Ok(encoded) => {
                                                let reached = group.fan_out(conn_id, encoded);
                                                log::debug!(
                                                    "relayed message in {room_id} to {reached} connections"
                                                );
                                            }
                                            Err(e) => log::warn!("re-frame failed: {e}"),
                                        }
                                    } else {
                                        log::debug!("message to idle room {room_id} dropped");
                                    }
                                }

                                EventType::SendBroadcast => {
                                    let message = match frame.message() {
                                        Ok(m) => m,
                                        Err(e) => {
                                            log::warn!("dropping malformed broadcast from {conn_id}: {e}");
                                            continue;
                                        }
                                    };
                                    let room_id = frame.room.clone();
                                    if RoleRoom::from_role_str(&room_id).is_none() {
                                        log::warn!("broadcast to unknown room {room_id:?} dropped");
                                        continue;
                                    }
                                    if let Some(group) = rooms.get(&room_id).await {
                                        match Frame::broadcast_message(room_id.clone(), &message)
                                            .and_then(|f| f.encode())
                                        {
                                            Ok(encoded) => {
                                                let reached = group.fan_out(conn_id, encoded);
                                                log::debug!(
                                                    "broadcast in {room_id} reached {reached} connections"
                                                );
                                            }
                                            Err(e) => log::warn!("re-frame failed: {e}"),
                                        }
                                    } else {
                                        log::debug!("broadcast to idle room {room_id} dropped");
                                    }
                                }

                                EventType::Ping => {
                                    let pong = Frame::pong(frame.sender_id.clone());
                                    if let Ok(encoded) = pong.encode() {
                                        if let Err(e) =
                                            ws_sender.send(Message::Binary(encoded.into())).await
                                        {
                                            log::debug!("pong to {conn_id} failed: {e}");
                                            break;
                                        }
                                    }
                                }

                                other => {
                                    log::debug!("unhandled event {other:?} from {conn_id}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {conn_id} closed");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::debug!("pong to {conn_id} failed: {e}");
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {conn_id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Room traffic destined for this connection. A failed send
                // means the socket is gone; break so room membership and
                // stats are still cleaned up below.
                out = out_rx.recv() => {
                    match out {
                        Some(bytes) => {
                            if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                                log::debug!("forward to {conn_id} failed: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Cleanup: leave every joined room, dropping rooms that became empty
        for handle in forwarders {
            handle.abort();
        }
        for room_id in &joined {
            if let Some(group) = rooms.get(room_id).await {
                group.remove_peer(&conn_id).await;
                if rooms.remove_if_empty(room_id).await {
                    log::info!("room {room_id} removed (empty)");
                }
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = rooms.room_count().await;
        }

        Ok(())
    }

    /// Relay statistics snapshot.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
