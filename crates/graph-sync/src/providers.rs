//! Providers attached to a session's document: the realtime transport that
//! relays updates between peers of a room, and the durable local cache.
//!
//! Implementations:
//! - `LoopbackTransport` - For testing; peers of one `LoopbackHub` see each other
//! - `RelayTransport` (in graph-sync-daemon) - WebSocket relay client

use crate::connectivity::TransportStatus;
use crate::document::GraphDocument;
use crate::ids::RoomId;
use crate::storage::{self, BlobStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// What a transport reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(TransportStatus),
    /// Encoded document update from another peer.
    Update(Vec<u8>),
}

/// Room-scoped peer channel for document updates.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Join a room. Status changes and remote updates arrive on the returned
    /// receiver until `disconnect`.
    async fn connect(&self, room: &RoomId) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn disconnect(&self);

    /// Broadcast an encoded update to the other peers of the room.
    async fn publish(&self, update: Vec<u8>) -> Result<()>;

    fn status(&self) -> TransportStatus;
}

struct LoopbackPeer {
    room: RoomId,
    tx: mpsc::UnboundedSender<TransportEvent>,
    link_up: bool,
}

/// In-process relay shared by `LoopbackTransport`s.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    peers: Arc<Mutex<HashMap<usize, LoopbackPeer>>>,
    next_id: Arc<AtomicUsize>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            peer: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn with_peers<T>(&self, f: impl FnOnce(&mut HashMap<usize, LoopbackPeer>) -> T) -> T {
        f(&mut self.peers.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Transport double relaying through a `LoopbackHub`.
pub struct LoopbackTransport {
    hub: LoopbackHub,
    peer: usize,
}

impl LoopbackTransport {
    /// Simulate the link dropping or recovering without leaving the room.
    pub fn set_link_up(&self, up: bool) {
        self.hub.with_peers(|peers| {
            let Some(peer) = peers.get_mut(&self.peer) else {
                return;
            };
            if peer.link_up == up {
                return;
            }
            peer.link_up = up;
            let statuses: &[TransportStatus] = if up {
                &[TransportStatus::Connecting, TransportStatus::Connected]
            } else {
                &[TransportStatus::Disconnected]
            };
            for status in statuses {
                let _ = peer.tx.send(TransportEvent::Status(*status));
            }
        });
    }
}

#[async_trait]
impl RealtimeTransport for LoopbackTransport {
    async fn connect(&self, room: &RoomId) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Status(TransportStatus::Connecting));
        let _ = tx.send(TransportEvent::Status(TransportStatus::Connected));
        self.hub.with_peers(|peers| {
            peers.insert(
                self.peer,
                LoopbackPeer {
                    room: room.clone(),
                    tx,
                    link_up: true,
                },
            );
        });
        debug!("Loopback peer {} joined room {}", self.peer, room);
        Ok(rx)
    }

    async fn disconnect(&self) {
        if let Some(peer) = self.hub.with_peers(|peers| peers.remove(&self.peer)) {
            let _ = peer.tx.send(TransportEvent::Status(TransportStatus::Disconnected));
        }
    }

    async fn publish(&self, update: Vec<u8>) -> Result<()> {
        self.hub.with_peers(|peers| {
            let room = match peers.get(&self.peer) {
                Some(me) if me.link_up => me.room.clone(),
                _ => return Err(TransportError::NotConnected),
            };
            for (id, peer) in peers.iter() {
                if *id != self.peer && peer.link_up && peer.room == room {
                    let _ = peer.tx.send(TransportEvent::Update(update.clone()));
                }
            }
            Ok(())
        })
    }

    fn status(&self) -> TransportStatus {
        self.hub.with_peers(|peers| match peers.get(&self.peer) {
            Some(peer) if peer.link_up => TransportStatus::Connected,
            _ => TransportStatus::Disconnected,
        })
    }
}

/// Durable local copy of a room's document, kept in the blob store under
/// `cache/<room>.loro`.
pub struct DocumentCache {
    store: Arc<dyn BlobStore>,
    key: String,
    ready: watch::Sender<bool>,
}

impl DocumentCache {
    pub fn new(room: &RoomId, store: Arc<dyn BlobStore>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            store,
            key: storage::room_key("cache", room, "loro"),
            ready,
        }
    }

    /// Import the cached snapshot, if any, and fire the readiness signal.
    ///
    /// An unreadable cache is discarded rather than failing the session.
    /// Returns whether cached state was imported.
    pub async fn load_into(&self, doc: &GraphDocument) -> storage::Result<bool> {
        let loaded = match storage::read_optional(&*self.store, &self.key).await? {
            Some(bytes) => match doc.import(&bytes) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Discarding unreadable document cache {}: {}", self.key, e);
                    false
                }
            },
            None => false,
        };
        self.ready.send_replace(true);
        Ok(loaded)
    }

    pub async fn save(&self, doc: &GraphDocument) -> storage::Result<()> {
        let snapshot = doc
            .export_snapshot()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.write(&self.key, &snapshot).await
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the cache has been loaded.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}
