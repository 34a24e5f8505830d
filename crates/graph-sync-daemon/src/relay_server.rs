//! WebSocket relay: fans document updates out to the other members of a room.
//!
//! Clients connect, send a `HandshakeMessage` naming their room, and get the
//! relay's handshake back once they are registered. From then on every
//! binary frame they send is forwarded verbatim to the rest of the room. The
//! relay never decodes updates.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// How long a new connection may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Members = HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>;

#[derive(Clone, Default)]
struct Rooms {
    inner: Arc<Mutex<HashMap<String, Members>>>,
}

impl Rooms {
    fn join(&self, room: &str, conn_id: u64, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.lock().entry(room.to_string()).or_default().insert(conn_id, tx);
    }

    fn leave(&self, room: &str, conn_id: u64) {
        let mut rooms = self.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    fn forward(&self, room: &str, from: u64, data: &[u8]) {
        if let Some(members) = self.lock().get(room) {
            for (conn_id, tx) in members {
                if *conn_id != from {
                    let _ = tx.send(data.to_vec());
                }
            }
        }
    }

    fn size(&self, room: &str) -> usize {
        self.lock().get(room).map_or(0, HashMap::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Members>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct RelayServer {
    peer_id: String,
    listener: TcpListener,
    rooms: Rooms,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    /// Bind to an address, e.g. `127.0.0.1:0` for an ephemeral port.
    pub async fn bind(listen_addr: &str, peer_id: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self {
            peer_id: peer_id.into(),
            listener,
            rooms: Rooms::default(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is cancelled. Cancelling also
    /// closes every open connection.
    pub async fn run(self) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        let rooms = self.rooms.clone();
                        let peer_id = self.peer_id.clone();
                        connections.spawn(async move {
                            handle_connection(stream, addr, conn_id, rooms, peer_id).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    /// Run in the background.
    pub fn spawn(self) -> Result<RelayHandle> {
        let addr = self.local_addr()?;
        let rooms = self.rooms.clone();
        let task = tokio::spawn(self.run());
        Ok(RelayHandle { addr, rooms, task })
    }
}

/// A relay running in the background. Dropping it shuts the relay down.
pub struct RelayHandle {
    addr: SocketAddr,
    rooms: Rooms,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` base URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Connected members of `room`.
    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.size(room)
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, conn_id: u64, rooms: Rooms, peer_id: String) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Health checks connect and close without upgrading.
            debug!("WebSocket upgrade failed for {}: {}", addr, e);
            return;
        }
    };
    debug!("New relay connection from {} (conn-{})", addr, conn_id);

    let (mut write, mut read) = ws_stream.split();

    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut read)).await {
        Ok(Some(handshake)) => handshake,
        Ok(None) => {
            debug!("conn-{} closed before handshake", conn_id);
            return;
        }
        Err(_) => {
            warn!("conn-{} sent no handshake within {:?}", conn_id, HANDSHAKE_TIMEOUT);
            return;
        }
    };
    let room = handshake.room;

    // Join before acknowledging; frames forwarded meanwhile queue behind the reply.
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    rooms.join(&room, conn_id, tx);
    let reply = HandshakeMessage::new(&peer_id, "relay", &room);
    if let Err(e) = write.send(Message::Binary(reply.to_binary().into())).await {
        warn!("Failed to answer handshake from conn-{}: {}", conn_id, e);
        rooms.leave(&room, conn_id);
        return;
    }
    info!("Peer {} joined room {} (conn-{})", handshake.peer_id, room, conn_id);

    let writer = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if write.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = read.next().await {
        let data = match frame {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("conn-{} read error: {}", conn_id, e);
                break;
            }
        };
        if data.len() > MAX_MESSAGE_SIZE {
            warn!("Frame from conn-{} exceeds max size, dropping", conn_id);
            continue;
        }
        if HandshakeMessage::from_binary(&data).is_some() {
            debug!("Ignoring repeated handshake from conn-{}", conn_id);
            continue;
        }
        rooms.forward(&room, conn_id, &data);
    }

    rooms.leave(&room, conn_id);
    writer.abort();
    info!("Peer {} left room {} (conn-{})", handshake.peer_id, room, conn_id);
}

async fn read_handshake<S>(read: &mut S) -> Option<HandshakeMessage>
where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                if let Some(handshake) = HandshakeMessage::from_binary(&data) {
                    return Some(handshake);
                }
                debug!("Dropping frame received before handshake");
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}
