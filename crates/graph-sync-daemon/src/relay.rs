//! WebSocket relay client implementing the realtime transport.
//!
//! Joins `<relay>/rooms/<room>`, sends a handshake and reports `Connected`
//! once the relay answers with its own. Every other binary frame is a
//! document update. A dropped connection is retried with exponential
//! backoff until `disconnect`.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use graph_sync::RoomId;
use graph_sync::TransportStatus;
use graph_sync::providers::{RealtimeTransport, Result, TransportError, TransportEvent};
use reqwest::Url;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Build `<base>/rooms/<room>` with the room percent-encoded.
pub fn room_url(base: &str, room: &RoomId) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| TransportError::ConnectionFailed(format!("invalid relay url {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::ConnectionFailed(format!("relay url {base} cannot be a base")))?
        .pop_if_empty()
        .push("rooms")
        .push(room.as_str());
    Ok(url)
}

struct Shared {
    status: Mutex<TransportStatus>,
    write: AsyncMutex<Option<SplitSink<WsStream, Message>>>,
}

impl Shared {
    fn set_status(&self, status: TransportStatus, events: &mpsc::UnboundedSender<TransportEvent>) {
        {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!("Relay status: {:?}", status);
        let _ = events.send(TransportEvent::Status(status));
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct RelayTransport {
    base_url: String,
    peer_id: String,
    reconnect: ReconnectConfig,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTransport {
    pub fn new(base_url: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            peer_id: peer_id.into(),
            reconnect: ReconnectConfig::default(),
            shared: Arc::new(Shared {
                status: Mutex::new(TransportStatus::Disconnected),
                write: AsyncMutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn stop_task(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.stop_task();
    }
}

#[async_trait]
impl RealtimeTransport for RelayTransport {
    async fn connect(&self, room: &RoomId) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        self.disconnect().await;

        let url = room_url(&self.base_url, room)?;
        let (tx, rx) = mpsc::unbounded_channel();
        info!("Joining relay room at {}", url);

        let task = tokio::spawn(run_connection(
            url,
            self.peer_id.clone(),
            room.clone(),
            self.reconnect.clone(),
            Arc::clone(&self.shared),
            tx,
        ));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.stop_task();
        if let Some(mut write) = self.shared.write.lock().await.take() {
            let _ = write.send(Message::Close(None)).await;
        }
        *self.shared.status.lock().unwrap_or_else(|e| e.into_inner()) = TransportStatus::Disconnected;
    }

    async fn publish(&self, update: Vec<u8>) -> Result<()> {
        if self.shared.status() != TransportStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let mut write = self.shared.write.lock().await;
        let sink = write.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Binary(update.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn status(&self) -> TransportStatus {
        self.shared.status()
    }
}

/// Connect, pump frames until the connection drops, back off, repeat.
async fn run_connection(
    url: Url,
    peer_id: String,
    room: RoomId,
    config: ReconnectConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut attempts: u32 = 0;
    loop {
        shared.set_status(TransportStatus::Connecting, &events);

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                let (mut write, read) = ws_stream.split();
                let handshake = HandshakeMessage::new(&peer_id, "client", room.as_str());
                match write.send(Message::Binary(handshake.to_binary().into())).await {
                    Ok(()) => {
                        *shared.write.lock().await = Some(write);
                        if read_loop(&room, read, &shared, &events).await {
                            attempts = 0;
                        }
                        shared.write.lock().await.take();
                    }
                    Err(e) => warn!("Failed to send handshake to relay: {}", e),
                }
            }
            Err(e) => warn!("Failed to connect to relay {}: {}", url, e),
        }

        shared.set_status(TransportStatus::Disconnected, &events);
        if events.is_closed() {
            debug!("Transport receiver dropped, stopping relay connection");
            return;
        }

        attempts += 1;
        if config.max_attempts.is_some_and(|max| attempts > max) {
            error!("Giving up on relay {} after {} attempts", url, attempts - 1);
            return;
        }
        let delay = calculate_backoff(attempts, &config);
        info!("Reconnecting to relay in {:?} (attempt {})", delay, attempts);
        tokio::time::sleep(delay).await;
    }
}

/// Forward frames until the connection ends. Returns whether the relay
/// accepted the join.
async fn read_loop(
    room: &RoomId,
    mut read: SplitStream<WsStream>,
    shared: &Shared,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> bool {
    let mut joined = false;
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from relay");
                        break;
                    }
                    Message::Frame(_) => continue,
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Relay frame exceeds max size ({} > {}), dropping",
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }

                if let Some(handshake) = HandshakeMessage::from_binary(&data) {
                    if handshake.room != room.as_str() {
                        warn!("Relay joined us to room {}, expected {}", handshake.room, room);
                        break;
                    }
                    debug!("Relay {} accepted join", handshake.peer_id);
                    joined = true;
                    shared.set_status(TransportStatus::Connected, events);
                } else if joined {
                    let _ = events.send(TransportEvent::Update(data));
                } else {
                    debug!("Dropping frame received before join");
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Relay connection closed");
                    }
                    _ => {
                        error!("WebSocket error on relay connection: {}", e);
                    }
                }
                break;
            }
            None => {
                debug!("Relay stream ended");
                break;
            }
        }
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = ReconnectConfig::default();

        // 1s, 2s, 4s, ... capped at 60s
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(7, &config), Duration::from_secs(60));
        assert_eq!(calculate_backoff(20, &config), Duration::from_secs(60));
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 3.0,
            max_attempts: Some(3),
        };

        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(300));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(900));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(1));
    }

    #[test]
    fn test_room_url() {
        let room = RoomId::new("team board").unwrap();
        assert_eq!(
            room_url("ws://relay.local:9000/", &room).unwrap().as_str(),
            "ws://relay.local:9000/rooms/team%20board"
        );
        assert!(room_url("not a url", &room).is_err());
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let transport = RelayTransport::new("ws://127.0.0.1:1", "peer");
        assert_eq!(transport.status(), TransportStatus::Disconnected);
        assert!(matches!(
            transport.publish(vec![1]).await,
            Err(TransportError::NotConnected)
        ));
    }
}
