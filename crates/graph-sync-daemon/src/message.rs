//! Relay handshake messages.
//!
//! The handshake is JSON sent as a binary WebSocket frame (UTF-8 bytes).
//! Every other frame on a relay connection is an opaque document update.

use serde::{Deserialize, Serialize};

/// Maximum frame size (50MB) accepted from a relay connection.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Handshake exchanged when a client joins a room on the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    pub peer_id: String,

    /// "client" or "relay"
    pub role: String,

    /// Room the client joins; echoed back by the relay
    pub room: String,
}

impl HandshakeMessage {
    pub fn new(peer_id: &str, role: &str, room: &str) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            peer_id: peer_id.to_string(),
            role: role.to_string(),
            room: room.to_string(),
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as a binary frame.
    pub fn to_binary(&self) -> Vec<u8> {
        // A struct of plain strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a handshake, or `None` if the frame is anything else.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        if !is_likely_handshake(data) {
            return None;
        }
        let msg: Self = serde_json::from_slice(data).ok()?;
        (msg.msg_type == "handshake").then_some(msg)
    }
}

/// Quick check if data looks like a JSON handshake (starts with '{').
///
/// Loro update blobs never start with '{'.
pub fn is_likely_handshake(data: &[u8]) -> bool {
    data.first() == Some(&b'{')
}
