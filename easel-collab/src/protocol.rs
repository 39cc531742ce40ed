//! Binary wire protocol for the relay transport.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ kind     │ client_id │ room     │ payload  │
//! │ 1 byte   │ 8 bytes   │ variable │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The payload varies by kind: an encoded CRDT update for `Update` and
//! `SyncStep2`, a state vector for `SyncStep1`, a JSON awareness state for
//! `Awareness`, and empty otherwise.

use serde::{Deserialize, Serialize};

/// Message kinds for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// State vector request: "send me what I'm missing".
    SyncStep1 = 1,
    /// State diff response.
    SyncStep2 = 2,
    /// Incremental CRDT update.
    Update = 3,
    /// Awareness (presence) state update.
    Awareness = 4,
    /// Peer joined notification.
    PeerJoined = 5,
    /// Peer left notification.
    PeerLeft = 6,
    /// Heartbeat ping.
    Ping = 7,
    /// Heartbeat pong.
    Pong = 8,
}

/// Top-level relay protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub kind: MessageKind,
    /// Transport-assigned numeric id of the sender.
    pub client_id: u64,
    pub room: String,
    pub payload: Vec<u8>,
}

impl RelayMessage {
    pub fn update(client_id: u64, room: &str, update: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            client_id,
            room: room.to_string(),
            payload: update,
        }
    }

    pub fn sync_step1(client_id: u64, room: &str, state_vector: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncStep1,
            client_id,
            room: room.to_string(),
            payload: state_vector,
        }
    }

    pub fn sync_step2(client_id: u64, room: &str, state_diff: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncStep2,
            client_id,
            room: room.to_string(),
            payload: state_diff,
        }
    }

    pub fn awareness(client_id: u64, room: &str, state: &serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Awareness,
            client_id,
            room: room.to_string(),
            payload: serde_json::to_vec(state).unwrap_or_default(),
        }
    }

    pub fn peer_joined(client_id: u64, room: &str) -> Self {
        Self {
            kind: MessageKind::PeerJoined,
            client_id,
            room: room.to_string(),
            payload: Vec::new(),
        }
    }

    pub fn peer_left(client_id: u64, room: &str) -> Self {
        Self {
            kind: MessageKind::PeerLeft,
            client_id,
            room: room.to_string(),
            payload: Vec::new(),
        }
    }

    pub fn ping(client_id: u64) -> Self {
        Self {
            kind: MessageKind::Ping,
            client_id,
            room: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn pong(client_id: u64) -> Self {
        Self {
            kind: MessageKind::Pong,
            client_id,
            room: String::new(),
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the awareness payload.
    pub fn awareness_state(&self) -> Result<serde_json::Value, ProtocolError> {
        if self.kind != MessageKind::Awareness {
            return Err(ProtocolError::InvalidKind);
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    InvalidKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::InvalidKind => write!(f, "invalid message kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
