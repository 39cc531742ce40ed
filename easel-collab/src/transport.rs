//! The peer transport contract.
//!
//! A [`PeerTransport`] delivers replicated CRDT document updates to every
//! peer in a room and carries the ephemeral awareness side-channel (per-peer
//! presence states keyed by a transport-assigned numeric client id). The
//! sync engine never talks to the network directly; it only sees this
//! contract. Two implementations ship with the crate:
//!
//! - [`crate::mesh`] — an in-process mesh used by tests and local demos
//! - [`crate::relay`] — a WebSocket client speaking to an external
//!   rendezvous/relay server
//!
//! Events may start flowing synchronously from inside `connect()`, so
//! callers must `subscribe()` before connecting.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

/// Default rendezvous endpoint for deployments that do not configure one.
pub const DEFAULT_SIGNALING_ENDPOINT: &str = "ws://localhost:4444";

/// Client ids added/updated/removed in one awareness change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AwarenessDiff {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Events emitted by a transport to its subscribers.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The transport is connected and the initial document state has been
    /// delivered. Safe to reconcile schema and attach observers.
    Connected,
    /// The transport lost or closed its connection.
    Disconnected,
    /// A replicated document update from a remote peer.
    RemoteUpdate(Vec<u8>),
    /// Remote awareness states changed.
    Awareness(AwarenessDiff),
    /// A peer joined the room.
    PeerJoined(u64),
    /// A peer left the room.
    PeerLeft(u64),
}

pub type TransportCallback = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Handle for a transport event subscription. Unsubscribes on drop.
pub struct TransportSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TransportSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(self) {
        // Drop does the actual removal.
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Clone, Debug)]
pub enum TransportError {
    Connect(String),
    NotConnected,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(detail) => write!(f, "transport connect failed: {detail}"),
            Self::NotConnected => write!(f, "transport is not connected"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Room-scoped peer transport with a replicated document channel and an
/// awareness side-channel.
pub trait PeerTransport: Send + Sync {
    /// The transport-assigned numeric id of the local client.
    fn client_id(&self) -> u64;

    /// Start delivering events. Subscribers registered before this call
    /// receive the replayed room state followed by `Connected`.
    fn connect(&self) -> Result<(), TransportError>;

    /// Stop delivering events and announce departure to the room.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Fan a document update out to every other peer in the room.
    fn broadcast_update(&self, update: Vec<u8>);

    /// Set one field of the local client's awareness state and publish it.
    fn set_awareness_field(&self, field: &str, value: serde_json::Value);

    /// Current awareness states of every client in the room, including the
    /// local one.
    fn awareness_states(&self) -> HashMap<u64, serde_json::Value>;

    /// Subscribe to transport events.
    fn subscribe(&self, callback: TransportCallback) -> TransportSubscription;
}

#[derive(Clone, Debug)]
pub enum RoomError {
    /// The room segment was empty; callers should redirect to the room
    /// selection entry point.
    Empty,
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "room id must not be empty"),
        }
    }
}

impl std::error::Error for RoomError {}

/// Opaque room identifier, addressed as the `/board/:room` path segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(room: impl Into<String>) -> Result<Self, RoomError> {
        let room = room.into();
        if room.is_empty() {
            return Err(RoomError::Empty);
        }
        Ok(Self(room))
    }

    /// Parse a room id out of a `/board/:room` path.
    pub fn from_path(path: &str) -> Result<Self, RoomError> {
        let segment = path
            .strip_prefix("/board/")
            .unwrap_or(path)
            .trim_matches('/');
        Self::new(segment)
    }

    /// A fresh random room, for the "create board" entry point.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The shareable URL for this room under `base` (no trailing slash).
    pub fn share_url(&self, base: &str) -> String {
        format!("{base}/board/{}", self.0)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
