//! In-process mesh transport.
//!
//! A [`MeshHub`] keeps one room per room id and fans document updates and
//! awareness changes out to every other peer in the room, synchronously on
//! the caller's thread. The hub also retains each room's update history and
//! replays it to late joiners before reporting `Connected`, so the schema
//! guard always runs against the room's current state.
//!
//! This is the transport the test suites run against, and the reference
//! semantics a real transport has to match: membership loss synthesizes
//! the awareness `removed` diff, updates are delivered to N-1 peers, and
//! a sender never receives its own messages back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::transport::{
    AwarenessDiff, PeerTransport, RoomId, TransportCallback, TransportError, TransportEvent,
    TransportSubscription,
};

type ListenerList = Arc<Mutex<Vec<(u64, TransportCallback)>>>;

struct PeerEndpoint {
    listeners: ListenerList,
}

#[derive(Default)]
struct RoomState {
    peers: Mutex<HashMap<u64, PeerEndpoint>>,
    history: Mutex<Vec<Vec<u8>>>,
    awareness: Mutex<HashMap<u64, serde_json::Value>>,
}

impl RoomState {
    /// Deliver an event to every connected peer except `sender`.
    ///
    /// Callback lists are cloned out before invocation so no hub lock is
    /// held while peer code runs.
    fn deliver_to_others(&self, sender: u64, event: &TransportEvent) {
        let endpoints: Vec<ListenerList> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .filter(|(id, _)| **id != sender)
                .map(|(_, endpoint)| endpoint.listeners.clone())
                .collect()
        };
        for listeners in endpoints {
            let callbacks: Vec<TransportCallback> = {
                let listeners = listeners.lock().unwrap();
                listeners.iter().map(|(_, cb)| cb.clone()).collect()
            };
            for callback in callbacks {
                callback(event);
            }
        }
    }
}

/// Registry of in-process rooms. Every transport handed out by the same
/// hub can reach every other transport in the same room.
pub struct MeshHub {
    rooms: Mutex<HashMap<String, Arc<RoomState>>>,
    next_client: AtomicU64,
}

impl MeshHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        })
    }

    /// Create a transport for one peer in `room`, with a hub-assigned
    /// client id.
    pub fn transport(self: &Arc<Self>, room: &RoomId) -> Arc<MeshTransport> {
        let state = {
            let mut rooms = self.rooms.lock().unwrap();
            rooms
                .entry(room.as_str().to_string())
                .or_insert_with(|| Arc::new(RoomState::default()))
                .clone()
        };
        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        Arc::new(MeshTransport {
            room: state,
            room_id: room.clone(),
            client_id,
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_sub: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        })
    }

    /// Number of connected peers in `room`.
    pub fn peer_count(&self, room: &RoomId) -> usize {
        let rooms = self.rooms.lock().unwrap();
        rooms
            .get(room.as_str())
            .map(|state| state.peers.lock().unwrap().len())
            .unwrap_or(0)
    }
}

/// One peer's endpoint into a mesh room.
pub struct MeshTransport {
    room: Arc<RoomState>,
    room_id: RoomId,
    client_id: u64,
    listeners: ListenerList,
    next_sub: AtomicU64,
    connected: AtomicBool,
}

impl MeshTransport {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Invoke this transport's own subscribers.
    fn deliver_to_self(&self, event: &TransportEvent) {
        let callbacks: Vec<TransportCallback> = {
            let listeners = self.listeners.lock().unwrap();
            listeners.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

impl PeerTransport for MeshTransport {
    fn client_id(&self) -> u64 {
        self.client_id
    }

    fn connect(&self) -> Result<(), TransportError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Replay the room's history so this peer converges before the
        // Connected event triggers schema reconciliation.
        let history: Vec<Vec<u8>> = self.room.history.lock().unwrap().clone();
        let replayed = history.len();
        for update in history {
            self.deliver_to_self(&TransportEvent::RemoteUpdate(update));
        }
        log::info!(
            "client {} joined room '{}' ({replayed} update(s) replayed)",
            self.client_id,
            self.room_id
        );
        self.deliver_to_self(&TransportEvent::Connected);
        eprintln!("DBG mesh: delivered Connected, locking peers");

        self.room.peers.lock().unwrap().insert(
            self.client_id,
            PeerEndpoint {
                listeners: self.listeners.clone(),
            },
        );
        eprintln!("DBG mesh: inserted peer, delivering PeerJoined");
        self.room
            .deliver_to_others(self.client_id, &TransportEvent::PeerJoined(self.client_id));
        eprintln!("DBG mesh: connect done");
        Ok(())
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        self.room.peers.lock().unwrap().remove(&self.client_id);
        self.room.awareness.lock().unwrap().remove(&self.client_id);

        // Membership loss drives presence removal on the other peers.
        self.room.deliver_to_others(
            self.client_id,
            &TransportEvent::Awareness(AwarenessDiff {
                removed: vec![self.client_id],
                ..Default::default()
            }),
        );
        self.room
            .deliver_to_others(self.client_id, &TransportEvent::PeerLeft(self.client_id));

        log::info!("client {} left room '{}'", self.client_id, self.room_id);
        self.deliver_to_self(&TransportEvent::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn broadcast_update(&self, update: Vec<u8>) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        self.room.history.lock().unwrap().push(update.clone());
        self.room
            .deliver_to_others(self.client_id, &TransportEvent::RemoteUpdate(update));
    }

    fn set_awareness_field(&self, field: &str, value: serde_json::Value) {
        if !self.connected.load(Ordering::SeqCst) {
            // Awareness is ephemeral; nothing to publish while offline.
            return;
        }

        let newly_added = {
            let mut awareness = self.room.awareness.lock().unwrap();
            let newly_added = !awareness.contains_key(&self.client_id);
            let state = awareness
                .entry(self.client_id)
                .or_insert_with(|| serde_json::json!({}));
            state[field] = value;
            newly_added
        };

        let diff = if newly_added {
            AwarenessDiff {
                added: vec![self.client_id],
                ..Default::default()
            }
        } else {
            AwarenessDiff {
                updated: vec![self.client_id],
                ..Default::default()
            }
        };
        self.room
            .deliver_to_others(self.client_id, &TransportEvent::Awareness(diff));
    }

    fn awareness_states(&self) -> HashMap<u64, serde_json::Value> {
        self.room.awareness.lock().unwrap().clone()
    }

    fn subscribe(&self, callback: TransportCallback) -> TransportSubscription {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((id, callback));

        let listeners: Weak<Mutex<Vec<(u64, TransportCallback)>>> =
            Arc::downgrade(&self.listeners);
        TransportSubscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().unwrap().retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
