//! WebSocket relay transport.
//!
//! Connects to an external rendezvous/relay server that fans
//! [`RelayMessage`]s out to every peer in the same room (the server itself
//! is deployment infrastructure, not part of this crate). The transport
//! keeps the [`PeerTransport`] contract: events are delivered to
//! subscribers on the tokio runtime's worker, document state exchange is
//! driven by the session, and awareness states are tracked per client id.
//!
//! Connect handshake: announce `PeerJoined`, request missing state with
//! `SyncStep1`, then report `Connected` after a `SyncStep2` arrives or a
//! short grace period elapses (first peer in an empty room).
//!
//! `connect()` spawns the reader/writer tasks and therefore must be called
//! from within a tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{MessageKind, RelayMessage};
use crate::transport::{
    AwarenessDiff, PeerTransport, RoomId, TransportCallback, TransportError, TransportEvent,
    TransportSubscription, DEFAULT_SIGNALING_ENDPOINT,
};

/// How long a fresh connection waits for a `SyncStep2` before concluding
/// it is alone in the room.
const SYNC_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Rendezvous endpoint, e.g. `ws://collab.example:4444`.
    pub endpoint: String,
    pub room: RoomId,
}

impl RelayConfig {
    pub fn new(room: RoomId) -> Self {
        Self {
            endpoint: DEFAULT_SIGNALING_ENDPOINT.to_string(),
            room,
        }
    }

    pub fn with_endpoint(room: RoomId, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            room,
        }
    }
}

type ListenerList = Arc<Mutex<Vec<(u64, TransportCallback)>>>;

struct RelayInner {
    config: RelayConfig,
    client_id: u64,
    connected: AtomicBool,
    listeners: ListenerList,
    next_sub: AtomicU64,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    awareness: Mutex<HashMap<u64, serde_json::Value>>,
}

impl RelayInner {
    fn deliver(&self, event: &TransportEvent) {
        let callbacks: Vec<TransportCallback> = {
            let listeners = self.listeners.lock().unwrap();
            listeners.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    fn send(&self, message: &RelayMessage) {
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("dropping unencodable relay message: {e}");
                return;
            }
        };
        let outgoing = self.outgoing.lock().unwrap();
        if let Some(tx) = outgoing.as_ref() {
            let _ = tx.send(encoded);
        }
    }

    /// Process one inbound message. Returns `true` if it completed the
    /// initial sync handshake.
    fn handle_message(&self, message: RelayMessage) -> bool {
        // The relay may echo the room; never process our own messages.
        if message.client_id == self.client_id {
            return false;
        }

        match message.kind {
            MessageKind::Update => {
                self.deliver(&TransportEvent::RemoteUpdate(message.payload));
                false
            }
            MessageKind::SyncStep2 => {
                self.deliver(&TransportEvent::RemoteUpdate(message.payload));
                true
            }
            MessageKind::SyncStep1 => {
                // State requests are answered by the relay server, which
                // holds the room's authoritative byte-state.
                false
            }
            MessageKind::Awareness => match message.awareness_state() {
                Ok(state) => {
                    let newly_added = {
                        let mut awareness = self.awareness.lock().unwrap();
                        awareness.insert(message.client_id, state).is_none()
                    };
                    let diff = if newly_added {
                        AwarenessDiff {
                            added: vec![message.client_id],
                            ..Default::default()
                        }
                    } else {
                        AwarenessDiff {
                            updated: vec![message.client_id],
                            ..Default::default()
                        }
                    };
                    self.deliver(&TransportEvent::Awareness(diff));
                    false
                }
                Err(e) => {
                    log::warn!("malformed awareness from client {}: {e}", message.client_id);
                    false
                }
            },
            MessageKind::PeerJoined => {
                self.deliver(&TransportEvent::PeerJoined(message.client_id));
                false
            }
            MessageKind::PeerLeft => {
                self.awareness.lock().unwrap().remove(&message.client_id);
                self.deliver(&TransportEvent::Awareness(AwarenessDiff {
                    removed: vec![message.client_id],
                    ..Default::default()
                }));
                self.deliver(&TransportEvent::PeerLeft(message.client_id));
                false
            }
            MessageKind::Ping => {
                self.send(&RelayMessage::pong(self.client_id));
                false
            }
            MessageKind::Pong => false,
        }
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            *self.outgoing.lock().unwrap() = None;
            self.deliver(&TransportEvent::Disconnected);
        }
    }
}

/// WebSocket client implementing [`PeerTransport`] against a relay server.
pub struct RelayTransport {
    inner: Arc<RelayInner>,
}

impl RelayTransport {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                // Transport-assigned numeric client id, random per session.
                client_id: Uuid::new_v4().as_u128() as u64,
                connected: AtomicBool::new(false),
                listeners: Arc::new(Mutex::new(Vec::new())),
                next_sub: AtomicU64::new(1),
                outgoing: Mutex::new(None),
                awareness: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }
}

impl PeerTransport for RelayTransport {
    fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    fn connect(&self) -> Result<(), TransportError> {
        let inner = self.inner.clone();
        let url = format!(
            "{}/{}",
            inner.config.endpoint,
            inner.config.room.as_str()
        );

        tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::connect_async(&url).await {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    log::warn!("relay connect to {url} failed: {e}");
                    inner.deliver(&TransportEvent::Disconnected);
                    return;
                }
            };
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            // Writer task: forward the outgoing channel to the socket.
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if ws_writer
                        .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                let _ = ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Close(None))
                    .await;
            });

            *inner.outgoing.lock().unwrap() = Some(out_tx);
            inner.connected.store(true, Ordering::SeqCst);

            let room = inner.config.room.as_str().to_string();
            inner.send(&RelayMessage::peer_joined(inner.client_id, &room));
            // Empty state vector: ask for the room's full state.
            inner.send(&RelayMessage::sync_step1(inner.client_id, &room, Vec::new()));

            // Initial sync: forward inbound state until a SyncStep2 lands
            // or the grace period says we are first in the room.
            let deadline = tokio::time::Instant::now() + SYNC_GRACE;
            loop {
                let message = tokio::select! {
                    message = ws_reader.next() => message,
                    _ = tokio::time::sleep_until(deadline) => {
                        log::info!("no peers answered within grace period; treating room as fresh");
                        break;
                    }
                };
                match message {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayMessage::decode(&bytes) {
                            Ok(message) => {
                                if inner.handle_message(message) {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("dropping malformed relay frame: {e}"),
                        }
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                        inner.mark_disconnected();
                        return;
                    }
                    Some(Err(_)) => {
                        inner.mark_disconnected();
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
            inner.deliver(&TransportEvent::Connected);

            // Steady-state read loop.
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayMessage::decode(&bytes) {
                            Ok(message) => {
                                inner.handle_message(message);
                            }
                            Err(e) => log::warn!("dropping malformed relay frame: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            inner.mark_disconnected();
        });

        Ok(())
    }

    fn disconnect(&self) {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return;
        }
        let room = self.inner.config.room.as_str().to_string();
        self.inner
            .send(&RelayMessage::peer_left(self.inner.client_id, &room));
        self.inner.mark_disconnected();
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn broadcast_update(&self, update: Vec<u8>) {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return;
        }
        let room = self.inner.config.room.as_str().to_string();
        self.inner
            .send(&RelayMessage::update(self.inner.client_id, &room, update));
    }

    fn set_awareness_field(&self, field: &str, value: serde_json::Value) {
        let state = {
            let mut awareness = self.inner.awareness.lock().unwrap();
            let state = awareness
                .entry(self.inner.client_id)
                .or_insert_with(|| serde_json::json!({}));
            state[field] = value;
            state.clone()
        };
        if !self.inner.connected.load(Ordering::SeqCst) {
            // Awareness is ephemeral; nothing to publish while offline.
            return;
        }
        let room = self.inner.config.room.as_str().to_string();
        self.inner.send(&RelayMessage::awareness(
            self.inner.client_id,
            &room,
            &state,
        ));
    }

    fn awareness_states(&self) -> HashMap<u64, serde_json::Value> {
        self.inner.awareness.lock().unwrap().clone()
    }

    fn subscribe(&self, callback: TransportCallback) -> TransportSubscription {
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().unwrap().push((id, callback));

        let listeners: Weak<Mutex<Vec<(u64, TransportCallback)>>> =
            Arc::downgrade(&self.inner.listeners);
        TransportSubscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().unwrap().retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn config() -> RelayConfig {
        RelayConfig::new(RoomId::new("test-room").unwrap())
    }

    #[test]
    fn test_default_endpoint() {
        let transport = RelayTransport::new(config());
        assert_eq!(transport.config().endpoint, DEFAULT_SIGNALING_ENDPOINT);
        assert_eq!(transport.config().room.as_str(), "test-room");
    }

    #[test]
    fn test_initial_state() {
        let transport = RelayTransport::new(config());
        assert!(!transport.is_connected());
        assert!(transport.awareness_states().is_empty());
    }

    #[test]
    fn test_client_ids_are_random() {
        let a = RelayTransport::new(config());
        let b = RelayTransport::new(config());
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_offline_broadcast_is_dropped() {
        let transport = RelayTransport::new(config());
        // Not connected: both are silent no-ops.
        transport.broadcast_update(vec![1, 2, 3]);
        transport.set_awareness_field("presence", serde_json::json!({"x": 1}));
        // The local state is still tracked for the next connect.
        assert_eq!(transport.awareness_states().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_disconnected() {
        let transport = RelayTransport::new(RelayConfig::with_endpoint(
            RoomId::new("test-room").unwrap(),
            "ws://127.0.0.1:1",
        ));

        let disconnects = Arc::new(AtomicUsize::new(0));
        let disconnects_clone = disconnects.clone();
        let _sub = transport.subscribe(Arc::new(move |event| {
            if matches!(event, TransportEvent::Disconnected) {
                disconnects_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        transport.connect().unwrap();
        for _ in 0..50 {
            if disconnects.load(Ordering::SeqCst) > 0 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_events() {
        let transport = RelayTransport::new(RelayConfig::with_endpoint(
            RoomId::new("test-room").unwrap(),
            "ws://127.0.0.1:1",
        ));

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub = transport.subscribe(Arc::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        sub.unsubscribe();

        transport.connect().unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
