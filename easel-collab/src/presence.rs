//! The presence/awareness channel.
//!
//! Publishes the local peer's ephemeral state (identity, color, cursor,
//! selection) to the transport's awareness side-channel, and mirrors remote
//! peers' states into transient presence records in the store.
//!
//! ```text
//!  session-scope store change           awareness diff from transport
//!        │                                        │
//!        ▼                                        ▼
//!  derive presence record                 upsert/remove presence
//!        │  (coalesced to one                     records as ONE
//!        ▼   paint frame interval)                merge batch
//!  transport.set_awareness_field("presence", …)
//! ```
//!
//! The local presence value is a pure projection of the user preferences
//! and the session's instance record, recomputed on every relevant store
//! change. Publishes are coalesced: at most one per frame interval, with
//! explicit forced publishes on connect and preference edits.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use easel_store::{
    BoardStore, ChangeSet, Point, PresenceRecord, Record, RecordId, StoreFilter,
    StoreSubscription,
};

use crate::transport::{
    AwarenessDiff, PeerTransport, TransportCallback, TransportEvent, TransportSubscription,
};

/// Awareness state field carrying the serialized presence record. Remote
/// states without this field are ignored, not errors.
pub const PRESENCE_FIELD: &str = "presence";

/// Publish coalescing interval: one paint frame at ~30fps.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(33);

/// Stable color derived from a transport client id.
pub fn color_for_client(client_id: u64) -> String {
    let r = (client_id & 0xff) as u8;
    let g = ((client_id >> 8) & 0xff) as u8;
    let b = ((client_id >> 16) & 0xff) as u8;
    format!("#{r:02x}{g:02x}{b:02x}")
}

/// The local user's identity preferences. The id is fixed per session
/// (derived from the transport client id); name and color are editable.
#[derive(Clone, Debug, PartialEq)]
pub struct UserPrefs {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl UserPrefs {
    pub fn for_client(client_id: u64) -> Self {
        Self {
            id: client_id.to_string(),
            name: format!("Guest {}", client_id % 10_000),
            color: color_for_client(client_id),
        }
    }
}

/// Subscriptions held while the channel is attached. Dropping detaches.
pub struct PresenceAttachment {
    _store_sub: StoreSubscription,
    _transport_sub: TransportSubscription,
}

/// Bridges local presence out to the awareness channel and remote
/// presence into the store.
pub struct PresenceChannel {
    store: Arc<BoardStore>,
    transport: Arc<dyn PeerTransport>,
    prefs: RwLock<UserPrefs>,
    presence_id: RecordId,
    client_id: u64,
    last_publish: Mutex<Instant>,
    publish_interval: Duration,
}

impl PresenceChannel {
    pub fn new(store: Arc<BoardStore>, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let client_id = transport.client_id();
        Arc::new(Self {
            store,
            transport,
            prefs: RwLock::new(UserPrefs::for_client(client_id)),
            presence_id: RecordId::presence_for_client(client_id),
            client_id,
            // Backdated so the first publish is never coalesced away.
            last_publish: Mutex::new(Instant::now() - Duration::from_secs(1)),
            publish_interval: PUBLISH_INTERVAL,
        })
    }

    /// Publish the initial presence, mirror peers already in the room, and
    /// subscribe to both sides of the channel.
    pub fn attach(self: &Arc<Self>) -> PresenceAttachment {
        self.publish(true);
        self.mirror_existing_peers();

        let channel = self.clone();
        let store_sub = self.store.listen(
            StoreFilter::session_changes(),
            Arc::new(move |_batch: &ChangeSet| {
                channel.publish(false);
            }),
        );

        let channel = self.clone();
        let callback: TransportCallback = Arc::new(move |event| {
            if let TransportEvent::Awareness(diff) = event {
                channel.handle_awareness(diff);
            }
        });
        let transport_sub = self.transport.subscribe(callback);

        PresenceAttachment {
            _store_sub: store_sub,
            _transport_sub: transport_sub,
        }
    }

    /// Recompute and publish the local presence projection.
    ///
    /// Unforced publishes within one frame interval of the previous one
    /// are dropped; the next store change republishes the latest state.
    pub fn publish(&self, force: bool) {
        {
            let mut last = self.last_publish.lock().unwrap();
            if !force && last.elapsed() < self.publish_interval {
                log::trace!("presence publish coalesced");
                return;
            }
            *last = Instant::now();
        }

        let presence = self.derive();
        match serde_json::to_value(&presence) {
            Ok(value) => self.transport.set_awareness_field(PRESENCE_FIELD, value),
            Err(e) => log::warn!("presence serialization failed: {e}"),
        }
    }

    /// Update the editable user preferences and republish immediately.
    pub fn update_prefs(&self, name: Option<String>, color: Option<String>) {
        {
            let mut prefs = self.prefs.write().unwrap();
            if let Some(name) = name {
                prefs.name = name;
            }
            if let Some(color) = color {
                prefs.color = color;
            }
        }
        self.publish(true);
    }

    pub fn prefs(&self) -> UserPrefs {
        self.prefs.read().unwrap().clone()
    }

    pub fn presence_id(&self) -> &RecordId {
        &self.presence_id
    }

    /// The presence projection: user preferences + the session's instance
    /// state, folded into one record.
    fn derive(&self) -> PresenceRecord {
        let prefs = self.prefs.read().unwrap();
        let instance = self.store.all_records().into_iter().find_map(|r| match r {
            Record::Instance(instance) => Some(instance),
            _ => None,
        });
        let (cursor, selected, page_id) = match instance {
            Some(instance) => (instance.cursor, instance.selected, instance.page_id),
            None => (Point::ZERO, Vec::new(), None),
        };

        PresenceRecord {
            id: self.presence_id.clone(),
            user_id: prefs.id.clone(),
            user_name: prefs.name.clone(),
            color: prefs.color.clone(),
            cursor,
            selected,
            page_id,
        }
    }

    /// Treat every peer already in the room as newly added. Run once on
    /// attach, since their awareness states predate our subscription.
    fn mirror_existing_peers(&self) {
        let added: Vec<u64> = self
            .transport
            .awareness_states()
            .keys()
            .copied()
            .filter(|id| *id != self.client_id)
            .collect();
        if added.is_empty() {
            return;
        }
        self.handle_awareness(&AwarenessDiff {
            added,
            ..Default::default()
        });
    }

    /// Mirror one awareness diff into the store as one merge batch.
    fn handle_awareness(&self, diff: &AwarenessDiff) {
        let states = self.transport.awareness_states();
        let mut puts = Vec::new();
        let mut removes = Vec::new();

        for client_id in diff.added.iter().chain(diff.updated.iter()) {
            if *client_id == self.client_id {
                continue;
            }
            let Some(state) = states.get(client_id) else {
                continue;
            };
            match state.get(PRESENCE_FIELD) {
                Some(value) => match serde_json::from_value::<PresenceRecord>(value.clone()) {
                    Ok(presence) => puts.push(Record::Presence(presence)),
                    Err(e) => {
                        log::warn!("malformed presence from client {client_id}: {e}")
                    }
                },
                // A state without a presence field is stale, not an error.
                None => log::trace!("client {client_id} has no presence yet"),
            }
        }

        for client_id in &diff.removed {
            removes.push(RecordId::presence_for_client(*client_id));
        }

        if puts.is_empty() && removes.is_empty() {
            return;
        }
        self.store.merge_remote(|batch| {
            batch.put_many(puts);
            for id in removes {
                batch.remove(id);
            }
        });
    }
}
