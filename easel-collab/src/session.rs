//! The collaboration session: one room, one store, one shared document.
//!
//! `CollabSession` is the session-scoped context object that wires every
//! component together for the lifetime of one room connection:
//!
//! ```text
//!  transport Connected
//!        │
//!        ▼
//!  SchemaGuard::reconcile ──fatal──► status Fatal (session must be
//!        │                            discarded and recreated)
//!        ▼
//!  attach: meta observer → update broadcaster → remote pump
//!          → local pump → presence channel
//!        │
//!        ▼
//!  status synced-remote/online … steady-state sync …
//!        │
//!  transport Disconnected
//!        ▼
//!  detach in reverse order, status synced-remote/offline
//! ```
//!
//! There is no global state: every session owns its adapter, guard and
//! presence channel, created on connect and dropped with the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use easel_store::{BoardStore, StoreSubscription};
use yrs::Subscription;

use crate::adapter::DocAdapter;
use crate::guard::{GuardState, SchemaFatal, SchemaGuard};
use crate::presence::{PresenceAttachment, PresenceChannel, UserPrefs};
use crate::pump::{LocalChangePump, RemoteChangePump};
use crate::transport::{PeerTransport, TransportEvent, TransportSubscription};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// The session's externally visible status, mirroring the store-with-status
/// shape the editing surface consumes.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionStatus {
    Loading,
    SyncedRemote { connection: ConnectionStatus },
    /// Unrecoverable schema condition. The embedding application must
    /// discard this session and acquire a fresh one, which re-enters
    /// schema reconciliation from scratch.
    Fatal(SchemaFatal),
}

pub type StatusCallback = Arc<dyn Fn(&SessionStatus) + Send + Sync>;

/// Everything attached while online, torn down in reverse order.
enum Attachment {
    Store(StoreSubscription),
    Crdt(Subscription),
    Presence(PresenceAttachment),
}

pub struct CollabSession {
    store: Arc<BoardStore>,
    adapter: Arc<DocAdapter>,
    transport: Arc<dyn PeerTransport>,
    guard: Arc<SchemaGuard>,
    presence: Arc<PresenceChannel>,
    /// Set on fatal schema conditions: freezes the pumps in place, since
    /// subscriptions cannot be dropped from inside their own callbacks.
    halted: Arc<AtomicBool>,
    status: RwLock<SessionStatus>,
    status_listeners: Mutex<Vec<StatusCallback>>,
    attachments: Mutex<Vec<Attachment>>,
    /// Weak self-reference for observer closures, set once at connect.
    self_weak: RwLock<Weak<CollabSession>>,
    _transport_sub: Mutex<Option<TransportSubscription>>,
}

impl CollabSession {
    /// Create a session over `store` and connect it through `transport`.
    ///
    /// The transport's own connected/disconnected events drive the rest of
    /// the lifecycle; by the time this returns on an in-process transport,
    /// the session is already reconciled and online.
    pub fn connect(
        store: Arc<BoardStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, crate::transport::TransportError> {
        let adapter = Arc::new(DocAdapter::with_client_id(transport.client_id()));
        let guard = Arc::new(SchemaGuard::new(store.clone(), adapter.clone()));
        let presence = PresenceChannel::new(store.clone(), transport.clone());

        let session = Arc::new(Self {
            store,
            adapter,
            transport: transport.clone(),
            guard,
            presence,
            halted: Arc::new(AtomicBool::new(false)),
            status: RwLock::new(SessionStatus::Loading),
            status_listeners: Mutex::new(Vec::new()),
            attachments: Mutex::new(Vec::new()),
            self_weak: RwLock::new(Weak::new()),
            _transport_sub: Mutex::new(None),
        });
        *session.self_weak.write().unwrap() = Arc::downgrade(&session);

        let weak = Arc::downgrade(&session);
        let sub = transport.subscribe(Arc::new(move |event| {
            if let Some(session) = weak.upgrade() {
                session.handle_transport_event(event);
            }
        }));
        *session._transport_sub.lock().unwrap() = Some(sub);

        transport.connect()?;
        Ok(session)
    }

    pub fn store(&self) -> &Arc<BoardStore> {
        &self.store
    }

    pub fn adapter(&self) -> &Arc<DocAdapter> {
        &self.adapter
    }

    pub fn client_id(&self) -> u64 {
        self.transport.client_id()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.read().unwrap().clone()
    }

    pub fn schema_state(&self) -> GuardState {
        self.guard.state()
    }

    /// Subscribe to status changes for the lifetime of the session.
    pub fn on_status(&self, callback: StatusCallback) {
        self.status_listeners.lock().unwrap().push(callback);
    }

    pub fn user_prefs(&self) -> UserPrefs {
        self.presence.prefs()
    }

    /// Update the local user's name/color and republish presence.
    pub fn update_user_prefs(&self, name: Option<String>, color: Option<String>) {
        self.presence.update_prefs(name, color);
    }

    /// Leave the room: detach observers (reverse order) and go offline.
    /// The local store keeps its last-known state, read-only with respect
    /// to remote updates until a new session connects.
    pub fn disconnect(&self) {
        self.transport.disconnect();
        // The transport event normally drives teardown; if it was already
        // disconnected (e.g. after a fatal), tear down directly.
        self.teardown_attachments();
    }

    fn handle_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected => self.handle_connected(),
            TransportEvent::Disconnected => self.handle_disconnected(),
            TransportEvent::RemoteUpdate(update) => {
                if self.halted.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = self.adapter.apply_remote_update(update) {
                    log::warn!("dropping malformed remote update: {e}");
                }
            }
            TransportEvent::PeerJoined(client_id) => {
                log::info!("peer {client_id} joined");
                if self.halted.load(Ordering::SeqCst) {
                    return;
                }
                // Push our full state and presence so the newcomer
                // converges without a dedicated handshake.
                self.transport
                    .broadcast_update(self.adapter.encode_state_as_update());
                self.presence.publish(true);
            }
            TransportEvent::PeerLeft(client_id) => {
                log::info!("peer {client_id} left");
            }
            // Consumed by the presence channel's own subscription.
            TransportEvent::Awareness(_) => {}
        }
    }

    fn handle_connected(&self) {
        eprintln!("DBG: handle_connected start");
        if let Err(fatal) = self.guard.reconcile() {
            self.enter_fatal(fatal);
            return;
        }
        eprintln!("DBG: reconcile done");

        let mut attachments = self.attachments.lock().unwrap();
        eprintln!("DBG: attachments locked");

        // Meta observer first: schema divergence must be noticed even if
        // it races the very first pumped batches.
        let guard = self.guard.clone();
        let halted = self.halted.clone();
        let weak = self.self_weak.read().unwrap().clone();
        attachments.push(Attachment::Crdt(self.adapter.observe_meta(move || {
            if halted.load(Ordering::SeqCst) {
                return;
            }
            if let Err(fatal) = guard.verify_meta() {
                log::error!("schema diverged while online: {fatal}");
                if let Some(session) = weak.upgrade() {
                    session.enter_fatal(fatal);
                }
            }
        })));

        // Locally originated document updates go out to the room.
        let transport = self.transport.clone();
        let halted = self.halted.clone();
        attachments.push(Attachment::Crdt(self.adapter.observe_updates(
            move |update| {
                if halted.load(Ordering::SeqCst) {
                    return;
                }
                transport.broadcast_update(update.to_vec());
            },
        )));

        eprintln!("DBG: observers attached");
        attachments.push(Attachment::Crdt(RemoteChangePump::attach(
            &self.store,
            &self.adapter,
            self.halted.clone(),
        )));
        eprintln!("DBG: remote pump attached");
        attachments.push(Attachment::Store(LocalChangePump::attach(
            &self.store,
            &self.adapter,
            self.halted.clone(),
        )));
        eprintln!("DBG: local pump attached");
        attachments.push(Attachment::Presence(self.presence.attach()));
        eprintln!("DBG: presence attached");
        drop(attachments);

        // Anything written before the broadcaster attached (seeding, a
        // reconciling migration) still has to reach the room.
        self.transport
            .broadcast_update(self.adapter.encode_state_as_update());
        eprintln!("DBG: broadcast done");

        self.set_status(SessionStatus::SyncedRemote {
            connection: ConnectionStatus::Online,
        });
        eprintln!("DBG: handle_connected returning");
    }

    fn handle_disconnected(&self) {
        self.teardown_attachments();
        if !matches!(self.status(), SessionStatus::Fatal(_)) {
            self.set_status(SessionStatus::SyncedRemote {
                connection: ConnectionStatus::Offline,
            });
        }
    }

    fn enter_fatal(&self, fatal: SchemaFatal) {
        log::error!("session fatal: {fatal}");
        self.halted.store(true, Ordering::SeqCst);
        self.set_status(SessionStatus::Fatal(fatal));
    }

    /// Detach everything in reverse order of attachment.
    fn teardown_attachments(&self) {
        let mut attachments = self.attachments.lock().unwrap();
        while let Some(attachment) = attachments.pop() {
            drop(attachment);
        }
    }

    fn set_status(&self, status: SessionStatus) {
        eprintln!("DBG: set_status enter");
        {
            let mut current = self.status.write().unwrap();
            eprintln!("DBG: set_status got write lock");
            if *current == status {
                return;
            }
            log::info!("session status: {status:?}");
            *current = status.clone();
        }
        eprintln!("DBG: set_status released write lock");
        let listeners: Vec<StatusCallback> = self.status_listeners.lock().unwrap().clone();
        eprintln!("DBG: set_status got listeners lock, n={}", listeners.len());
        for listener in listeners {
            listener(&status);
        }
        eprintln!("DBG: set_status done");
    }
}
