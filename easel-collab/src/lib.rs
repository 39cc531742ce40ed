//! # easel-collab — serverless sync engine for the Easel whiteboard
//!
//! Keeps one peer's observable document store convergent with a shared,
//! peer-replicated CRDT document, with no central authority.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ user edits  ┌──────────────────┐  origin-tagged txns
//! │  BoardStore  │────────────►│ LocalChangePump  │─────────┐
//! │ (easel-store)│             └──────────────────┘         ▼
//! │              │ merge batch ┌──────────────────┐   ┌────────────┐
//! │              │◄────────────│ RemoteChangePump │◄──│ DocAdapter │
//! └──────┬───────┘             └──────────────────┘   │  (yrs Doc) │
//!        │ session scope                              └─────┬──────┘
//!        ▼                                                  │ updates
//! ┌─────────────────┐   awareness side-channel   ┌──────────▼──────┐
//! │ PresenceChannel │◄──────────────────────────►│  PeerTransport  │
//! └─────────────────┘                            │  (mesh │ relay) │
//!                                                └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`translator`] — record ⇄ keyed-entry codec
//! - [`adapter`] — the shared CRDT document (content map + meta record)
//! - [`pump`] — the local/remote change pumps and their echo guard
//! - [`presence`] — awareness publishing and remote presence mirroring
//! - [`guard`] — schema seeding, verification, migration, fatal handling
//! - [`session`] — per-room connection lifecycle and status
//! - [`transport`] — the peer transport contract and room addressing
//! - [`mesh`] — in-process transport for tests and local demos
//! - [`protocol`] / [`relay`] — binary wire protocol and WebSocket client
//!
//! ## Guarantees
//!
//! - Peers applying the same operations in any delivery order converge to
//!   the same record set (inherited from yrs' causal merge).
//! - A local edit is never echoed back into the store by the remote pump.
//! - A remote diff lands in the store as exactly one merge-scoped batch.
//! - Schema divergence never silently corrupts a document: it either
//!   migrates cleanly or the session goes fatal and must be recreated.

pub mod adapter;
pub mod guard;
pub mod mesh;
pub mod presence;
pub mod protocol;
pub mod pump;
pub mod relay;
pub mod session;
pub mod translator;
pub mod transport;

// Re-exports for convenience
pub use adapter::{AdapterChange, AdapterDiff, AdapterError, ChangeKind, DocAdapter};
pub use guard::{GuardState, SchemaFatal, SchemaGuard};
pub use mesh::{MeshHub, MeshTransport};
pub use presence::{color_for_client, PresenceChannel, UserPrefs, PRESENCE_FIELD};
pub use protocol::{MessageKind, ProtocolError, RelayMessage};
pub use pump::{LocalChangePump, RemoteChangePump};
pub use relay::{RelayConfig, RelayTransport};
pub use session::{CollabSession, ConnectionStatus, SessionStatus};
pub use translator::{decode_record, encode_record, TranslateError};
pub use transport::{
    AwarenessDiff, PeerTransport, RoomError, RoomId, TransportError, TransportEvent,
    TransportSubscription, DEFAULT_SIGNALING_ENDPOINT,
};
