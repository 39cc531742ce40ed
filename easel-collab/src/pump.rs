//! The bidirectional change pumps.
//!
//! ```text
//!  user edit                                   remote peer
//!      │                                            │
//!      ▼                                            ▼
//!  BoardStore ──(user/document)──► LocalChangePump  │
//!      ▲                               │            │
//!      │                               ▼            ▼
//!      │                          DocAdapter ◄── transport
//!      │                               │
//!      └──(merge batch)── RemoteChangePump ◄─(non-local diff)
//! ```
//!
//! The local pump forwards user document edits into one CRDT transaction
//! per batch, tagged with the local origin. The remote pump observes
//! adapter diffs, drops locally originated ones (the echo guard), and
//! applies the rest to the store as one merge-scoped batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use easel_store::{BoardStore, ChangeSet, RecordId, StoreFilter, StoreSubscription};
use yrs::Subscription;

use crate::adapter::{ChangeKind, DocAdapter};

/// Forwards user-originated document-scope store changes into the CRDT
/// document.
pub struct LocalChangePump;

impl LocalChangePump {
    /// Attach the pump. The subscription detaches it on drop.
    ///
    /// `halted` freezes the pump without detaching it, used when the
    /// session hits a fatal schema state inside an observer callback.
    pub fn attach(
        store: &Arc<BoardStore>,
        adapter: &Arc<DocAdapter>,
        halted: Arc<AtomicBool>,
    ) -> StoreSubscription {
        let adapter = adapter.clone();
        store.listen(
            StoreFilter::user_document(),
            Arc::new(move |batch: &ChangeSet| {
                if halted.load(Ordering::SeqCst) {
                    return;
                }
                adapter.transact_local(|w| {
                    for record in batch.added.values() {
                        if let Err(e) = w.set(record) {
                            log::warn!("dropping unencodable record {}: {e}", record.id());
                        }
                    }
                    for (_, record) in batch.updated.values() {
                        if let Err(e) = w.set(record) {
                            log::warn!("dropping unencodable record {}: {e}", record.id());
                        }
                    }
                    for id in batch.removed.keys() {
                        w.delete(id);
                    }
                });
            }),
        )
    }
}

/// Applies non-local CRDT diffs to the store as merge-scoped batches.
pub struct RemoteChangePump;

impl RemoteChangePump {
    pub fn attach(
        store: &Arc<BoardStore>,
        adapter: &Arc<DocAdapter>,
        halted: Arc<AtomicBool>,
    ) -> Subscription {
        let store = store.clone();
        adapter.observe(move |diff| {
            // The critical guard: our own transactions come back through
            // this observer too, and must not re-enter the store.
            if diff.is_local {
                return;
            }
            if halted.load(Ordering::SeqCst) {
                return;
            }

            let mut puts = Vec::new();
            let mut removes = Vec::new();
            for change in &diff.changes {
                match change.kind {
                    ChangeKind::Add | ChangeKind::Update => match &change.record {
                        Some(record) => puts.push(record.clone()),
                        None => {
                            log::warn!("skipping undecodable remote entry '{}'", change.key)
                        }
                    },
                    ChangeKind::Delete => removes.push(RecordId::from_raw(change.key.clone())),
                }
            }

            if puts.is_empty() && removes.is_empty() {
                return;
            }
            log::trace!(
                "applying remote diff: {} put(s), {} remove(s)",
                puts.len(),
                removes.len()
            );
            store.merge_remote(|batch| {
                batch.put_many(puts);
                for id in removes {
                    batch.remove(id);
                }
            });
        })
    }
}
