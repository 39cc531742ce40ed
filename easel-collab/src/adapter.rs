//! The CRDT document adapter.
//!
//! Owns the shared `yrs::Doc` and the two replicated maps inside it: the
//! content map (record id → JSON-encoded record) and the meta map (the
//! single schema descriptor entry). All mutation goes through origin-tagged
//! transactions so observers can tell locally issued batches from remotely
//! replicated ones; the origin tag is what breaks the echo loop between
//! the local and remote change pumps.
//!
//! Conflict semantics are inherited from yrs, never reimplemented here:
//! concurrent writes to the same key converge to one value on every peer
//! (last-writer-wins under the causal clock, ties broken by client id).

use easel_store::{Record, RecordId, SchemaDescriptor};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, Map, MapRef, Observable, Origin, Out, ReadTxn, StateVector, Subscription, Transact,
    TransactionMut, Update,
};

use crate::translator::{
    decode_descriptor, decode_raw, decode_record, encode_descriptor, encode_record, TranslateError,
};

/// Name of the shared keyed collection holding document records. Part of
/// the replicated document's shape: every peer must use the same name.
pub const CONTENT_MAP: &str = "easel_records";

/// Name of the shared map holding the meta record.
pub const META_MAP: &str = "easel_meta";

/// Well-known key of the schema descriptor inside the meta map.
pub const META_SCHEMA_KEY: &str = "schema";

/// Origin tag on transactions issued by this peer.
const LOCAL_ORIGIN: &str = "easel:local";

/// Origin tag on transactions that apply a replicated remote update.
const REMOTE_ORIGIN: &str = "easel:remote";

#[derive(Clone, Debug)]
pub enum AdapterError {
    Decode(String),
    Apply(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(detail) => write!(f, "update decode failed: {detail}"),
            Self::Apply(detail) => write!(f, "update apply failed: {detail}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// How one key changed in a diff. Mirrors the add/update/delete
/// classification the remote change pump applies to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

/// One changed key in an observed diff. `record` carries the current value
/// for adds and updates, and is `None` for deletes.
#[derive(Clone, Debug)]
pub struct AdapterChange {
    pub key: String,
    pub kind: ChangeKind,
    pub record: Option<Record>,
}

/// One observed transaction's worth of content changes.
#[derive(Clone, Debug)]
pub struct AdapterDiff {
    /// Whether the transaction was issued by this peer (local origin tag).
    pub is_local: bool,
    pub changes: Vec<AdapterChange>,
}

/// Write handle scoped to one local transaction. All writes made through
/// the same handle commit atomically and reach observers as one diff.
pub struct AdapterWriter<'a, 'doc> {
    content: &'a MapRef,
    meta: &'a MapRef,
    txn: &'a mut TransactionMut<'doc>,
}

impl AdapterWriter<'_, '_> {
    pub fn set(&mut self, record: &Record) -> Result<(), TranslateError> {
        let entry = encode_record(record)?;
        self.content
            .insert(&mut *self.txn, record.id().as_str(), entry);
        Ok(())
    }

    pub fn delete(&mut self, id: &RecordId) {
        self.content.remove(&mut *self.txn, id.as_str());
    }

    pub fn set_schema(&mut self, descriptor: &SchemaDescriptor) -> Result<(), TranslateError> {
        let entry = encode_descriptor(descriptor)?;
        self.meta.insert(&mut *self.txn, META_SCHEMA_KEY, entry);
        Ok(())
    }
}

/// Adapter over the shared CRDT document for one session.
pub struct DocAdapter {
    doc: Doc,
    content: MapRef,
    meta: MapRef,
}

impl DocAdapter {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create the adapter with an explicit CRDT client id, so same-key
    /// write ties break on the transport's peer id ordering.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let content = doc.get_or_insert_map(CONTENT_MAP);
        let meta = doc.get_or_insert_map(META_MAP);
        Self { doc, content, meta }
    }

    /// Run `f` inside one locally originated transaction. The whole batch
    /// commits atomically and reaches observers as a single diff tagged
    /// with the local origin.
    pub fn transact_local<R>(&self, f: impl FnOnce(&mut AdapterWriter) -> R) -> R {
        let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
        let mut writer = AdapterWriter {
            content: &self.content,
            meta: &self.meta,
            txn: &mut txn,
        };
        let result = f(&mut writer);
        drop(txn); // commit; observers fire here
        result
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        let txn = self.doc.transact();
        let entry = self
            .content
            .get(&txn, id.as_str())?
            .cast::<String>()
            .ok()?;
        match decode_record(&entry) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("undecodable entry under '{id}': {e}");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.content.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let txn = self.doc.transact();
        self.content.keys(&txn).map(String::from).collect()
    }

    /// Raw JSON values of every entry, for migration passes that run
    /// before the record shape is trusted. Undecodable entries are logged
    /// and skipped.
    pub fn snapshot_values(&self) -> Vec<serde_json::Value> {
        let txn = self.doc.transact();
        let keys: Vec<String> = self.content.keys(&txn).map(String::from).collect();
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(entry) = self
                .content
                .get(&txn, &key)
                .and_then(|v| v.cast::<String>().ok())
            else {
                log::warn!("entry under '{key}' is not a string value");
                continue;
            };
            match decode_raw(&entry) {
                Ok(value) => values.push(value),
                Err(e) => log::warn!("undecodable entry under '{key}': {e}"),
            }
        }
        values
    }

    /// The schema descriptor from the meta record, if one has been written.
    pub fn meta_schema(&self) -> Option<SchemaDescriptor> {
        let txn = self.doc.transact();
        let entry = self
            .meta
            .get(&txn, META_SCHEMA_KEY)?
            .cast::<String>()
            .ok()?;
        match decode_descriptor(&entry) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                log::warn!("undecodable meta record: {e}");
                None
            }
        }
    }

    /// Observe content diffs. One callback per committed transaction, with
    /// every changed key classified and the origin flag resolved.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AdapterDiff) + Send + Sync + 'static,
    {
        let local_origin: Origin = LOCAL_ORIGIN.into();
        self.content.observe(move |txn, event| {
            let is_local = txn.origin() == Some(&local_origin);
            let mut changes = Vec::new();
            for (key, change) in event.keys(txn) {
                let key = key.to_string();
                match change {
                    yrs::types::EntryChange::Inserted(value) => changes.push(AdapterChange {
                        record: decode_entry(&key, value),
                        key,
                        kind: ChangeKind::Add,
                    }),
                    yrs::types::EntryChange::Updated(_, value) => changes.push(AdapterChange {
                        record: decode_entry(&key, value),
                        key,
                        kind: ChangeKind::Update,
                    }),
                    yrs::types::EntryChange::Removed(_) => changes.push(AdapterChange {
                        key,
                        kind: ChangeKind::Delete,
                        record: None,
                    }),
                }
            }
            if changes.is_empty() {
                return;
            }
            callback(&AdapterDiff { is_local, changes });
        })
    }

    /// Observe changes to the meta record.
    pub fn observe_meta<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.meta.observe(move |_txn, _event| callback())
    }

    /// Observe encoded document updates for broadcast to the transport.
    ///
    /// Updates that were themselves applied from a remote peer carry the
    /// remote origin and are not forwarded, so received updates are never
    /// echoed back out.
    pub fn observe_updates<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let remote_origin: Origin = REMOTE_ORIGIN.into();
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote_origin) {
                    return;
                }
                callback(&event.update);
            })
            .expect("failed to observe document updates")
    }

    /// Apply an update received from a peer, inside a remote-tagged
    /// transaction.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), AdapterError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| AdapterError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(decoded)
            .map_err(|e| AdapterError::Apply(e.to_string()))
    }

    /// The full document state as one update, for seeding late joiners.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// The local state vector, for targeted diff requests.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, AdapterError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| AdapterError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }
}

impl Default for DocAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_entry(key: &str, value: &Out) -> Option<Record> {
    let entry = value.clone().cast::<String>().ok()?;
    match decode_record(&entry) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("undecodable entry under '{key}' in diff: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_store::{Record, ShapeKind, ShapeRecord, StoreSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn shape() -> Record {
        Record::Shape(ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0, 10.0, 10.0))
    }

    #[test]
    fn test_set_get_delete() {
        let adapter = DocAdapter::new();
        let record = shape();
        let id = record.id().clone();

        adapter.transact_local(|w| w.set(&record)).unwrap();
        assert_eq!(adapter.get(&id), Some(record));
        assert_eq!(adapter.len(), 1);

        adapter.transact_local(|w| w.delete(&id));
        assert_eq!(adapter.get(&id), None);
        assert!(adapter.is_empty());
    }

    #[test]
    fn test_meta_schema_roundtrip() {
        let adapter = DocAdapter::new();
        assert!(adapter.meta_schema().is_none());

        let descriptor = StoreSchema::current().serialize();
        adapter
            .transact_local(|w| w.set_schema(&descriptor))
            .unwrap();
        assert_eq!(adapter.meta_schema(), Some(descriptor));
    }

    #[test]
    fn test_observer_classifies_changes() {
        let adapter = DocAdapter::new();
        let diffs: Arc<Mutex<Vec<AdapterDiff>>> = Arc::new(Mutex::new(Vec::new()));
        let diffs_clone = diffs.clone();
        let _sub = adapter.observe(move |diff| {
            diffs_clone.lock().unwrap().push(diff.clone());
        });

        let mut record = ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0, 10.0, 10.0);
        let id = record.id.clone();

        adapter
            .transact_local(|w| w.set(&Record::Shape(record.clone())))
            .unwrap();
        record.rotation = 1.0;
        adapter
            .transact_local(|w| w.set(&Record::Shape(record.clone())))
            .unwrap();
        adapter.transact_local(|w| w.delete(&id));

        let diffs = diffs.lock().unwrap();
        assert_eq!(diffs.len(), 3);
        assert!(diffs.iter().all(|d| d.is_local));
        assert_eq!(diffs[0].changes[0].kind, ChangeKind::Add);
        assert_eq!(diffs[1].changes[0].kind, ChangeKind::Update);
        assert_eq!(diffs[2].changes[0].kind, ChangeKind::Delete);
        assert!(diffs[0].changes[0].record.is_some());
        assert!(diffs[2].changes[0].record.is_none());
    }

    #[test]
    fn test_batch_commits_as_one_diff() {
        let adapter = DocAdapter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = adapter.observe(move |diff| {
            assert_eq!(diff.changes.len(), 3);
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        adapter.transact_local(|w| {
            w.set(&shape()).unwrap();
            w.set(&shape()).unwrap();
            w.set(&shape()).unwrap();
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remote_update_is_tagged_remote() {
        let a = DocAdapter::with_client_id(1);
        let b = DocAdapter::with_client_id(2);

        let record = shape();
        let id = record.id().clone();
        a.transact_local(|w| w.set(&record)).unwrap();

        let seen_local = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen_local.clone();
        let _sub = b.observe(move |diff| {
            seen_clone.lock().unwrap().push(diff.is_local);
        });

        b.apply_remote_update(&a.encode_state_as_update()).unwrap();

        assert_eq!(b.get(&id), Some(record));
        assert_eq!(*seen_local.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_received_updates_are_not_rebroadcast() {
        let a = DocAdapter::with_client_id(1);
        let b = DocAdapter::with_client_id(2);

        a.transact_local(|w| w.set(&shape())).unwrap();

        let broadcasts = Arc::new(AtomicUsize::new(0));
        let broadcasts_clone = broadcasts.clone();
        let _sub = b.observe_updates(move |_| {
            broadcasts_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Applying a remote update must not look like a local update.
        b.apply_remote_update(&a.encode_state_as_update()).unwrap();
        assert_eq!(broadcasts.load(Ordering::SeqCst), 0);

        // A genuinely local write still broadcasts.
        b.transact_local(|w| w.set(&shape())).unwrap();
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_same_key_writes_converge() {
        let a = DocAdapter::with_client_id(1);
        let b = DocAdapter::with_client_id(2);

        let mut record = ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0, 10.0, 10.0);
        let id = record.id.clone();

        // Both peers write the same key concurrently.
        record.bounds.width = 111.0;
        a.transact_local(|w| w.set(&Record::Shape(record.clone())))
            .unwrap();
        record.bounds.width = 222.0;
        b.transact_local(|w| w.set(&Record::Shape(record.clone())))
            .unwrap();

        // Cross-apply in both directions.
        let update_a = a.encode_state_as_update();
        let update_b = b.encode_state_as_update();
        a.apply_remote_update(&update_b).unwrap();
        b.apply_remote_update(&update_a).unwrap();

        // Whichever write won, both peers agree on it.
        assert_eq!(a.get(&id), b.get(&id));
        assert!(a.get(&id).is_some());
    }

    #[test]
    fn test_encode_diff_targets_missing_state() {
        let a = DocAdapter::with_client_id(1);
        let b = DocAdapter::with_client_id(2);

        a.transact_local(|w| w.set(&shape())).unwrap();
        b.apply_remote_update(&a.encode_state_as_update()).unwrap();

        let record = shape();
        let id = record.id().clone();
        a.transact_local(|w| w.set(&record)).unwrap();

        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert_eq!(b.get(&id), Some(record));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_snapshot_values() {
        let adapter = DocAdapter::new();
        let record = shape();
        adapter.transact_local(|w| w.set(&record)).unwrap();

        let values = adapter.snapshot_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["id"], record.id().as_str());
        assert_eq!(values[0]["type"], "shape");
    }
}
