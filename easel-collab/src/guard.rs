//! The schema compatibility guard.
//!
//! Runs once per connection, before the change pumps attach:
//!
//! ```text
//!  shared sequence empty ──► Seeding ──────────────► Ready
//!  shared sequence has data ──► Verifying
//!        meta record missing ──────────────────────► Fatal
//!        migration check errors ──────────────────► Fatal
//!        migrations pending ──► Migrating
//!              transform fails ───────────────────► Fatal
//!              transform ok: rewrite shared state ► Ready
//!        no migrations: load shared snapshot ─────► Ready
//! ```
//!
//! While `Ready`, every observed meta record change re-runs the check; any
//! incompatibility is fatal. There is no online recovery from `Fatal`: the
//! in-memory CRDT state cannot be rolled back, so the only path out is a
//! fresh session, which re-enters this state machine from the top.

use std::sync::{Arc, RwLock};

use easel_store::{BoardStore, Record, RecordId, RecordScope, SchemaError};

use crate::adapter::DocAdapter;
use crate::translator::record_from_raw;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardState {
    Seeding,
    Verifying,
    Migrating,
    Ready,
    Fatal,
}

/// Unrecoverable schema conditions. All of them surface to the embedding
/// application as "reload the session".
#[derive(Clone, Debug, PartialEq)]
pub enum SchemaFatal {
    /// The shared sequence has data but no meta record: the document's
    /// schema is unknowable.
    MissingMetaRecord,
    /// The schema comparison itself failed (newer or alien descriptor).
    CheckFailed(SchemaError),
    /// A migration transform reported an error.
    MigrationFailed(SchemaError),
    /// A peer published a schema this build would need migrations to read.
    RemoteSchemaDiverged,
}

impl std::fmt::Display for SchemaFatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMetaRecord => {
                write!(f, "shared document has data but no schema meta record")
            }
            Self::CheckFailed(e) => write!(f, "schema check failed: {e}"),
            Self::MigrationFailed(e) => write!(f, "schema migration failed: {e}"),
            Self::RemoteSchemaDiverged => {
                write!(f, "a peer published an incompatible schema")
            }
        }
    }
}

impl std::error::Error for SchemaFatal {}

/// Reconciles the local store schema with the shared document's meta
/// record on connect, and re-verifies it on every later meta change.
pub struct SchemaGuard {
    store: Arc<BoardStore>,
    adapter: Arc<DocAdapter>,
    state: RwLock<GuardState>,
}

impl SchemaGuard {
    pub fn new(store: Arc<BoardStore>, adapter: Arc<DocAdapter>) -> Self {
        Self {
            store,
            adapter,
            state: RwLock::new(GuardState::Seeding),
        }
    }

    pub fn state(&self) -> GuardState {
        *self.state.read().unwrap()
    }

    fn enter(&self, next: GuardState) {
        let mut state = self.state.write().unwrap();
        log::debug!("schema guard: {:?} -> {next:?}", *state);
        *state = next;
    }

    /// Run the connect-time reconciliation.
    pub fn reconcile(&self) -> Result<(), SchemaFatal> {
        if self.adapter.is_empty() {
            self.seed();
            Ok(())
        } else {
            self.verify_and_load()
        }
    }

    /// First peer in an empty room: write every local document record and
    /// the schema descriptor into the shared document, in one transaction.
    fn seed(&self) {
        self.enter(GuardState::Seeding);

        let records: Vec<Record> = self
            .store
            .all_records()
            .into_iter()
            .filter(|r| r.scope() == RecordScope::Document)
            .collect();
        let descriptor = self.store.schema().serialize();
        let count = records.len();

        self.adapter.transact_local(|w| {
            for record in &records {
                if let Err(e) = w.set(record) {
                    log::warn!("seeding skipped record {}: {e}", record.id());
                }
            }
            if let Err(e) = w.set_schema(&descriptor) {
                log::warn!("seeding could not write schema descriptor: {e}");
            }
        });

        log::info!("seeded shared document with {count} record(s)");
        self.enter(GuardState::Ready);
    }

    /// Joining a room with existing data: verify the meta record, migrate
    /// the shared snapshot if needed, and load it into the local store.
    fn verify_and_load(&self) -> Result<(), SchemaFatal> {
        self.enter(GuardState::Verifying);

        let Some(persisted) = self.adapter.meta_schema() else {
            log::error!("shared document has data but no meta record");
            self.enter(GuardState::Fatal);
            return Err(SchemaFatal::MissingMetaRecord);
        };

        let schema = self.store.schema();
        let pending = match schema.migrations_since(&persisted) {
            Ok(pending) => pending,
            Err(e) => {
                self.enter(GuardState::Fatal);
                return Err(SchemaFatal::CheckFailed(e));
            }
        };
        let needs_migration = !pending.is_empty();
        if needs_migration {
            log::info!("running {} schema migration(s)", pending.len());
            self.enter(GuardState::Migrating);
        }

        let values = self.adapter.snapshot_values();
        let migrated = match schema.migrate_snapshot(&persisted, values) {
            Ok(migrated) => migrated,
            Err(e) => {
                self.enter(GuardState::Fatal);
                return Err(SchemaFatal::MigrationFailed(e));
            }
        };

        let mut records = Vec::with_capacity(migrated.len());
        for (id, value) in &migrated {
            match record_from_raw(value.clone()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.enter(GuardState::Fatal);
                    return Err(SchemaFatal::MigrationFailed(SchemaError::MalformedRecord(
                        format!("record '{id}': {e}"),
                    )));
                }
            }
        }

        let local_descriptor = schema.serialize();
        if needs_migration {
            // Rewrite the shared state under the new schema: drop entries
            // the migration discarded, set every migrated record, and
            // publish the new descriptor, atomically.
            let existing = self.adapter.keys();
            self.adapter.transact_local(|w| {
                for key in &existing {
                    if !migrated.contains_key(key) {
                        w.delete(&RecordId::from_raw(key.clone()));
                    }
                }
                for record in &records {
                    if let Err(e) = w.set(record) {
                        log::warn!("migration skipped record {}: {e}", record.id());
                    }
                }
                if let Err(e) = w.set_schema(&local_descriptor) {
                    log::warn!("migration could not write schema descriptor: {e}");
                }
            });
        }

        if let Err(e) = self.store.load_snapshot(records, &local_descriptor) {
            self.enter(GuardState::Fatal);
            return Err(SchemaFatal::MigrationFailed(e));
        }

        log::info!("schema reconciled; {} shared record(s) loaded", migrated.len());
        self.enter(GuardState::Ready);
        Ok(())
    }

    /// Re-check after an observed meta record change while `Ready`.
    ///
    /// A peer has (re)published a schema. Anything other than "identical
    /// or harmlessly older than ours with nothing to do" is fatal.
    pub fn verify_meta(&self) -> Result<(), SchemaFatal> {
        let Some(persisted) = self.adapter.meta_schema() else {
            self.enter(GuardState::Fatal);
            return Err(SchemaFatal::MissingMetaRecord);
        };
        match self.store.schema().migrations_since(&persisted) {
            Err(e) => {
                self.enter(GuardState::Fatal);
                Err(SchemaFatal::CheckFailed(e))
            }
            Ok(pending) if !pending.is_empty() => {
                self.enter(GuardState::Fatal);
                Err(SchemaFatal::RemoteSchemaDiverged)
            }
            Ok(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CONTENT_MAP, META_MAP, META_SCHEMA_KEY};
    use easel_store::{
        InstanceRecord, Migration, Record, SchemaDescriptor, ShapeKind, ShapeRecord, StoreSchema,
        SCHEMA_FORMAT,
    };
    use std::collections::BTreeMap;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, Map, ReadTxn, StateVector, Transact, Update};

    fn shape() -> Record {
        Record::Shape(ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0, 10.0, 10.0))
    }

    fn descriptor_at(shape_version: u32) -> SchemaDescriptor {
        let mut versions = StoreSchema::current().serialize().versions;
        versions.insert("shape".to_string(), shape_version);
        SchemaDescriptor {
            format: SCHEMA_FORMAT,
            versions,
        }
    }

    /// Build an update simulating a peer that wrote `entries` and the
    /// given schema descriptor.
    fn foreign_state(entries: &[(&str, String)], descriptor: Option<&SchemaDescriptor>) -> Vec<u8> {
        let doc = Doc::with_client_id(999);
        let content = doc.get_or_insert_map(CONTENT_MAP);
        let meta = doc.get_or_insert_map(META_MAP);
        {
            let mut txn = doc.transact_mut();
            for (key, value) in entries {
                content.insert(&mut txn, *key, value.clone());
            }
            if let Some(descriptor) = descriptor {
                meta.insert(
                    &mut txn,
                    META_SCHEMA_KEY,
                    serde_json::to_string(descriptor).unwrap(),
                );
            }
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Rewrite the meta record as a causally-later write from a foreign
    /// peer, so the overwrite deterministically wins the merge.
    fn overwrite_meta(adapter: &DocAdapter, descriptor: &SchemaDescriptor) {
        let doc = Doc::with_client_id(999);
        let _content = doc.get_or_insert_map(CONTENT_MAP);
        let meta = doc.get_or_insert_map(META_MAP);
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(&adapter.encode_state_as_update()).unwrap())
                .unwrap();
            meta.insert(
                &mut txn,
                META_SCHEMA_KEY,
                serde_json::to_string(descriptor).unwrap(),
            );
        }
        let update = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        adapter.apply_remote_update(&update).unwrap();
    }

    #[test]
    fn test_seeding_empty_sequence() {
        let store = BoardStore::new();
        let record = shape();
        store.put(vec![record.clone(), Record::Instance(InstanceRecord::new())]);

        let adapter = Arc::new(DocAdapter::new());
        let guard = SchemaGuard::new(store.clone(), adapter.clone());

        guard.reconcile().unwrap();

        assert_eq!(guard.state(), GuardState::Ready);
        // Only the document-scope record was seeded.
        assert_eq!(adapter.len(), 1);
        assert_eq!(adapter.get(record.id()), Some(record));
        assert_eq!(adapter.meta_schema(), Some(store.schema().serialize()));
    }

    #[test]
    fn test_seeding_is_idempotent() {
        let store = BoardStore::new();
        let record = shape();
        store.put(vec![record.clone()]);

        let adapter = Arc::new(DocAdapter::new());
        let guard = SchemaGuard::new(store.clone(), adapter.clone());

        guard.reconcile().unwrap();
        let len_after_first = adapter.len();

        // Second reconcile sees a non-empty sequence and verifies instead
        // of reseeding: same entries, same single meta record.
        guard.reconcile().unwrap();
        assert_eq!(guard.state(), GuardState::Ready);
        assert_eq!(adapter.len(), len_after_first);
        assert_eq!(adapter.meta_schema(), Some(store.schema().serialize()));
    }

    #[test]
    fn test_missing_meta_record_is_fatal() {
        let store = BoardStore::new();
        let adapter = Arc::new(DocAdapter::new());

        // Data without a descriptor: a fatally inconsistent document.
        let record = shape();
        let entry = serde_json::to_string(&record).unwrap();
        adapter
            .apply_remote_update(&foreign_state(&[(record.id().as_str(), entry)], None))
            .unwrap();

        let guard = SchemaGuard::new(store, adapter);
        let err = guard.reconcile().unwrap_err();
        assert_eq!(err, SchemaFatal::MissingMetaRecord);
        assert_eq!(guard.state(), GuardState::Fatal);
    }

    #[test]
    fn test_join_loads_shared_snapshot() {
        // Peer A seeds.
        let store_a = BoardStore::new();
        let record = shape();
        store_a.put(vec![record.clone()]);
        let adapter_a = Arc::new(DocAdapter::with_client_id(1));
        SchemaGuard::new(store_a.clone(), adapter_a.clone())
            .reconcile()
            .unwrap();

        // Peer B joins with an empty store.
        let store_b = BoardStore::new();
        let adapter_b = Arc::new(DocAdapter::with_client_id(2));
        adapter_b
            .apply_remote_update(&adapter_a.encode_state_as_update())
            .unwrap();

        let guard_b = SchemaGuard::new(store_b.clone(), adapter_b.clone());
        guard_b.reconcile().unwrap();

        assert_eq!(guard_b.state(), GuardState::Ready);
        assert_eq!(store_b.get(record.id()), Some(record));
        assert_eq!(adapter_b.meta_schema(), Some(store_a.schema().serialize()));
    }

    #[test]
    fn test_migration_upgrades_shared_state() {
        let store = BoardStore::new();
        let adapter = Arc::new(DocAdapter::new());

        // A peer on schema v1 wrote a shape without rotation.
        let old_shape = serde_json::json!({
            "type": "shape",
            "id": "shape:old",
            "kind": "rect",
            "bounds": { "x": 0.0, "y": 0.0, "width": 10.0, "height": 10.0 }
        });
        adapter
            .apply_remote_update(&foreign_state(
                &[("shape:old", old_shape.to_string())],
                Some(&descriptor_at(1)),
            ))
            .unwrap();

        let guard = SchemaGuard::new(store.clone(), adapter.clone());
        guard.reconcile().unwrap();
        assert_eq!(guard.state(), GuardState::Ready);

        // The store holds the migrated record…
        match store.get(&RecordId::from_raw("shape:old")) {
            Some(Record::Shape(s)) => assert_eq!(s.rotation, 0.0),
            other => panic!("expected migrated shape, got {other:?}"),
        }
        // …and the shared state was rewritten under the new schema.
        assert_eq!(adapter.meta_schema(), Some(store.schema().serialize()));
        assert!(adapter.get(&RecordId::from_raw("shape:old")).is_some());
    }

    #[test]
    fn test_migration_failure_is_fatal() {
        let mut versions = BTreeMap::new();
        versions.insert("shape".to_string(), 2);
        let store = BoardStore::with_schema(StoreSchema::with_versions(
            versions,
            vec![Migration {
                record_type: "shape",
                to_version: 2,
                name: "always_fails",
                apply: |_| Err("boom".to_string()),
            }],
        ));

        let adapter = Arc::new(DocAdapter::new());
        let mut persisted_versions = BTreeMap::new();
        persisted_versions.insert("shape".to_string(), 1);
        let persisted = SchemaDescriptor {
            format: SCHEMA_FORMAT,
            versions: persisted_versions,
        };
        let old_shape = serde_json::json!({ "type": "shape", "id": "shape:old" });
        adapter
            .apply_remote_update(&foreign_state(
                &[("shape:old", old_shape.to_string())],
                Some(&persisted),
            ))
            .unwrap();

        let guard = SchemaGuard::new(store, adapter);
        let err = guard.reconcile().unwrap_err();
        assert!(matches!(err, SchemaFatal::MigrationFailed(_)));
        assert_eq!(guard.state(), GuardState::Fatal);
    }

    #[test]
    fn test_newer_remote_schema_is_fatal() {
        let store = BoardStore::new();
        let adapter = Arc::new(DocAdapter::new());

        let record = shape();
        let entry = serde_json::to_string(&record).unwrap();
        adapter
            .apply_remote_update(&foreign_state(
                &[(record.id().as_str(), entry)],
                Some(&descriptor_at(3)),
            ))
            .unwrap();

        let guard = SchemaGuard::new(store, adapter);
        let err = guard.reconcile().unwrap_err();
        assert!(matches!(err, SchemaFatal::CheckFailed(_)));
        assert_eq!(guard.state(), GuardState::Fatal);
    }

    #[test]
    fn test_verify_meta_accepts_own_schema() {
        let store = BoardStore::new();
        store.put(vec![shape()]);
        let adapter = Arc::new(DocAdapter::new());
        let guard = SchemaGuard::new(store, adapter);
        guard.reconcile().unwrap();

        guard.verify_meta().unwrap();
        assert_eq!(guard.state(), GuardState::Ready);
    }

    #[test]
    fn test_verify_meta_diverged_schema_is_fatal() {
        let store = BoardStore::new();
        store.put(vec![shape()]);
        let adapter = Arc::new(DocAdapter::new());
        let guard = SchemaGuard::new(store.clone(), adapter.clone());
        guard.reconcile().unwrap();

        // A peer rewrites the meta record with an older schema.
        overwrite_meta(&adapter, &descriptor_at(1));

        let err = guard.verify_meta().unwrap_err();
        assert_eq!(err, SchemaFatal::RemoteSchemaDiverged);
        assert_eq!(guard.state(), GuardState::Fatal);
    }
}
