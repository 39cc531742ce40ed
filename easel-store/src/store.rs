//! The observable document store.
//!
//! `BoardStore` holds the rendered record set and notifies subscribers of
//! mutations. Listeners attach with a [`StoreFilter`] selecting the change
//! source (user edits vs programmatic merges) and the record scope, which
//! is what lets the sync engine observe user document edits without ever
//! seeing its own merged-in remote changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::schema::{SchemaDescriptor, SchemaError, StoreSchema};
use crate::{Record, RecordId, RecordScope};

/// Who produced a batch of changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeSource {
    /// A direct `put`/`remove` call: a user edit.
    User,
    /// A merge-scoped batch: remote changes applied programmatically.
    Remote,
}

/// One batch of store mutations, delivered to listeners as a unit.
#[derive(Clone, Debug)]
pub struct ChangeSet {
    pub source: ChangeSource,
    pub added: HashMap<RecordId, Record>,
    /// Updated records as `(old, new)` pairs.
    pub updated: HashMap<RecordId, (Record, Record)>,
    pub removed: HashMap<RecordId, Record>,
}

impl ChangeSet {
    fn new(source: ChangeSource) -> Self {
        Self {
            source,
            added: HashMap::new(),
            updated: HashMap::new(),
            removed: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// The subset of this batch whose records match `filter`'s scope.
    fn scoped(&self, filter: &StoreFilter) -> ChangeSet {
        if matches!(filter.scope, ScopeFilter::Any) {
            return self.clone();
        }
        let mut scoped = ChangeSet::new(self.source);
        for (id, record) in &self.added {
            if filter.scope_matches(record.scope()) {
                scoped.added.insert(id.clone(), record.clone());
            }
        }
        for (id, (old, new)) in &self.updated {
            if filter.scope_matches(new.scope()) {
                scoped.updated.insert(id.clone(), (old.clone(), new.clone()));
            }
        }
        for (id, record) in &self.removed {
            if filter.scope_matches(record.scope()) {
                scoped.removed.insert(id.clone(), record.clone());
            }
        }
        scoped
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFilter {
    User,
    Remote,
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeFilter {
    Document,
    Session,
    Presence,
    Any,
}

/// Selects which change batches a listener receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreFilter {
    pub source: SourceFilter,
    pub scope: ScopeFilter,
}

impl StoreFilter {
    /// User-originated document-content changes: the local change pump's
    /// subscription.
    pub fn user_document() -> Self {
        Self {
            source: SourceFilter::User,
            scope: ScopeFilter::Document,
        }
    }

    /// Session-scope changes from any source: the presence derivation's
    /// subscription.
    pub fn session_changes() -> Self {
        Self {
            source: SourceFilter::Any,
            scope: ScopeFilter::Session,
        }
    }

    pub fn any() -> Self {
        Self {
            source: SourceFilter::Any,
            scope: ScopeFilter::Any,
        }
    }

    fn matches_source(&self, source: ChangeSource) -> bool {
        match self.source {
            SourceFilter::Any => true,
            SourceFilter::User => source == ChangeSource::User,
            SourceFilter::Remote => source == ChangeSource::Remote,
        }
    }

    fn scope_matches(&self, scope: RecordScope) -> bool {
        match self.scope {
            ScopeFilter::Any => true,
            ScopeFilter::Document => scope == RecordScope::Document,
            ScopeFilter::Session => scope == RecordScope::Session,
            ScopeFilter::Presence => scope == RecordScope::Presence,
        }
    }
}

/// Callback invoked with each matching change batch.
pub type StoreCallback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

struct Listener {
    id: u64,
    filter: StoreFilter,
    callback: StoreCallback,
}

/// Handle for a registered listener. Unsubscribes on drop; call sites that
/// need deterministic teardown order hold these and drop them explicitly,
/// last attached first.
pub struct StoreSubscription {
    id: u64,
    listeners: Weak<Mutex<Vec<Listener>>>,
}

impl StoreSubscription {
    pub fn unsubscribe(self) {
        // Drop does the actual removal.
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().unwrap().retain(|l| l.id != self.id);
        }
    }
}

/// Accumulates puts and removes inside [`BoardStore::merge_remote`].
#[derive(Default)]
pub struct MergeBatch {
    puts: Vec<Record>,
    removes: Vec<RecordId>,
}

impl MergeBatch {
    pub fn put(&mut self, record: Record) {
        self.puts.push(record);
    }

    pub fn put_many(&mut self, records: impl IntoIterator<Item = Record>) {
        self.puts.extend(records);
    }

    pub fn remove(&mut self, id: RecordId) {
        self.removes.push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }
}

/// In-memory observable record store for one board session.
pub struct BoardStore {
    records: RwLock<HashMap<RecordId, Record>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    schema: StoreSchema,
    next_listener: AtomicU64,
}

impl BoardStore {
    pub fn new() -> Arc<Self> {
        Self::with_schema(StoreSchema::current())
    }

    pub fn with_schema(schema: StoreSchema) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            schema,
            next_listener: AtomicU64::new(1),
        })
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Subscribe to change batches matching `filter`.
    pub fn listen(&self, filter: StoreFilter, callback: StoreCallback) -> StoreSubscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push(Listener {
            id,
            filter,
            callback,
        });
        StoreSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Insert or replace records as a user edit.
    pub fn put(&self, records: Vec<Record>) {
        let batch = self.apply(records, &[], ChangeSource::User);
        self.dispatch(batch);
    }

    /// Remove records by id as a user edit.
    pub fn remove(&self, ids: &[RecordId]) {
        let batch = self.apply(Vec::new(), ids, ChangeSource::User);
        self.dispatch(batch);
    }

    /// Apply puts and removes together as ONE user-edit batch, the way an
    /// editor command that atomically replaces records does.
    pub fn update_batch(&self, puts: Vec<Record>, removes: &[RecordId]) {
        let batch = self.apply(puts, removes, ChangeSource::User);
        self.dispatch(batch);
    }

    /// Apply a batch of remote changes as ONE merge-scoped update.
    ///
    /// Everything mutated inside `f` is delivered to listeners as a single
    /// remote-source batch, and never reaches user-source listeners. This is
    /// the path the sync engine uses to apply replicated changes without
    /// re-triggering the local change pump.
    pub fn merge_remote<F: FnOnce(&mut MergeBatch)>(&self, f: F) {
        let mut merge = MergeBatch::default();
        f(&mut merge);
        if merge.is_empty() {
            return;
        }
        let batch = self.apply(merge.puts, &merge.removes, ChangeSource::Remote);
        self.dispatch(batch);
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.read().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Snapshot of every record in the store.
    pub fn all_records(&self) -> Vec<Record> {
        self.records.read().unwrap().values().cloned().collect()
    }

    /// Replace the document-scope contents with a migrated snapshot.
    ///
    /// Session and presence records are untouched: they are ephemeral local
    /// state, not part of the replicated document. The snapshot must already
    /// be at this store's schema; `descriptor` is checked against it.
    pub fn load_snapshot(
        &self,
        records: Vec<Record>,
        descriptor: &SchemaDescriptor,
    ) -> Result<(), SchemaError> {
        let pending = self.schema.migrations_since(descriptor)?;
        if !pending.is_empty() {
            return Err(SchemaError::MalformedRecord(format!(
                "snapshot needs {} pending migration(s) before it can be loaded",
                pending.len()
            )));
        }

        let mut batch = ChangeSet::new(ChangeSource::Remote);
        {
            let mut map = self.records.write().unwrap();
            let incoming: HashMap<RecordId, Record> = records
                .into_iter()
                .filter(|r| {
                    if r.scope() == RecordScope::Document {
                        true
                    } else {
                        log::warn!(
                            "ignoring non-document record {} in snapshot load",
                            r.id()
                        );
                        false
                    }
                })
                .map(|r| (r.id().clone(), r))
                .collect();

            let stale: Vec<RecordId> = map
                .iter()
                .filter(|(id, record)| {
                    record.scope() == RecordScope::Document && !incoming.contains_key(id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(old) = map.remove(&id) {
                    batch.removed.insert(id, old);
                }
            }

            for (id, record) in incoming {
                match map.insert(id.clone(), record.clone()) {
                    None => {
                        batch.added.insert(id, record);
                    }
                    Some(old) if old != record => {
                        batch.updated.insert(id, (old, record));
                    }
                    Some(_) => {}
                }
            }
        }
        self.dispatch(batch);
        Ok(())
    }

    fn apply(&self, puts: Vec<Record>, removes: &[RecordId], source: ChangeSource) -> ChangeSet {
        let mut batch = ChangeSet::new(source);
        let mut map = self.records.write().unwrap();

        for record in puts {
            let id = record.id().clone();
            match map.insert(id.clone(), record.clone()) {
                None => {
                    batch.added.insert(id, record);
                }
                Some(old) if old != record => {
                    batch.updated.insert(id, (old, record));
                }
                // Identical replacement: not a change, nothing to deliver.
                Some(_) => {}
            }
        }

        for id in removes {
            if let Some(old) = map.remove(id) {
                batch.removed.insert(id.clone(), old);
            }
        }

        batch
    }

    /// Deliver a batch to every matching listener.
    ///
    /// Callbacks run after all internal locks are released, so a listener
    /// may freely call back into the store.
    fn dispatch(&self, batch: ChangeSet) {
        if batch.is_empty() {
            return;
        }

        let targets: Vec<(StoreFilter, StoreCallback)> = {
            let listeners = self.listeners.lock().unwrap();
            listeners
                .iter()
                .filter(|l| l.filter.matches_source(batch.source))
                .map(|l| (l.filter, l.callback.clone()))
                .collect()
        };

        for (filter, callback) in targets {
            let scoped = batch.scoped(&filter);
            if !scoped.is_empty() {
                callback(&scoped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceRecord, PageRecord, ShapeKind, ShapeRecord};
    use std::sync::atomic::AtomicUsize;

    fn shape() -> Record {
        Record::Shape(ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0, 10.0, 10.0))
    }

    fn counting_listener(
        store: &BoardStore,
        filter: StoreFilter,
    ) -> (Arc<AtomicUsize>, StoreSubscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub = store.listen(
            filter,
            Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (count, sub)
    }

    #[test]
    fn test_put_and_get() {
        let store = BoardStore::new();
        let record = shape();
        let id = record.id().clone();

        store.put(vec![record.clone()]);
        assert_eq!(store.get(&id), Some(record));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_put_notifies_user_listener_with_added() {
        let store = BoardStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.listen(
            StoreFilter::user_document(),
            Arc::new(move |batch: &ChangeSet| {
                seen_clone.lock().unwrap().push((
                    batch.added.len(),
                    batch.updated.len(),
                    batch.removed.len(),
                ));
            }),
        );

        store.put(vec![shape()]);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 0, 0)]);
    }

    #[test]
    fn test_replacing_record_is_an_update() {
        let store = BoardStore::new();
        let mut record = ShapeRecord::new(ShapeKind::Rect, 0.0, 0.0, 10.0, 10.0);
        store.put(vec![Record::Shape(record.clone())]);

        let (count, _sub) = counting_listener(&store, StoreFilter::user_document());
        record.bounds.width = 50.0;
        store.put(vec![Record::Shape(record.clone())]);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        match store.get(&record.id).unwrap() {
            Record::Shape(s) => assert_eq!(s.bounds.width, 50.0),
            other => panic!("expected shape, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_put_is_silent() {
        let store = BoardStore::new();
        let record = shape();
        store.put(vec![record.clone()]);

        let (count, _sub) = counting_listener(&store, StoreFilter::any());
        store.put(vec![record]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_notifies_with_removed() {
        let store = BoardStore::new();
        let record = shape();
        let id = record.id().clone();
        store.put(vec![record]);

        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = seen.clone();
        let _sub = store.listen(
            StoreFilter::user_document(),
            Arc::new(move |batch: &ChangeSet| {
                *seen_clone.lock().unwrap() = batch.removed.len();
            }),
        );

        store.remove(&[id.clone()]);
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_merge_remote_bypasses_user_listeners() {
        let store = BoardStore::new();
        let (user_count, _user_sub) = counting_listener(&store, StoreFilter::user_document());
        let (remote_count, _remote_sub) = counting_listener(
            &store,
            StoreFilter {
                source: SourceFilter::Remote,
                scope: ScopeFilter::Any,
            },
        );

        store.merge_remote(|batch| {
            batch.put(shape());
            batch.put(shape());
        });

        assert_eq!(user_count.load(Ordering::SeqCst), 0);
        assert_eq!(remote_count.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_merge_remote_is_one_batch() {
        let store = BoardStore::new();
        let existing = shape();
        let existing_id = existing.id().clone();
        store.put(vec![existing]);

        let (count, _sub) = counting_listener(
            &store,
            StoreFilter {
                source: SourceFilter::Remote,
                scope: ScopeFilter::Any,
            },
        );

        // Three puts and one remove arrive as exactly one callback.
        store.merge_remote(|batch| {
            batch.put(shape());
            batch.put(shape());
            batch.put(shape());
            batch.remove(existing_id.clone());
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!store.contains(&existing_id));
    }

    #[test]
    fn test_update_batch_is_one_user_batch() {
        let store = BoardStore::new();
        let old = shape();
        let old_id = old.id().clone();
        store.put(vec![old]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = store.listen(
            StoreFilter::user_document(),
            Arc::new(move |batch: &ChangeSet| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push((batch.added.len(), batch.removed.len()));
            }),
        );

        let new = shape();
        store.update_batch(vec![new.clone()], &[old_id.clone()]);

        assert_eq!(*seen.lock().unwrap(), vec![(1, 1)]);
        assert!(store.contains(new.id()));
        assert!(!store.contains(&old_id));
    }

    #[test]
    fn test_empty_merge_is_silent() {
        let store = BoardStore::new();
        let (count, _sub) = counting_listener(&store, StoreFilter::any());
        store.merge_remote(|_| {});
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scope_filtering() {
        let store = BoardStore::new();
        let (doc_count, _doc_sub) = counting_listener(
            &store,
            StoreFilter {
                source: SourceFilter::Any,
                scope: ScopeFilter::Document,
            },
        );
        let (session_count, _session_sub) =
            counting_listener(&store, StoreFilter::session_changes());

        store.put(vec![Record::Instance(InstanceRecord::new())]);
        assert_eq!(doc_count.load(Ordering::SeqCst), 0);
        assert_eq!(session_count.load(Ordering::SeqCst), 1);

        store.put(vec![shape()]);
        assert_eq!(doc_count.load(Ordering::SeqCst), 1);
        assert_eq!(session_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = BoardStore::new();
        let (count, sub) = counting_listener(&store, StoreFilter::any());

        store.put(vec![shape()]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        store.put(vec![shape()]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_reenter_store() {
        let store = BoardStore::new();
        let store_clone = store.clone();
        let _sub = store.listen(
            StoreFilter::user_document(),
            Arc::new(move |_| {
                // Re-entrant read must not deadlock.
                let _ = store_clone.all_records();
            }),
        );
        store.put(vec![shape()]);
    }

    #[test]
    fn test_load_snapshot_replaces_document_scope_only() {
        let store = BoardStore::new();
        let old_shape = shape();
        let instance = Record::Instance(InstanceRecord::new());
        let instance_id = instance.id().clone();
        store.put(vec![old_shape.clone(), instance]);

        let new_shape = shape();
        let new_page = Record::Page(PageRecord::new("Page 1", 0));
        let descriptor = store.schema().serialize();
        store
            .load_snapshot(vec![new_shape.clone(), new_page.clone()], &descriptor)
            .unwrap();

        assert!(!store.contains(old_shape.id()));
        assert!(store.contains(new_shape.id()));
        assert!(store.contains(new_page.id()));
        // Session-scope record survives the snapshot load.
        assert!(store.contains(&instance_id));
    }

    #[test]
    fn test_load_snapshot_rejects_stale_descriptor() {
        let store = BoardStore::new();
        let mut descriptor = store.schema().serialize();
        descriptor.versions.insert("shape".to_string(), 1);

        let err = store.load_snapshot(vec![], &descriptor).unwrap_err();
        assert!(matches!(err, SchemaError::MalformedRecord(_)));
    }
}
