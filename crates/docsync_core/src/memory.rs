//! In-memory storage engine.
//!
//! `MemoryStore` keeps every collection in hash maps with a by-sequence index for the
//! change enumerator. Each document has one current revision plus any conflicting
//! leaves inserted by the puller. Revision history beyond the leaves is not kept.

use crate::document::{body_size, Document, Properties};
use crate::error::{CoreError, CoreResult};
use crate::listener::{ListenerToken, Listeners};
use crate::store::{ChangeEntry, DocumentStore, RawDocument, ResolvedRevision, StoreObserver};
use crate::types::{
    new_revision_id, revision_generation, RevisionFlags, SequenceNumber, DEFAULT_COLLECTION,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredRevision {
    rev_id: String,
    body: Properties,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    current: StoredRevision,
    conflicts: Vec<StoredRevision>,
    sequence: SequenceNumber,
}

impl StoredDocument {
    fn new(current: StoredRevision) -> Self {
        Self {
            current,
            conflicts: Vec::new(),
            sequence: SequenceNumber::ZERO,
        }
    }

    fn flags(&self) -> RevisionFlags {
        let mut flags = RevisionFlags::NONE;
        if self.current.deleted {
            flags |= RevisionFlags::DELETED;
        }
        if !self.conflicts.is_empty() {
            flags |= RevisionFlags::CONFLICT;
        }
        flags
    }

    fn change_entry(&self, collection: &str, doc_id: &str) -> ChangeEntry {
        ChangeEntry {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            rev_id: self.current.rev_id.clone(),
            sequence: self.sequence,
            flags: self.flags(),
            body_size: body_size(&self.current.body),
        }
    }

    fn to_document(&self, database: Uuid, collection: &str, doc_id: &str) -> Document {
        Document::from_revision(
            database,
            collection,
            doc_id,
            self.current.rev_id.clone(),
            self.sequence,
            self.flags(),
            self.current.body.clone(),
        )
    }
}

#[derive(Debug, Default)]
struct CollectionData {
    docs: HashMap<String, StoredDocument>,
    by_sequence: BTreeMap<SequenceNumber, String>,
}

#[derive(Debug, Default)]
struct StoreState {
    last_sequence: SequenceNumber,
    collections: HashMap<String, CollectionData>,
    raw: HashMap<String, HashMap<String, RawDocument>>,
}

impl StoreState {
    fn collection(&self, name: &str) -> CoreResult<&CollectionData> {
        self.collections
            .get(name)
            .ok_or_else(|| CoreError::not_found(format!("collection '{name}'")))
    }

    fn document(&self, collection: &str, doc_id: &str) -> CoreResult<Option<&StoredDocument>> {
        Ok(self.collection(collection)?.docs.get(doc_id))
    }

    /// Stores `doc` under a fresh sequence and returns its change entry.
    fn commit(
        &mut self,
        collection: &str,
        doc_id: &str,
        mut doc: StoredDocument,
    ) -> CoreResult<ChangeEntry> {
        let sequence = self.last_sequence.next();
        let data = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| CoreError::not_found(format!("collection '{collection}'")))?;
        if let Some(old) = data.docs.get(doc_id) {
            data.by_sequence.remove(&old.sequence);
        }
        doc.sequence = sequence;
        let entry = doc.change_entry(collection, doc_id);
        data.by_sequence.insert(sequence, doc_id.to_string());
        data.docs.insert(doc_id.to_string(), doc);
        self.last_sequence = sequence;
        Ok(entry)
    }

    fn next_raw_rev(&self, store: &str, key: &str) -> String {
        let generation = self
            .raw
            .get(store)
            .and_then(|docs| docs.get(key))
            .map(|doc| revision_generation(&doc.rev_id))
            .unwrap_or(0);
        new_revision_id(generation + 1)
    }

    fn write_raw(&mut self, store: &str, key: &str, body: Value) -> String {
        let rev_id = self.next_raw_rev(store, key);
        self.raw.entry(store.to_string()).or_default().insert(
            key.to_string(),
            RawDocument {
                key: key.to_string(),
                rev_id: rev_id.clone(),
                body,
            },
        );
        rev_id
    }
}

/// A complete [`DocumentStore`] held in memory.
pub struct MemoryStore {
    uuid: Uuid,
    state: RwLock<StoreState>,
    observers: Listeners<StoreObserver>,
}

impl MemoryStore {
    /// Creates an empty store containing only the default collection.
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    /// Creates an empty store with a fixed database UUID.
    pub fn with_uuid(uuid: Uuid) -> Self {
        let mut state = StoreState::default();
        state
            .collections
            .insert(DEFAULT_COLLECTION.to_string(), CollectionData::default());
        Self {
            uuid,
            state: RwLock::new(state),
            observers: Listeners::new(),
        }
    }

    /// Notifies observers. Must be called without the state lock held.
    fn publish(&self, entries: &[ChangeEntry]) {
        if entries.is_empty() {
            return;
        }
        tracing::trace!(count = entries.len(), "publishing store changes");
        self.observers.call(|observer| observer(entries));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStore")
            .field("uuid", &self.uuid)
            .field("last_sequence", &state.last_sequence)
            .field("collections", &state.collections.len())
            .finish()
    }
}

impl DocumentStore for MemoryStore {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn has_collection(&self, collection: &str) -> bool {
        self.state.read().collections.contains_key(collection)
    }

    fn create_collection(&self, collection: &str) -> CoreResult<()> {
        if collection.is_empty() {
            return Err(CoreError::invalid_parameter("collection name is empty"));
        }
        self.state
            .write()
            .collections
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    fn get_document(&self, collection: &str, doc_id: &str) -> CoreResult<Option<Document>> {
        let state = self.state.read();
        Ok(state
            .document(collection, doc_id)?
            .map(|doc| doc.to_document(self.uuid, collection, doc_id)))
    }

    fn save_document(
        &self,
        collection: &str,
        doc_id: &str,
        expected_rev: Option<&str>,
        body: Properties,
        deleted: bool,
    ) -> CoreResult<Document> {
        if doc_id.is_empty() {
            return Err(CoreError::invalid_parameter("document ID is empty"));
        }
        let (document, entry) = {
            let mut state = self.state.write();
            let existing = state.document(collection, doc_id)?.cloned();
            let matches = match (&existing, expected_rev) {
                (None, None) => true,
                (None, Some(_)) => false,
                (Some(doc), None) => doc.current.deleted,
                (Some(doc), Some(rev)) => doc.current.rev_id == rev,
            };
            if !matches {
                return Err(CoreError::conflict(doc_id));
            }

            let (generation, conflicts) = match existing {
                Some(doc) => (revision_generation(&doc.current.rev_id), doc.conflicts),
                None => (0, Vec::new()),
            };
            let mut stored = StoredDocument::new(StoredRevision {
                rev_id: new_revision_id(generation + 1),
                body,
                deleted,
            });
            stored.conflicts = conflicts;
            let entry = state.commit(collection, doc_id, stored)?;
            let document = state
                .document(collection, doc_id)?
                .map(|doc| doc.to_document(self.uuid, collection, doc_id))
                .ok_or_else(|| CoreError::unexpected("saved document vanished"))?;
            (document, entry)
        };
        self.publish(&[entry]);
        Ok(document)
    }

    fn purge_document(&self, collection: &str, doc_id: &str) -> CoreResult<bool> {
        let entry = {
            let mut state = self.state.write();
            let data = state
                .collections
                .get_mut(collection)
                .ok_or_else(|| CoreError::not_found(format!("collection '{collection}'")))?;
            match data.docs.remove(doc_id) {
                None => return Ok(false),
                Some(doc) => {
                    data.by_sequence.remove(&doc.sequence);
                    let mut entry = doc.change_entry(collection, doc_id);
                    entry.flags |= RevisionFlags::PURGED;
                    entry
                }
            }
        };
        self.publish(&[entry]);
        Ok(true)
    }

    fn insert_conflicting_revision(
        &self,
        collection: &str,
        doc_id: &str,
        rev_id: &str,
        body: Properties,
        deleted: bool,
    ) -> CoreResult<SequenceNumber> {
        let revision = StoredRevision {
            rev_id: rev_id.to_string(),
            body,
            deleted,
        };
        let entry = {
            let mut state = self.state.write();
            let stored = match state.document(collection, doc_id)?.cloned() {
                None => StoredDocument::new(revision),
                Some(mut doc) => {
                    let known = doc.current.rev_id == rev_id
                        || doc.conflicts.iter().any(|r| r.rev_id == rev_id);
                    if known {
                        return Err(CoreError::invalid_parameter(format!(
                            "revision {rev_id} of '{doc_id}' already exists"
                        )));
                    }
                    doc.conflicts.push(revision);
                    doc
                }
            };
            state.commit(collection, doc_id, stored)?
        };
        let sequence = entry.sequence;
        self.publish(&[entry]);
        Ok(sequence)
    }

    fn conflicting_revisions(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> CoreResult<Vec<Document>> {
        let state = self.state.read();
        let Some(doc) = state.document(collection, doc_id)? else {
            return Ok(Vec::new());
        };
        Ok(doc
            .conflicts
            .iter()
            .map(|rev| {
                let mut flags = RevisionFlags::CONFLICT;
                if rev.deleted {
                    flags |= RevisionFlags::DELETED;
                }
                Document::from_revision(
                    self.uuid,
                    collection,
                    doc_id,
                    rev.rev_id.clone(),
                    doc.sequence,
                    flags,
                    rev.body.clone(),
                )
            })
            .collect())
    }

    fn resolve_conflict(
        &self,
        collection: &str,
        doc_id: &str,
        expected_local_rev: Option<&str>,
        losing_rev: &str,
        resolution: ResolvedRevision,
    ) -> CoreResult<Document> {
        let (document, entry) = {
            let mut state = self.state.write();
            let mut doc = state
                .document(collection, doc_id)?
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("document '{doc_id}'")))?;
            if expected_local_rev != Some(doc.current.rev_id.as_str()) {
                return Err(CoreError::conflict(doc_id));
            }
            let position = doc
                .conflicts
                .iter()
                .position(|rev| rev.rev_id == losing_rev)
                .ok_or_else(|| CoreError::conflict(doc_id))?;
            let remote = doc.conflicts.remove(position);

            let generation = revision_generation(&doc.current.rev_id)
                .max(revision_generation(&remote.rev_id));
            let (body, deleted) = match resolution {
                ResolvedRevision::KeepLocal => (doc.current.body.clone(), doc.current.deleted),
                ResolvedRevision::TakeRemote => (remote.body, remote.deleted),
                ResolvedRevision::Merged(body) => (body, false),
                ResolvedRevision::Deleted => (Properties::new(), true),
            };
            doc.current = StoredRevision {
                rev_id: new_revision_id(generation + 1),
                body,
                deleted,
            };
            let entry = state.commit(collection, doc_id, doc)?;
            let document = state
                .document(collection, doc_id)?
                .map(|doc| doc.to_document(self.uuid, collection, doc_id))
                .ok_or_else(|| CoreError::unexpected("resolved document vanished"))?;
            (document, entry)
        };
        self.publish(&[entry]);
        Ok(document)
    }

    fn conflicted_document_ids(&self, collection: &str) -> CoreResult<Vec<String>> {
        let state = self.state.read();
        let data = state.collection(collection)?;
        Ok(data
            .by_sequence
            .values()
            .filter(|id| data.docs.get(*id).is_some_and(|doc| !doc.conflicts.is_empty()))
            .cloned()
            .collect())
    }

    fn document_count(&self, collection: &str) -> CoreResult<u64> {
        let state = self.state.read();
        Ok(state
            .collection(collection)?
            .docs
            .values()
            .filter(|doc| !doc.current.deleted)
            .count() as u64)
    }

    fn changes_since(
        &self,
        collection: &str,
        since: SequenceNumber,
        limit: usize,
    ) -> CoreResult<Vec<ChangeEntry>> {
        let state = self.state.read();
        let data = state.collection(collection)?;
        Ok(data
            .by_sequence
            .range((Bound::Excluded(since), Bound::Unbounded))
            .filter_map(|(_, id)| data.docs.get(id).map(|doc| doc.change_entry(collection, id)))
            .take(limit)
            .collect())
    }

    fn last_sequence(&self) -> SequenceNumber {
        self.state.read().last_sequence
    }

    fn get_raw(&self, store: &str, key: &str) -> CoreResult<Option<RawDocument>> {
        Ok(self
            .state
            .read()
            .raw
            .get(store)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    fn put_raw(&self, store: &str, key: &str, body: Value) -> CoreResult<String> {
        Ok(self.state.write().write_raw(store, key, body))
    }

    fn put_raw_if(
        &self,
        store: &str,
        key: &str,
        expected_rev: Option<&str>,
        body: Value,
    ) -> CoreResult<String> {
        let mut state = self.state.write();
        let current = state
            .raw
            .get(store)
            .and_then(|docs| docs.get(key))
            .map(|doc| doc.rev_id.as_str());
        if current != expected_rev {
            return Err(CoreError::conflict(key));
        }
        Ok(state.write_raw(store, key, body))
    }

    fn delete_raw(&self, store: &str, key: &str) -> CoreResult<bool> {
        Ok(self
            .state
            .write()
            .raw
            .get_mut(store)
            .and_then(|docs| docs.remove(key))
            .is_some())
    }

    fn observe(&self, observer: Arc<StoreObserver>) -> ListenerToken {
        self.observers.add(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn body(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn save_with_optimistic_concurrency() {
        let store = MemoryStore::new();
        let d1 = store
            .save_document(DEFAULT_COLLECTION, "a", None, body(json!({"n": 1})), false)
            .unwrap();
        assert_eq!(revision_generation(d1.revision_id().unwrap()), 1);
        assert_eq!(d1.sequence(), SequenceNumber::new(1));
        assert_eq!(d1.database(), Some(store.uuid()));

        // Stale revision loses.
        let err = store
            .save_document(DEFAULT_COLLECTION, "a", None, body(json!({"n": 2})), false)
            .unwrap_err();
        assert!(err.is_conflict());

        let d2 = store
            .save_document(
                DEFAULT_COLLECTION,
                "a",
                d1.revision_id(),
                body(json!({"n": 2})),
                false,
            )
            .unwrap();
        assert_eq!(revision_generation(d2.revision_id().unwrap()), 2);
        assert_eq!(store.last_sequence(), SequenceNumber::new(2));
        assert_eq!(store.document_count(DEFAULT_COLLECTION).unwrap(), 1);
    }

    #[test]
    fn tombstones_are_readable_and_recreatable() {
        let store = MemoryStore::new();
        let d1 = store
            .save_document(DEFAULT_COLLECTION, "a", None, Properties::new(), false)
            .unwrap();
        let gone = store
            .save_document(DEFAULT_COLLECTION, "a", d1.revision_id(), Properties::new(), true)
            .unwrap();
        assert!(gone.is_deleted());
        assert!(store.get_document(DEFAULT_COLLECTION, "a").unwrap().unwrap().is_deleted());
        assert_eq!(store.document_count(DEFAULT_COLLECTION).unwrap(), 0);

        let again = store
            .save_document(DEFAULT_COLLECTION, "a", None, Properties::new(), false)
            .unwrap();
        assert!(!again.is_deleted());
    }

    #[test]
    fn changes_are_ordered_by_latest_sequence() {
        let store = MemoryStore::new();
        let a = store
            .save_document(DEFAULT_COLLECTION, "a", None, Properties::new(), false)
            .unwrap();
        store
            .save_document(DEFAULT_COLLECTION, "b", None, Properties::new(), false)
            .unwrap();
        store
            .save_document(DEFAULT_COLLECTION, "a", a.revision_id(), Properties::new(), false)
            .unwrap();

        let changes = store
            .changes_since(DEFAULT_COLLECTION, SequenceNumber::ZERO, 10)
            .unwrap();
        let ids: Vec<_> = changes.iter().map(|c| (c.doc_id.as_str(), c.sequence.as_u64())).collect();
        assert_eq!(ids, vec![("b", 2), ("a", 3)]);

        let tail = store
            .changes_since(DEFAULT_COLLECTION, SequenceNumber::new(2), 10)
            .unwrap();
        assert_eq!(tail.len(), 1);
        let first = store
            .changes_since(DEFAULT_COLLECTION, SequenceNumber::ZERO, 1)
            .unwrap();
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn conflict_insert_and_resolve() {
        let store = MemoryStore::new();
        let local = store
            .save_document(DEFAULT_COLLECTION, "a", None, body(json!({"v": "local"})), false)
            .unwrap();
        store
            .insert_conflicting_revision(
                DEFAULT_COLLECTION,
                "a",
                "3-remote",
                body(json!({"v": "remote"})),
                false,
            )
            .unwrap();

        let current = store.get_document(DEFAULT_COLLECTION, "a").unwrap().unwrap();
        assert!(current.flags().is_conflict());
        assert_eq!(store.conflicted_document_ids(DEFAULT_COLLECTION).unwrap(), vec!["a"]);
        let conflicts = store.conflicting_revisions(DEFAULT_COLLECTION, "a").unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].revision_id(), Some("3-remote"));

        // Wrong local revision.
        assert!(store
            .resolve_conflict(
                DEFAULT_COLLECTION,
                "a",
                Some("9-nope"),
                "3-remote",
                ResolvedRevision::KeepLocal
            )
            .unwrap_err()
            .is_conflict());

        let resolved = store
            .resolve_conflict(
                DEFAULT_COLLECTION,
                "a",
                current.revision_id(),
                "3-remote",
                ResolvedRevision::TakeRemote,
            )
            .unwrap();
        assert_eq!(resolved.get("v"), Some(&json!("remote")));
        assert_eq!(revision_generation(resolved.revision_id().unwrap()), 4);
        assert!(!resolved.flags().is_conflict());
        assert!(store.conflicted_document_ids(DEFAULT_COLLECTION).unwrap().is_empty());
        assert_ne!(resolved.revision_id(), local.revision_id());
    }

    #[test]
    fn resolve_to_merge_or_delete() {
        let store = MemoryStore::new();
        let local = store
            .save_document(DEFAULT_COLLECTION, "a", None, Properties::new(), false)
            .unwrap();
        store
            .insert_conflicting_revision(DEFAULT_COLLECTION, "a", "1-r", Properties::new(), false)
            .unwrap();
        store
            .insert_conflicting_revision(DEFAULT_COLLECTION, "a", "1-s", Properties::new(), true)
            .unwrap();
        let current = store.get_document(DEFAULT_COLLECTION, "a").unwrap().unwrap();
        assert_eq!(current.revision_id(), local.revision_id());

        let merged = store
            .resolve_conflict(
                DEFAULT_COLLECTION,
                "a",
                current.revision_id(),
                "1-r",
                ResolvedRevision::Merged(body(json!({"merged": true}))),
            )
            .unwrap();
        assert!(merged.flags().is_conflict());

        let deleted = store
            .resolve_conflict(
                DEFAULT_COLLECTION,
                "a",
                merged.revision_id(),
                "1-s",
                ResolvedRevision::Deleted,
            )
            .unwrap();
        assert!(deleted.is_deleted());
        assert!(!deleted.flags().is_conflict());
    }

    #[test]
    fn raw_documents_compare_and_swap() {
        let store = MemoryStore::new();
        assert!(store.get_raw("peer", "cp").unwrap().is_none());

        let rev1 = store.put_raw_if("peer", "cp", None, json!({"x": 1})).unwrap();
        assert!(store
            .put_raw_if("peer", "cp", None, json!({"x": 2}))
            .unwrap_err()
            .is_conflict());
        let rev2 = store
            .put_raw_if("peer", "cp", Some(&rev1), json!({"x": 2}))
            .unwrap();
        assert_ne!(rev1, rev2);
        assert_eq!(store.get_raw("peer", "cp").unwrap().unwrap().body, json!({"x": 2}));

        store.put_raw("peer", "cp", json!({"x": 3})).unwrap();
        assert!(store.delete_raw("peer", "cp").unwrap());
        assert!(!store.delete_raw("peer", "cp").unwrap());
    }

    #[test]
    fn observers_see_commits_and_purges() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let token = store.observe(Arc::new(move |entries: &[ChangeEntry]| {
            s.lock().extend(entries.iter().map(|e| (e.doc_id.clone(), e.flags)));
        }));

        store
            .save_document(DEFAULT_COLLECTION, "a", None, Properties::new(), false)
            .unwrap();
        assert!(store.purge_document(DEFAULT_COLLECTION, "a").unwrap());
        assert!(!store.purge_document(DEFAULT_COLLECTION, "a").unwrap());
        assert!(store.get_document(DEFAULT_COLLECTION, "a").unwrap().is_none());

        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            assert!(seen[1].1.contains(RevisionFlags::PURGED));
        }

        token.remove();
        store
            .save_document(DEFAULT_COLLECTION, "b", None, Properties::new(), false)
            .unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn collections_are_isolated() {
        let store = MemoryStore::new();
        assert!(!store.has_collection("people"));
        let err = store.get_document("people", "a").unwrap_err();
        assert_eq!(err.to_info().code, crate::error::ErrorInfo::NOT_FOUND);
        store.create_collection("people").unwrap();
        store
            .save_document("people", "a", None, Properties::new(), false)
            .unwrap();
        assert!(store.get_document(DEFAULT_COLLECTION, "a").unwrap().is_none());
        assert_eq!(store.document_count("people").unwrap(), 1);
        assert!(store.create_collection("").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn changes_feed_sees_each_live_document_once(ops in prop::collection::vec(0u8..6, 1..40)) {
                let store = MemoryStore::new();
                let mut last = SequenceNumber::ZERO;
                for id in ops {
                    let doc_id = format!("doc{id}");
                    let current = store.get_document(DEFAULT_COLLECTION, &doc_id).unwrap();
                    let saved = store
                        .save_document(
                            DEFAULT_COLLECTION,
                            &doc_id,
                            current.as_ref().and_then(|d| d.revision_id()),
                            Properties::new(),
                            false,
                        )
                        .unwrap();
                    prop_assert!(saved.sequence() > last);
                    last = saved.sequence();
                }

                let changes = store
                    .changes_since(DEFAULT_COLLECTION, SequenceNumber::ZERO, usize::MAX)
                    .unwrap();
                let mut ids: Vec<_> = changes.iter().map(|c| c.doc_id.clone()).collect();
                prop_assert!(changes.windows(2).all(|w| w[0].sequence < w[1].sequence));
                ids.sort();
                ids.dedup();
                prop_assert_eq!(ids.len(), changes.len());
                prop_assert_eq!(changes.last().map(|c| c.sequence), Some(last));
            }
        }
    }
}
