//! Storage engine interface.
//!
//! [`DocumentStore`] is the narrow set of engine primitives the replication layer
//! relies on: document reads and writes with optimistic concurrency, conflict
//! bookkeeping, a sequence-ordered change enumerator, raw key/value stores for
//! checkpoints, and change observation. [`MemoryStore`](crate::MemoryStore) is the
//! in-process implementation.

use crate::document::{Document, Properties};
use crate::error::CoreResult;
use crate::listener::ListenerToken;
use crate::types::{RevisionFlags, SequenceNumber};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Raw store holding local checkpoints.
pub const CHECKPOINT_STORE: &str = "checkpoints";

/// Raw store holding checkpoints written by remote peers.
pub const PEER_CHECKPOINT_STORE: &str = "peerCheckpoints";

/// Metadata of one document's latest revision, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Collection the document lives in.
    pub collection: String,
    /// Document ID.
    pub doc_id: String,
    /// Current revision ID.
    pub rev_id: String,
    /// Sequence of the change.
    pub sequence: SequenceNumber,
    /// Revision flags (deleted, purged, conflict).
    pub flags: RevisionFlags,
    /// Approximate body size in bytes.
    pub body_size: u64,
}

/// A document in a raw key/value store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    /// Key within the store.
    pub key: String,
    /// Revision, used for compare-and-swap updates.
    pub rev_id: String,
    /// Stored value.
    pub body: Value,
}

/// How a conflict between the current revision and a conflicting leaf ends.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedRevision {
    /// Keep the current (local) revision's content.
    KeepLocal,
    /// Take the conflicting (remote) revision's content.
    TakeRemote,
    /// Replace both with a new body.
    Merged(Properties),
    /// Replace both with a tombstone.
    Deleted,
}

/// Callback receiving committed changes.
pub type StoreObserver = dyn Fn(&[ChangeEntry]) + Send + Sync;

/// Per-database storage primitives.
pub trait DocumentStore: Send + Sync {
    /// Stable identifier of this database.
    fn uuid(&self) -> Uuid;

    /// Returns true if the collection exists.
    fn has_collection(&self, collection: &str) -> bool;

    /// Creates a collection if it does not exist.
    fn create_collection(&self, collection: &str) -> CoreResult<()>;

    /// Reads the current revision of a document, tombstones included.
    fn get_document(&self, collection: &str, doc_id: &str) -> CoreResult<Option<Document>>;

    /// Saves a new revision on top of `expected_rev`.
    ///
    /// `expected_rev` is `None` for a document that does not exist (or is deleted).
    /// Fails with `CoreError::Conflict` if the current revision differs.
    fn save_document(
        &self,
        collection: &str,
        doc_id: &str,
        expected_rev: Option<&str>,
        body: Properties,
        deleted: bool,
    ) -> CoreResult<Document>;

    /// Removes every trace of a document. Returns false if it did not exist.
    fn purge_document(&self, collection: &str, doc_id: &str) -> CoreResult<bool>;

    /// Inserts a revision received from a peer that conflicts with the current one.
    ///
    /// If the document does not exist the revision simply becomes current.
    fn insert_conflicting_revision(
        &self,
        collection: &str,
        doc_id: &str,
        rev_id: &str,
        body: Properties,
        deleted: bool,
    ) -> CoreResult<SequenceNumber>;

    /// Returns the conflicting (non-winning) leaf revisions of a document.
    fn conflicting_revisions(&self, collection: &str, doc_id: &str)
        -> CoreResult<Vec<Document>>;

    /// Replaces the current revision and the losing leaf `losing_rev` with one new
    /// revision.
    ///
    /// Fails with `CoreError::Conflict` if the current revision is no longer
    /// `expected_local_rev` or `losing_rev` is no longer a conflicting leaf.
    fn resolve_conflict(
        &self,
        collection: &str,
        doc_id: &str,
        expected_local_rev: Option<&str>,
        losing_rev: &str,
        resolution: ResolvedRevision,
    ) -> CoreResult<Document>;

    /// Snapshot of the IDs of every conflicted document in a collection.
    fn conflicted_document_ids(&self, collection: &str) -> CoreResult<Vec<String>>;

    /// Number of live (non-deleted) documents in a collection.
    fn document_count(&self, collection: &str) -> CoreResult<u64>;

    /// Up to `limit` changes with sequences greater than `since`, ascending.
    fn changes_since(
        &self,
        collection: &str,
        since: SequenceNumber,
        limit: usize,
    ) -> CoreResult<Vec<ChangeEntry>>;

    /// Latest sequence assigned in this database.
    fn last_sequence(&self) -> SequenceNumber;

    /// Reads a raw document.
    fn get_raw(&self, store: &str, key: &str) -> CoreResult<Option<RawDocument>>;

    /// Writes a raw document unconditionally. Returns the new revision.
    fn put_raw(&self, store: &str, key: &str, body: Value) -> CoreResult<String>;

    /// Writes a raw document if its revision is still `expected_rev`.
    ///
    /// `None` means the document must not exist yet.
    fn put_raw_if(
        &self,
        store: &str,
        key: &str,
        expected_rev: Option<&str>,
        body: Value,
    ) -> CoreResult<String>;

    /// Deletes a raw document. Returns false if it did not exist.
    fn delete_raw(&self, store: &str, key: &str) -> CoreResult<bool>;

    /// Registers an observer of committed changes.
    fn observe(&self, observer: Arc<StoreObserver>) -> ListenerToken;
}
