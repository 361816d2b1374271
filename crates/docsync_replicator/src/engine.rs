//! Replication engine interface.
//!
//! The wire protocol and replication state machine live in an engine behind the
//! [`ReplicationEngine`] and [`EngineReplicator`] traits. The engine reports back
//! through the callbacks in [`ReplicatorParameters`], on threads of its choosing.
//!
//! [`MockEngine`] is a scriptable implementation for tests: it records every call and
//! lets the test emit statuses and document batches and run the registered filters.

use crate::config::Endpoint;
use docsync_core::{CoreResult, Database, ErrorInfo, Properties, RevisionFlags, SequenceNumber};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Activity level as the engine reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EngineActivityLevel {
    /// Not running.
    #[default]
    Stopped,
    /// Waiting for the network.
    Offline,
    /// Connecting to the remote.
    Connecting,
    /// Connected, nothing to do.
    Idle,
    /// Transferring.
    Busy,
    /// Shutting down.
    Stopping,
}

/// Raw progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineProgress {
    /// Work units done.
    pub units_completed: u64,
    /// Work units known.
    pub units_total: u64,
    /// Documents transferred so far.
    pub document_count: u64,
}

/// Status as the engine reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
    /// Activity level.
    pub level: EngineActivityLevel,
    /// Progress counters.
    pub progress: EngineProgress,
    /// Error, if any.
    pub error: Option<ErrorInfo>,
}

impl EngineStatus {
    /// Creates a status with no progress and no error.
    pub fn new(level: EngineActivityLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Sets the progress counters.
    #[must_use]
    pub fn with_progress(mut self, completed: u64, total: u64) -> Self {
        self.progress.units_completed = completed;
        self.progress.units_total = total;
        self
    }

    /// Sets the document count.
    #[must_use]
    pub fn with_document_count(mut self, count: u64) -> Self {
        self.progress.document_count = count;
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }
}

/// How one direction of a replication runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Direction disabled.
    #[default]
    Disabled,
    /// Run until caught up, then stop.
    OneShot,
    /// Keep running.
    Continuous,
}

/// How much detail the engine reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressLevel {
    /// Status changes only.
    #[default]
    Overall,
    /// Status changes plus a documents-ended event per document.
    PerDocument,
}

/// A document the engine finished replicating (or failed to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEnded {
    /// Collection name.
    pub collection: String,
    /// Document ID.
    pub doc_id: String,
    /// Revision that was transferred.
    pub rev_id: String,
    /// Revision flags; `CONFLICT` on a pulled revision means it needs resolving.
    pub flags: RevisionFlags,
    /// Local sequence of the revision.
    pub sequence: SequenceNumber,
    /// Error, if the transfer failed.
    pub error: Option<ErrorInfo>,
}

impl DocumentEnded {
    /// Creates a successful event.
    pub fn new(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        flags: RevisionFlags,
    ) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            flags,
            sequence: SequenceNumber::ZERO,
            error: None,
        }
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }
}

/// Status callback.
pub type StatusCallback = dyn Fn(EngineStatus) + Send + Sync;

/// Documents-ended callback; the flag is true for pushed documents.
pub type DocumentsEndedCallback = dyn Fn(bool, &[DocumentEnded]) + Send + Sync;

/// Engine-level filter: `(collection, doc_id, rev_id, flags, body) -> keep`.
pub type EngineFilter =
    dyn Fn(&str, &str, &str, RevisionFlags, &Properties) -> bool + Send + Sync;

/// Per-collection engine parameters.
#[derive(Clone, Default)]
pub struct CollectionParameters {
    /// Collection name.
    pub collection: String,
    /// Push mode.
    pub push: ReplicationMode,
    /// Pull mode.
    pub pull: ReplicationMode,
    /// Push filter.
    pub push_filter: Option<Arc<EngineFilter>>,
    /// Pull (validation) filter.
    pub pull_filter: Option<Arc<EngineFilter>>,
    /// Collection options (`docIDs`, `channels`).
    pub options: Value,
}

impl fmt::Debug for CollectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionParameters")
            .field("collection", &self.collection)
            .field("push", &self.push)
            .field("pull", &self.pull)
            .field("push_filter", &self.push_filter.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("options", &self.options)
            .finish()
    }
}

/// Everything the engine needs to create a replicator.
#[derive(Clone, Default)]
pub struct ReplicatorParameters {
    /// Push mode.
    pub push: ReplicationMode,
    /// Pull mode.
    pub pull: ReplicationMode,
    /// Options dictionary.
    pub options: Value,
    /// Collections to replicate.
    pub collections: Vec<CollectionParameters>,
    /// Called on every status change.
    pub on_status_changed: Option<Arc<StatusCallback>>,
    /// Called with batches of finished documents.
    pub on_documents_ended: Option<Arc<DocumentsEndedCallback>>,
}

impl fmt::Debug for ReplicatorParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorParameters")
            .field("push", &self.push)
            .field("pull", &self.pull)
            .field("options", &self.options)
            .field("collections", &self.collections)
            .finish_non_exhaustive()
    }
}

/// Creates engine replicators.
pub trait ReplicationEngine: Send + Sync {
    /// Creates a replicator for `db` targeting `endpoint`. The replicator is idle until
    /// started.
    fn create_replicator(
        &self,
        db: &Database,
        endpoint: &Endpoint,
        params: ReplicatorParameters,
    ) -> CoreResult<Arc<dyn EngineReplicator>>;
}

/// One engine-level replication.
pub trait EngineReplicator: Send + Sync {
    /// Starts replicating, optionally from scratch.
    fn start(&self, reset_checkpoint: bool);

    /// Asks the replicator to stop; a `Stopped` status follows asynchronously.
    fn stop(&self);

    /// Current status.
    fn status(&self) -> EngineStatus;

    /// Suspends or resumes without stopping.
    fn set_suspended(&self, suspended: bool);

    /// Hints whether the remote host is reachable.
    fn set_host_reachable(&self, reachable: bool);

    /// Sets how much detail is reported.
    fn set_progress_level(&self, level: ProgressLevel);

    /// IDs of documents in `collection` waiting to be pushed.
    fn pending_document_ids(&self, collection: &str) -> CoreResult<Vec<String>>;

    /// Returns true if the document is waiting to be pushed.
    fn is_document_pending(&self, collection: &str, doc_id: &str) -> CoreResult<bool>;
}

/// Scriptable engine for tests.
pub struct MockEngine {
    auto_stop: bool,
    created: Mutex<Vec<Arc<MockReplicator>>>,
}

impl MockEngine {
    /// Creates an engine whose replicators report `Stopped` as soon as they are stopped.
    pub fn new() -> Self {
        Self {
            auto_stop: true,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Creates an engine whose replicators ignore `stop` until the test emits a status.
    pub fn without_auto_stop() -> Self {
        Self {
            auto_stop: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every replicator created so far.
    pub fn replicators(&self) -> Vec<Arc<MockReplicator>> {
        self.created.lock().clone()
    }

    /// The most recently created replicator.
    pub fn last(&self) -> Option<Arc<MockReplicator>> {
        self.created.lock().last().cloned()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEngine")
            .field("auto_stop", &self.auto_stop)
            .field("created", &self.created.lock().len())
            .finish()
    }
}

impl ReplicationEngine for MockEngine {
    fn create_replicator(
        &self,
        db: &Database,
        endpoint: &Endpoint,
        params: ReplicatorParameters,
    ) -> CoreResult<Arc<dyn EngineReplicator>> {
        let replicator = Arc::new(MockReplicator {
            database: db.name().to_string(),
            endpoint: endpoint.address(),
            params,
            auto_stop: self.auto_stop,
            state: Mutex::new(MockState::default()),
        });
        self.created.lock().push(Arc::clone(&replicator));
        Ok(replicator)
    }
}

#[derive(Default)]
struct MockState {
    status: EngineStatus,
    starts: Vec<bool>,
    stops: usize,
    suspended: Option<bool>,
    host_reachable: Option<bool>,
    progress_levels: Vec<ProgressLevel>,
    pending: HashMap<String, Vec<String>>,
}

/// Replicator created by [`MockEngine`].
pub struct MockReplicator {
    database: String,
    endpoint: String,
    params: ReplicatorParameters,
    auto_stop: bool,
    state: Mutex<MockState>,
}

impl MockReplicator {
    /// Name of the database it was created for.
    pub fn database_name(&self) -> &str {
        &self.database
    }

    /// Address of the endpoint it was created for.
    pub fn endpoint_address(&self) -> &str {
        &self.endpoint
    }

    /// The parameters it was created with.
    pub fn params(&self) -> &ReplicatorParameters {
        &self.params
    }

    /// Reset flags of every `start` call.
    pub fn starts(&self) -> Vec<bool> {
        self.state.lock().starts.clone()
    }

    /// Number of `stop` calls.
    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }

    /// Last value passed to `set_suspended`.
    pub fn suspended(&self) -> Option<bool> {
        self.state.lock().suspended
    }

    /// Last value passed to `set_host_reachable`.
    pub fn host_reachable(&self) -> Option<bool> {
        self.state.lock().host_reachable
    }

    /// Current progress level.
    pub fn progress_level(&self) -> ProgressLevel {
        self.state
            .lock()
            .progress_levels
            .last()
            .copied()
            .unwrap_or_default()
    }

    /// Every progress level set, in order.
    pub fn progress_level_history(&self) -> Vec<ProgressLevel> {
        self.state.lock().progress_levels.clone()
    }

    /// Sets the IDs reported as pending for a collection.
    pub fn set_pending(&self, collection: &str, ids: &[&str]) {
        self.state.lock().pending.insert(
            collection.to_string(),
            ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    /// Records `status` and delivers it through the status callback.
    pub fn emit_status(&self, status: EngineStatus) {
        self.state.lock().status = status.clone();
        if let Some(callback) = &self.params.on_status_changed {
            callback(status);
        }
    }

    /// Delivers a batch through the documents-ended callback.
    pub fn emit_documents_ended(&self, pushing: bool, docs: &[DocumentEnded]) {
        if let Some(callback) = &self.params.on_documents_ended {
            callback(pushing, docs);
        }
    }

    /// Runs the collection's push or pull filter. `None` if it has none.
    pub fn run_filter(
        &self,
        pushing: bool,
        collection: &str,
        doc_id: &str,
        rev_id: &str,
        flags: RevisionFlags,
        body: &Properties,
    ) -> Option<bool> {
        let params = self
            .params
            .collections
            .iter()
            .find(|c| c.collection == collection)?;
        let filter = if pushing {
            params.push_filter.as_ref()
        } else {
            params.pull_filter.as_ref()
        }?;
        Some(filter(collection, doc_id, rev_id, flags, body))
    }
}

impl fmt::Debug for MockReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockReplicator")
            .field("database", &self.database)
            .field("endpoint", &self.endpoint)
            .field("status", &self.state.lock().status)
            .finish()
    }
}

impl EngineReplicator for MockReplicator {
    fn start(&self, reset_checkpoint: bool) {
        self.state.lock().starts.push(reset_checkpoint);
    }

    fn stop(&self) {
        self.state.lock().stops += 1;
        if self.auto_stop {
            self.emit_status(EngineStatus::new(EngineActivityLevel::Stopped));
        }
    }

    fn status(&self) -> EngineStatus {
        self.state.lock().status.clone()
    }

    fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = Some(suspended);
    }

    fn set_host_reachable(&self, reachable: bool) {
        self.state.lock().host_reachable = Some(reachable);
    }

    fn set_progress_level(&self, level: ProgressLevel) {
        self.state.lock().progress_levels.push(level);
    }

    fn pending_document_ids(&self, collection: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .pending
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    fn is_document_pending(&self, collection: &str, doc_id: &str) -> CoreResult<bool> {
        Ok(self
            .state
            .lock()
            .pending
            .get(collection)
            .is_some_and(|ids| ids.iter().any(|id| id == doc_id)))
    }
}
