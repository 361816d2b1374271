//! Replicator session.
//!
//! A [`Replicator`] drives one engine replicator: it turns its configuration into
//! engine parameters, relays engine status and document events to its listeners,
//! resolves conflicting pulled revisions in the background, and keeps itself alive
//! while running by registering with its database.
//!
//! Engine callbacks only hold a [`ContextHandle`]. Once the session is gone the handle
//! goes stale and late callbacks are dropped.
//!
//! ```rust,ignore
//! let config = ReplicatorConfiguration::new(&db, Endpoint::url("wss://host/db")?);
//! let replicator = Replicator::new(config, &engine)?;
//! replicator.add_change_listener(Arc::new(|status| println!("{:?}", status.activity)));
//! replicator.start(false);
//! ```

use crate::config::{CollectionConfiguration, ReplicatorConfiguration};
use crate::conflict::ConflictResolver;
use crate::context::{ContextHandle, ContextManager};
use crate::engine::{
    CollectionParameters, DocumentEnded, EngineFilter, EngineReplicator, EngineStatus,
    ProgressLevel, ReplicationEngine, ReplicationMode, ReplicatorParameters,
};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::status::{ActivityLevel, ReplicatedDocument, ReplicatorStatus};
use docsync_core::{
    Collection, Database, Document, DocumentFlags, ListenerToken, Listeners, Properties,
    RevisionFlags, SequenceNumber, Stoppable,
};
use parking_lot::ReentrantMutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Receives every status change.
pub type ReplicatorChangeListener = dyn Fn(&ReplicatorStatus) + Send + Sync;

/// Receives batches of replicated documents; the flag is true for pushed documents.
pub type DocumentReplicationListener = dyn Fn(bool, &[ReplicatedDocument]) + Send + Sync;

struct SessionState {
    engine_status: EngineStatus,
    use_initial_status: bool,
    active_resolvers: u32,
    running: bool,
    progress_level: ProgressLevel,
}

struct ReplicatorInner {
    config: ReplicatorConfiguration,
    db: Database,
    collections: Vec<CollectionConfiguration>,
    handle: ContextHandle,
    stoppable_id: u64,
    engine: Arc<dyn EngineReplicator>,
    state: ReentrantMutex<RefCell<SessionState>>,
    change_listeners: Listeners<ReplicatorChangeListener>,
    document_listeners: Listeners<DocumentReplicationListener>,
}

/// A replication between a local database and an endpoint.
///
/// Cloning is cheap; every clone refers to the same session.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
}

impl Replicator {
    /// Validates `config` and creates the engine replicator. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        config: ReplicatorConfiguration,
        engine: &dyn ReplicationEngine,
    ) -> ReplicatorResult<Self> {
        config.validate()?;
        let db = config.effective_database()?;
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| ReplicatorError::invalid_config("missing endpoint"))?;
        let collections = config.effective_collections();

        let contexts = ContextManager::shared();
        let handle = contexts.reserve();
        let params = engine_parameters(&config, &collections, handle);
        let engine_replicator = match engine.create_replicator(&db, &endpoint, params) {
            Ok(replicator) => replicator,
            Err(err) => {
                contexts.unregister(handle);
                return Err(err.into());
            }
        };

        let inner = Arc::new(ReplicatorInner {
            stoppable_id: db.new_stoppable_id(),
            db,
            collections,
            handle,
            engine: engine_replicator,
            state: ReentrantMutex::new(RefCell::new(SessionState {
                engine_status: EngineStatus::default(),
                use_initial_status: true,
                active_resolvers: 0,
                running: false,
                progress_level: ProgressLevel::Overall,
            })),
            change_listeners: Listeners::new(),
            document_listeners: Listeners::new(),
            config,
        });
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&inner) as Weak<dyn Any + Send + Sync>;
        contexts.bind(handle, weak);

        tracing::info!(
            database = %inner.db.name(),
            endpoint = %endpoint.address(),
            replicator_type = inner.config.replicator_type.as_str(),
            continuous = inner.config.continuous,
            context = %handle,
            "created replicator"
        );
        Ok(Self { inner })
    }

    /// The configuration the replicator was created with.
    pub fn config(&self) -> &ReplicatorConfiguration {
        &self.inner.config
    }

    /// The local database.
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Starts replicating, optionally ignoring the saved checkpoint.
    ///
    /// If the database is closing the start is ignored with a warning.
    pub fn start(&self, reset_checkpoint: bool) {
        let inner = &self.inner;
        {
            let guard = inner.state.lock();
            let mut state = guard.borrow_mut();
            state.use_initial_status = false;
            if !state.running {
                let stoppable: Arc<dyn Stoppable> = Arc::clone(inner) as Arc<dyn Stoppable>;
                if !inner.db.register_stoppable(inner.stoppable_id, stoppable) {
                    tracing::warn!("Couldn't start the replicator as the database is closing or closed.");
                    return;
                }
                state.running = true;
            }
        }
        tracing::debug!(context = %inner.handle, reset_checkpoint, "starting replicator");
        inner.engine.start(reset_checkpoint);
    }

    /// Asks the replicator to stop. Listeners see `Stopped` once it has.
    pub fn stop(&self) {
        self.inner.engine.stop();
    }

    /// Suspends or resumes replication without stopping.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.engine.set_suspended(suspended);
    }

    /// Tells the replicator whether the remote host is reachable.
    pub fn set_host_reachable(&self, reachable: bool) {
        self.inner.engine.set_host_reachable(reachable);
    }

    /// Current status. Reports `Busy` while conflicts are being resolved, unless
    /// offline.
    pub fn status(&self) -> ReplicatorStatus {
        let active = {
            let guard = self.inner.state.lock();
            let state = guard.borrow();
            if state.use_initial_status {
                return ReplicatorStatus::default();
            }
            state.active_resolvers
        };
        effective_status(&self.inner.engine.status(), active)
    }

    /// Number of conflict resolutions in progress.
    pub fn active_conflict_resolvers(&self) -> u32 {
        let guard = self.inner.state.lock();
        let active = guard.borrow().active_resolvers;
        active
    }

    /// Registers a status listener.
    pub fn add_change_listener(&self, listener: Arc<ReplicatorChangeListener>) -> ListenerToken {
        let _guard = self.inner.state.lock();
        self.inner.change_listeners.add(listener)
    }

    /// Registers a document listener. The engine reports per-document progress only
    /// while at least one is registered.
    pub fn add_document_listener(
        &self,
        listener: Arc<DocumentReplicationListener>,
    ) -> ListenerToken {
        let guard = self.inner.state.lock();
        if self.inner.document_listeners.is_empty() {
            self.inner.engine.set_progress_level(ProgressLevel::PerDocument);
            guard.borrow_mut().progress_level = ProgressLevel::PerDocument;
        }
        self.inner.document_listeners.add(listener)
    }

    /// IDs of documents in `collection` waiting to be pushed.
    pub fn pending_document_ids(&self, collection: &Collection) -> ReplicatorResult<HashSet<String>> {
        let name = self.inner.pushed_collection(collection)?;
        Ok(self
            .inner
            .engine
            .pending_document_ids(name)?
            .into_iter()
            .collect())
    }

    /// Returns true if the document is waiting to be pushed.
    pub fn is_document_pending(
        &self,
        collection: &Collection,
        doc_id: &str,
    ) -> ReplicatorResult<bool> {
        let name = self.inner.pushed_collection(collection)?;
        Ok(self.inner.engine.is_document_pending(name, doc_id)?)
    }
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("database", &self.inner.db.name())
            .field("endpoint", &self.inner.config.endpoint)
            .field("replicator_type", &self.inner.config.replicator_type)
            .field("context", &self.inner.handle)
            .finish()
    }
}

impl ReplicatorInner {
    fn pushed_collection(&self, collection: &Collection) -> ReplicatorResult<&str> {
        if !self.config.replicator_type.is_push() {
            return Err(ReplicatorError::invalid_state(
                "pending documents are only tracked by push replicators",
            ));
        }
        self.collection_config(collection.name())
            .filter(|config| config.collection.database().ptr_eq(collection.database()))
            .map(|config| config.collection.name())
            .ok_or_else(|| {
                ReplicatorError::invalid_state(format!(
                    "collection '{}' is not replicated",
                    collection.name()
                ))
            })
    }

    fn collection_config(&self, name: &str) -> Option<&CollectionConfiguration> {
        self.collections
            .iter()
            .find(|config| config.collection.name() == name)
    }

    fn status_changed(self: &Arc<Self>, status: EngineStatus) {
        let guard = self.state.lock();
        let (effective, release) = {
            let mut state = guard.borrow_mut();
            state.engine_status = status.clone();
            let effective = effective_status(&status, state.active_resolvers);
            let release = effective.activity == ActivityLevel::Stopped && state.running;
            if release {
                state.running = false;
            }
            (effective, release)
        };

        tracing::info!(
            context = %self.handle,
            level = ?status.level,
            completed = status.progress.units_completed,
            total = status.progress.units_total,
            error = ?status.error,
            effective = ?effective.activity,
            complete = effective.progress.complete,
            documents = effective.progress.document_count,
            "replicator status"
        );

        if !self.change_listeners.is_empty() {
            let inner = Arc::clone(self);
            self.db.notify(Box::new(move || {
                inner.change_listeners.call(|listener| listener(&effective));
            }));
        } else if let Some(error) = &effective.error {
            tracing::warn!(context = %self.handle, error = %error, "no listener to receive replicator error");
        }

        if release {
            self.db.unregister_stoppable(self.stoppable_id);
            tracing::debug!(context = %self.handle, "replicator stopped");
        }
        drop(guard);
    }

    fn documents_ended(self: &Arc<Self>, pushing: bool, docs: &[DocumentEnded]) {
        let guard = self.state.lock();
        let listening = !self.document_listeners.is_empty();
        if !listening {
            let demote = guard.borrow().progress_level != ProgressLevel::Overall;
            if demote {
                self.engine.set_progress_level(ProgressLevel::Overall);
                guard.borrow_mut().progress_level = ProgressLevel::Overall;
            }
        }

        let mut batch = Vec::new();
        for doc in docs {
            if !pushing && doc.flags.is_conflict() {
                match self.collection_config(&doc.collection) {
                    Some(config) => {
                        self.start_conflict_resolver(config, doc);
                        continue;
                    }
                    None => tracing::warn!(
                        collection = %doc.collection,
                        doc_id = %doc.doc_id,
                        "conflict in a collection that is not replicated"
                    ),
                }
            }
            if listening {
                batch.push(ReplicatedDocument {
                    collection: doc.collection.clone(),
                    id: doc.doc_id.clone(),
                    flags: DocumentFlags::from(doc.flags),
                    error: doc.error.clone(),
                });
            }
        }
        if !batch.is_empty() {
            self.notify_documents(pushing, batch);
        }
        drop(guard);
    }

    fn start_conflict_resolver(self: &Arc<Self>, config: &CollectionConfiguration, doc: &DocumentEnded) {
        let resolver = ConflictResolver::new(
            config.collection.clone(),
            doc.doc_id.clone(),
            Some(doc.rev_id.clone()),
        )
        .with_resolver(config.conflict_resolver.clone())
        .with_flags(doc.flags)
        .with_max_attempts(self.config.max_resolution_attempts);

        self.bump_conflict_resolver_count(1);
        let inner = Arc::clone(self);
        resolver.run_async(Box::new(move |result| inner.conflict_resolver_finished(result)));
    }

    fn conflict_resolver_finished(self: &Arc<Self>, result: ReplicatedDocument) {
        if !self.document_listeners.is_empty() {
            self.notify_documents(false, vec![result]);
        }
        self.bump_conflict_resolver_count(-1);
    }

    fn bump_conflict_resolver_count(self: &Arc<Self>, delta: i32) {
        let guard = self.state.lock();
        let changed = {
            let mut state = guard.borrow_mut();
            let before = effective_status(&state.engine_status, state.active_resolvers).activity;
            state.active_resolvers = state.active_resolvers.saturating_add_signed(delta);
            let after = effective_status(&state.engine_status, state.active_resolvers).activity;
            (before != after).then(|| state.engine_status.clone())
        };
        if let Some(status) = changed {
            self.status_changed(status);
        }
        drop(guard);
    }

    fn notify_documents(self: &Arc<Self>, pushing: bool, docs: Vec<ReplicatedDocument>) {
        let inner = Arc::clone(self);
        self.db.notify(Box::new(move || {
            inner.document_listeners.call(|listener| listener(pushing, &docs));
        }));
    }

    fn filter(
        &self,
        collection: &str,
        doc_id: &str,
        rev_id: &str,
        flags: RevisionFlags,
        body: &Properties,
        pushing: bool,
    ) -> bool {
        let Some(config) = self.collection_config(collection) else {
            return false;
        };
        let filter = if pushing {
            config.push_filter.as_ref()
        } else {
            config.pull_filter.as_ref()
        };
        let Some(filter) = filter else {
            return true;
        };
        let doc = Document::from_revision(
            self.db.uuid(),
            collection,
            doc_id,
            rev_id,
            SequenceNumber::ZERO,
            flags,
            body.clone(),
        );
        match catch_unwind(AssertUnwindSafe(|| filter(&doc, DocumentFlags::from(flags)))) {
            Ok(keep) => keep,
            Err(_) => {
                tracing::warn!(doc_id = %doc_id, pushing, "replication filter panicked, skipping document");
                false
            }
        }
    }
}

impl Stoppable for ReplicatorInner {
    fn stop(&self) {
        self.engine.stop();
    }
}

impl Drop for ReplicatorInner {
    fn drop(&mut self) {
        ContextManager::shared().unregister(self.handle);
        tracing::debug!(context = %self.handle, "replicator freed");
    }
}

/// The status listeners see: `Busy` while conflict resolvers run, unless offline.
fn effective_status(status: &EngineStatus, active_resolvers: u32) -> ReplicatorStatus {
    let mut effective = ReplicatorStatus::from(status);
    if active_resolvers > 0 && effective.activity != ActivityLevel::Offline {
        effective.activity = ActivityLevel::Busy;
    }
    effective
}

fn mode(enabled: bool, continuous: bool) -> ReplicationMode {
    match (enabled, continuous) {
        (false, _) => ReplicationMode::Disabled,
        (true, false) => ReplicationMode::OneShot,
        (true, true) => ReplicationMode::Continuous,
    }
}

fn engine_parameters(
    config: &ReplicatorConfiguration,
    collections: &[CollectionConfiguration],
    handle: ContextHandle,
) -> ReplicatorParameters {
    let push = mode(config.replicator_type.is_push(), config.continuous);
    let pull = mode(config.replicator_type.is_pull(), config.continuous);
    ReplicatorParameters {
        push,
        pull,
        options: config.write_options(),
        collections: collections
            .iter()
            .map(|collection| CollectionParameters {
                collection: collection.collection.name().to_string(),
                push,
                pull,
                push_filter: collection
                    .push_filter
                    .as_ref()
                    .map(|_| filter_trampoline(handle, true)),
                pull_filter: collection
                    .pull_filter
                    .as_ref()
                    .map(|_| filter_trampoline(handle, false)),
                options: collection.write_options(),
            })
            .collect(),
        on_status_changed: Some(Arc::new(move |status: EngineStatus| {
            if let Some(inner) = ContextManager::shared().get::<ReplicatorInner>(handle) {
                inner.status_changed(status);
            }
        })),
        on_documents_ended: Some(Arc::new(move |pushing: bool, docs: &[DocumentEnded]| {
            if let Some(inner) = ContextManager::shared().get::<ReplicatorInner>(handle) {
                inner.documents_ended(pushing, docs);
            }
        })),
    }
}

fn filter_trampoline(handle: ContextHandle, pushing: bool) -> Arc<EngineFilter> {
    Arc::new(
        move |collection: &str,
              doc_id: &str,
              rev_id: &str,
              flags: RevisionFlags,
              body: &Properties| {
            ContextManager::shared()
                .get::<ReplicatorInner>(handle)
                .is_some_and(|inner| inner.filter(collection, doc_id, rev_id, flags, body, pushing))
        },
    )
}
