//! Database handle.
//!
//! A [`Database`] ties a [`DocumentStore`] to the services the replication layer needs
//! around it: a task scheduler, a notification queue, change listeners, and the
//! registry of running tasks that must be stopped before the database can close.
//!
//! ```rust,ignore
//! let db = Database::open_in_memory("travel")?;
//! let mut doc = Document::new("hotel-1");
//! doc.set("name", "Grand");
//! db.default_collection().save_document(&mut doc)?;
//! ```

use crate::config::DatabaseConfig;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::listener::{ListenerToken, Listeners};
use crate::memory::MemoryStore;
use crate::notification::{Notification, NotificationQueue, ReadyCallback};
use crate::scheduler::{TaskScheduler, ThreadScheduler};
use crate::store::{ChangeEntry, DocumentStore};
use crate::types::DEFAULT_COLLECTION;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use uuid::Uuid;

/// Something the database must stop before it can close, such as a running replicator.
pub trait Stoppable: Send + Sync {
    /// Asks the task to stop. The task unregisters itself once it has stopped.
    fn stop(&self);
}

/// Documents changed in one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseChange {
    /// Collection name.
    pub collection: String,
    /// IDs of the changed documents, in commit order.
    pub doc_ids: Vec<String>,
}

/// Database change listener.
pub type ChangeCallback = dyn Fn(&DatabaseChange) + Send + Sync;

#[derive(Default)]
struct StoppableState {
    closing: bool,
    closed: bool,
    running: HashMap<u64, Arc<dyn Stoppable>>,
}

struct DatabaseInner {
    name: String,
    config: DatabaseConfig,
    store: Arc<dyn DocumentStore>,
    scheduler: Arc<dyn TaskScheduler>,
    notifications: NotificationQueue,
    change_listeners: Listeners<ChangeCallback>,
    stoppables: Mutex<StoppableState>,
    all_stopped: Condvar,
    next_stoppable_id: AtomicU64,
    store_observer: Mutex<Option<ListenerToken>>,
}

/// A shared handle to an open database.
///
/// Cloning is cheap; every clone refers to the same database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens a new in-memory database with default configuration.
    pub fn open_in_memory(name: impl Into<String>) -> CoreResult<Self> {
        Self::open_with(
            name,
            Arc::new(MemoryStore::new()),
            Arc::new(ThreadScheduler::new()),
            DatabaseConfig::default(),
        )
    }

    /// Opens a database over the given store and scheduler.
    pub fn open_with(
        name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        scheduler: Arc<dyn TaskScheduler>,
        config: DatabaseConfig,
    ) -> CoreResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::invalid_parameter("database name is empty"));
        }

        let inner = Arc::new(DatabaseInner {
            name,
            config,
            store,
            scheduler,
            notifications: NotificationQueue::new(),
            change_listeners: Listeners::new(),
            stoppables: Mutex::new(StoppableState::default()),
            all_stopped: Condvar::new(),
            next_stoppable_id: AtomicU64::new(1),
            store_observer: Mutex::new(None),
        });

        let weak: Weak<DatabaseInner> = Arc::downgrade(&inner);
        let token = inner.store.observe(Arc::new(move |entries: &[ChangeEntry]| {
            if let Some(inner) = weak.upgrade() {
                inner.post_changes(entries);
            }
        }));
        *inner.store_observer.lock() = Some(token);

        tracing::debug!(name = %inner.name, uuid = %inner.store.uuid(), "opened database");
        Ok(Self { inner })
    }

    /// Returns the database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the database UUID.
    pub fn uuid(&self) -> Uuid {
        self.inner.store.uuid()
    }

    /// Returns the configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Returns the background task scheduler.
    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.inner.scheduler
    }

    /// Returns true if both handles refer to the same database.
    pub fn ptr_eq(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the default collection.
    pub fn default_collection(&self) -> Collection {
        Collection {
            db: self.clone(),
            name: DEFAULT_COLLECTION.to_string(),
        }
    }

    /// Returns the named collection, if it exists.
    pub fn collection(&self, name: &str) -> Option<Collection> {
        self.inner.store.has_collection(name).then(|| Collection {
            db: self.clone(),
            name: name.to_string(),
        })
    }

    /// Returns the named collection, creating it if needed.
    pub fn create_collection(&self, name: &str) -> CoreResult<Collection> {
        self.check_open()?;
        self.inner.store.create_collection(name)?;
        Ok(Collection {
            db: self.clone(),
            name: name.to_string(),
        })
    }

    /// Registers a listener for document changes in any collection.
    ///
    /// Listeners run through the notification queue.
    pub fn add_change_listener(&self, listener: Arc<ChangeCallback>) -> ListenerToken {
        self.inner.change_listeners.add(listener)
    }

    /// Switches to buffered notifications; `ready` fires when some are waiting.
    pub fn buffer_notifications(&self, ready: ReadyCallback) {
        self.inner.notifications.set_callback(Some(ready));
    }

    /// Delivers all buffered notifications on the calling thread.
    pub fn send_notifications(&self) {
        self.inner.notifications.notify_all();
    }

    /// Posts a notification through the queue.
    pub fn notify(&self, notification: Notification) {
        self.inner.notifications.add(notification);
    }

    /// Returns a fresh ID for [`register_stoppable`](Self::register_stoppable).
    pub fn new_stoppable_id(&self) -> u64 {
        self.inner.next_stoppable_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a running task. Returns false if the database is closing or closed.
    pub fn register_stoppable(&self, id: u64, stoppable: Arc<dyn Stoppable>) -> bool {
        let mut state = self.inner.stoppables.lock();
        if state.closing || state.closed {
            return false;
        }
        state.running.insert(id, stoppable);
        true
    }

    /// Unregisters a task that has stopped.
    pub fn unregister_stoppable(&self, id: u64) {
        let mut state = self.inner.stoppables.lock();
        if state.running.remove(&id).is_some() && state.running.is_empty() {
            self.inner.all_stopped.notify_all();
        }
    }

    /// Number of registered running tasks.
    pub fn running_count(&self) -> usize {
        self.inner.stoppables.lock().running.len()
    }

    /// Returns true once [`close`](Self::close) has succeeded.
    pub fn is_closed(&self) -> bool {
        self.inner.stoppables.lock().closed
    }

    /// Stops every running task, waits for them to unregister, then closes.
    ///
    /// Fails with `CoreError::Busy` if tasks are still running after the close timeout;
    /// the database then stays open.
    pub fn close(&self) -> CoreResult<()> {
        let running: Vec<Arc<dyn Stoppable>> = {
            let mut state = self.inner.stoppables.lock();
            if state.closed {
                return Ok(());
            }
            state.closing = true;
            state.running.values().cloned().collect()
        };

        if !running.is_empty() {
            tracing::info!(
                name = %self.inner.name,
                count = running.len(),
                "stopping running tasks before close"
            );
        }
        for task in running {
            task.stop();
        }

        let deadline = Instant::now() + self.inner.config.close_timeout;
        let mut state = self.inner.stoppables.lock();
        while !state.running.is_empty() {
            if self
                .inner
                .all_stopped
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        if !state.running.is_empty() {
            state.closing = false;
            tracing::warn!(
                name = %self.inner.name,
                count = state.running.len(),
                "tasks still running, database not closed"
            );
            return Err(CoreError::busy("tasks are still running"));
        }
        state.closed = true;
        drop(state);

        self.inner.change_listeners.clear();
        tracing::debug!(name = %self.inner.name, "closed database");
        Ok(())
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.inner.stoppables.lock().closed {
            Err(CoreError::DatabaseClosed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("uuid", &self.inner.store.uuid())
            .finish()
    }
}

impl DatabaseInner {
    /// Groups committed changes by collection and queues one notification each.
    fn post_changes(self: &Arc<Self>, entries: &[ChangeEntry]) {
        if self.change_listeners.is_empty() {
            return;
        }
        let mut by_collection: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for entry in entries {
            by_collection
                .entry(entry.collection.as_str())
                .or_default()
                .push(entry.doc_id.clone());
        }
        for (collection, doc_ids) in by_collection {
            let change = DatabaseChange {
                collection: collection.to_string(),
                doc_ids,
            };
            let weak = Arc::downgrade(self);
            self.notifications.add(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.change_listeners.call(|listener| listener(&change));
                }
            }));
        }
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Some(token) = self.store_observer.get_mut().take() {
            token.remove();
        }
    }
}

/// A named collection of documents within a [`Database`].
#[derive(Clone)]
pub struct Collection {
    db: Database,
    name: String,
}

impl Collection {
    /// Returns the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owning database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Reads a document. Deleted documents read as `None`.
    pub fn get_document(&self, doc_id: &str) -> CoreResult<Option<Document>> {
        self.db.check_open()?;
        Ok(self
            .db
            .store()
            .get_document(&self.name, doc_id)?
            .filter(|doc| !doc.is_deleted()))
    }

    /// Saves a document on top of the revision it was read at.
    ///
    /// Fails with `CoreError::Conflict` if the document changed in the meantime. On
    /// success `doc` is updated to the saved revision.
    pub fn save_document(&self, doc: &mut Document) -> CoreResult<()> {
        self.save(doc, false)
    }

    /// Saves a document, consulting `handler` whenever the save conflicts.
    ///
    /// The handler receives the document being saved and the current stored revision
    /// (`None` if it was deleted or purged). It may edit the document being saved and
    /// returns true to retry on top of the current revision, or false to give up with
    /// a conflict error.
    pub fn save_document_with_conflict_handler<H>(
        &self,
        doc: &mut Document,
        handler: H,
    ) -> CoreResult<()>
    where
        H: Fn(&mut Document, Option<&Document>) -> bool,
    {
        let attempts = self.db.config().max_conflict_handler_attempts;
        for attempt in 1..=attempts {
            match self.save(doc, false) {
                Err(err) if err.is_conflict() => {
                    let current = self
                        .db
                        .store()
                        .get_document(&self.name, doc.id())?
                        .filter(|d| !d.is_deleted());
                    tracing::debug!(doc_id = %doc.id(), attempt, "save conflicted, asking handler");
                    if !handler(doc, current.as_ref()) {
                        return Err(CoreError::conflict(doc.id()));
                    }
                    let base = self.db.store().get_document(&self.name, doc.id())?;
                    doc.rebase(base.as_ref());
                }
                other => return other,
            }
        }
        Err(CoreError::conflict(doc.id()))
    }

    /// Deletes a saved document.
    pub fn delete_document(&self, doc: &Document) -> CoreResult<()> {
        if doc.revision_id().is_none() {
            return Err(CoreError::not_found(format!("document '{}'", doc.id())));
        }
        let mut tombstone = doc.clone();
        self.save(&mut tombstone, true)
    }

    /// Purges a document. Returns false if it did not exist.
    pub fn purge_document(&self, doc_id: &str) -> CoreResult<bool> {
        self.db.check_open()?;
        self.db.store().purge_document(&self.name, doc_id)
    }

    /// Number of live documents.
    pub fn document_count(&self) -> CoreResult<u64> {
        self.db.check_open()?;
        self.db.store().document_count(&self.name)
    }

    /// Registers a listener for changes in this collection only.
    pub fn add_change_listener(&self, listener: Arc<ChangeCallback>) -> ListenerToken {
        let name = self.name.clone();
        self.db.add_change_listener(Arc::new(move |change: &DatabaseChange| {
            if change.collection == name {
                listener(change);
            }
        }))
    }

    fn save(&self, doc: &mut Document, deleted: bool) -> CoreResult<()> {
        self.db.check_open()?;
        let body = if deleted {
            Default::default()
        } else {
            doc.properties().clone()
        };
        let saved = self.db.store().save_document(
            &self.name,
            doc.id(),
            doc.revision_id(),
            body,
            deleted,
        )?;
        *doc = saved;
        Ok(())
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("database", &self.db.name())
            .field("name", &self.name)
            .finish()
    }
}
