//! Conflict resolution.
//!
//! A [`ConflictResolver`] resolves one conflicted document: it picks the conflicting
//! revision, asks the resolver function (or applies the local-wins default) which
//! side to keep, and replaces both leaves with the outcome. If a local write races
//! with the resolution the whole cycle runs again, up to a bounded number of attempts.
//!
//! [`AllConflictsResolver`] sweeps every conflicted document of a collection.

use crate::config::{ConflictResolverFn, DEFAULT_MAX_RESOLUTION_ATTEMPTS};
use crate::error::ReplicatorResult;
use crate::status::ReplicatedDocument;
use docsync_core::{
    Collection, CoreError, Document, DocumentFlags, ErrorInfo, ResolvedRevision, RevisionFlags,
};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Receives the outcome of an asynchronous resolution.
pub type ResolverCompletion = Box<dyn FnOnce(ReplicatedDocument) + Send>;

/// Resolves the conflict of one document.
pub struct ConflictResolver {
    collection: Collection,
    doc_id: String,
    rev_id: Option<String>,
    flags: RevisionFlags,
    resolver: Option<Arc<ConflictResolverFn>>,
    max_attempts: u32,
}

impl ConflictResolver {
    /// Creates a resolver for `doc_id`.
    ///
    /// `rev_id` names the conflicting revision to resolve; `None` picks whichever
    /// conflicting revision comes first.
    pub fn new(collection: Collection, doc_id: impl Into<String>, rev_id: Option<String>) -> Self {
        Self {
            collection,
            doc_id: doc_id.into(),
            rev_id,
            flags: RevisionFlags::NONE,
            resolver: None,
            max_attempts: DEFAULT_MAX_RESOLUTION_ATTEMPTS,
        }
    }

    /// Uses a custom resolver function instead of the local-wins default.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Option<Arc<ConflictResolverFn>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the revision flags reported with the result when resolution fails.
    #[must_use]
    pub fn with_flags(mut self, flags: RevisionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the attempt limit (at least 1).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// The document being resolved.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The conflicting revision being resolved, if one was named.
    pub fn revision_id(&self) -> Option<&str> {
        self.rev_id.as_deref()
    }

    /// Resolves on the calling thread.
    pub fn run_now(&self) -> ReplicatedDocument {
        let started = Instant::now();
        for attempt in 1..=self.max_attempts {
            match self.resolve_once() {
                Ok(flags) => {
                    tracing::debug!(
                        doc_id = %self.doc_id,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "resolved conflict"
                    );
                    return self.result(flags, None);
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!(doc_id = %self.doc_id, attempt, "conflict resolution raced with a save, retrying");
                }
                Err(err) => {
                    tracing::warn!(doc_id = %self.doc_id, error = %err, "conflict resolution failed");
                    return self.result(self.flags, Some(err.to_info()));
                }
            }
        }
        tracing::warn!(
            doc_id = %self.doc_id,
            attempts = self.max_attempts,
            "giving up on conflict resolution"
        );
        self.result(
            self.flags,
            Some(ErrorInfo::conflict(format!(
                "conflict resolution for '{}' failed after {} attempts",
                self.doc_id, self.max_attempts
            ))),
        )
    }

    /// Resolves on the database scheduler and passes the outcome to `completion`.
    pub fn run_async(self, completion: ResolverCompletion) {
        tracing::debug!(doc_id = %self.doc_id, rev_id = ?self.rev_id, "scheduling conflict resolution");
        let scheduler = Arc::clone(self.collection.database().scheduler());
        scheduler.run_async(Box::new(move || {
            let result = self.run_now();
            completion(result);
        }));
    }

    /// One selection + resolution cycle. Returns the flags of the outcome.
    fn resolve_once(&self) -> ReplicatorResult<RevisionFlags> {
        let store = self.collection.database().store();
        let name = self.collection.name();

        let Some(local) = store.get_document(name, &self.doc_id)? else {
            tracing::debug!(doc_id = %self.doc_id, "document is gone, nothing to resolve");
            return Ok(self.flags);
        };
        let mut conflicts = store.conflicting_revisions(name, &self.doc_id)?;
        let remote = match &self.rev_id {
            Some(rev) => conflicts
                .iter()
                .position(|doc| doc.revision_id() == Some(rev.as_str()))
                .map(|i| conflicts.swap_remove(i)),
            None => conflicts.into_iter().next(),
        };
        let Some(remote) = remote else {
            tracing::debug!(doc_id = %self.doc_id, "conflict already resolved");
            return Ok(local.flags().without(RevisionFlags::CONFLICT));
        };
        let losing_rev = remote
            .revision_id()
            .ok_or_else(|| CoreError::unexpected("conflicting revision has no revision ID"))?
            .to_string();

        let resolution = match &self.resolver {
            None => ResolvedRevision::KeepLocal,
            Some(resolver) => self.call_resolver(resolver, &local, &remote)?,
        };
        let resolved = store.resolve_conflict(
            name,
            &self.doc_id,
            local.revision_id(),
            &losing_rev,
            resolution,
        )?;
        Ok(resolved.flags())
    }

    fn call_resolver(
        &self,
        resolver: &Arc<ConflictResolverFn>,
        local: &Document,
        remote: &Document,
    ) -> ReplicatorResult<ResolvedRevision> {
        let local = (!local.is_deleted()).then(|| Arc::new(local.clone()));
        let remote = (!remote.is_deleted()).then(|| Arc::new(remote.clone()));

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            resolver(&self.doc_id, local.clone(), remote.clone())
        }));
        tracing::debug!(
            doc_id = %self.doc_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "custom conflict resolver returned"
        );
        let chosen = outcome
            .map_err(|_| CoreError::unexpected("custom conflict resolver panicked"))?;

        let Some(chosen) = chosen else {
            return Ok(if local.is_none() && remote.is_none() {
                ResolvedRevision::KeepLocal
            } else {
                ResolvedRevision::Deleted
            });
        };
        if local.as_ref().is_some_and(|l| Arc::ptr_eq(l, &chosen)) {
            return Ok(ResolvedRevision::KeepLocal);
        }
        if remote.as_ref().is_some_and(|r| Arc::ptr_eq(r, &chosen)) {
            return Ok(ResolvedRevision::TakeRemote);
        }

        let db = self.collection.database();
        if chosen.database().is_some_and(|uuid| uuid != db.uuid()) {
            return Err(CoreError::invalid_parameter(format!(
                "resolved document for '{}' belongs to another database",
                self.doc_id
            ))
            .into());
        }
        if chosen.id() != self.doc_id {
            return Err(CoreError::invalid_parameter(format!(
                "resolved document ID '{}' does not match '{}'",
                chosen.id(),
                self.doc_id
            ))
            .into());
        }
        Ok(if chosen.is_deleted() {
            ResolvedRevision::Deleted
        } else {
            ResolvedRevision::Merged(chosen.properties().clone())
        })
    }

    fn result(&self, flags: RevisionFlags, error: Option<ErrorInfo>) -> ReplicatedDocument {
        ReplicatedDocument {
            collection: self.collection.name().to_string(),
            id: self.doc_id.clone(),
            flags: DocumentFlags::from(flags),
            error,
        }
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("collection", &self.collection.name())
            .field("doc_id", &self.doc_id)
            .field("rev_id", &self.rev_id)
            .field("custom", &self.resolver.is_some())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Resolves every conflicted document of a collection, one after another.
pub struct AllConflictsResolver {
    collection: Collection,
    resolver: Option<Arc<ConflictResolverFn>>,
    max_attempts: u32,
}

impl AllConflictsResolver {
    /// Creates a sweep over `collection`.
    pub fn new(collection: Collection, resolver: Option<Arc<ConflictResolverFn>>) -> Self {
        Self {
            collection,
            resolver,
            max_attempts: DEFAULT_MAX_RESOLUTION_ATTEMPTS,
        }
    }

    /// Sets the per-document attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Resolves the documents that are conflicted now. Returns one result per document.
    pub fn run(&self) -> ReplicatorResult<Vec<ReplicatedDocument>> {
        let ids = self
            .collection
            .database()
            .store()
            .conflicted_document_ids(self.collection.name())?;
        tracing::info!(
            collection = %self.collection.name(),
            count = ids.len(),
            "resolving all conflicts"
        );
        Ok(ids
            .into_iter()
            .map(|id| {
                ConflictResolver::new(self.collection.clone(), id, None)
                    .with_resolver(self.resolver.clone())
                    .with_max_attempts(self.max_attempts)
                    .run_now()
            })
            .collect())
    }
}

impl fmt::Debug for AllConflictsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllConflictsResolver")
            .field("collection", &self.collection.name())
            .field("custom", &self.resolver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{
        Database, DatabaseConfig, ManualScheduler, MemoryStore, Properties, TaskScheduler,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolver<F>(f: F) -> Arc<ConflictResolverFn>
    where
        F: Fn(&str, Option<Arc<Document>>, Option<Arc<Document>>) -> Option<Arc<Document>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(f)
    }

    fn body(side: &str) -> Properties {
        let mut props = Properties::new();
        props.insert("side".to_string(), json!(side));
        props
    }

    /// Saves a local revision of `id` and inserts a conflicting remote one.
    fn conflicted(db: &Database, id: &str) -> Collection {
        let coll = db.default_collection();
        let mut doc = Document::with_properties(id, body("local"));
        coll.save_document(&mut doc).unwrap();
        db.store()
            .insert_conflicting_revision(coll.name(), id, "2-remote", body("remote"), false)
            .unwrap();
        coll
    }

    fn side(coll: &Collection, id: &str) -> Option<String> {
        coll.get_document(id)
            .unwrap()
            .and_then(|d| d.get("side").and_then(|v| v.as_str()).map(str::to_string))
    }

    #[test]
    fn default_policy_keeps_local() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = conflicted(&db, "a");
        let result = ConflictResolver::new(coll.clone(), "a", Some("2-remote".into())).run_now();
        assert!(result.error.is_none());
        assert_eq!(side(&coll, "a").as_deref(), Some("local"));
        assert!(db.store().conflicting_revisions(coll.name(), "a").unwrap().is_empty());
        assert!(db.store().conflicted_document_ids(coll.name()).unwrap().is_empty());
    }

    #[test]
    fn returning_remote_takes_remote() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = conflicted(&db, "a");
        let remote_wins = resolver(|_, _, remote| remote);
        let result = ConflictResolver::new(coll.clone(), "a", None)
            .with_resolver(Some(remote_wins))
            .run_now();
        assert!(result.error.is_none());
        assert_eq!(side(&coll, "a").as_deref(), Some("remote"));
    }

    #[test]
    fn merged_and_deleted_outcomes() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = conflicted(&db, "m");
        let merge = resolver(|id, _, _| {
            Some(Arc::new(Document::with_properties(id, body("merged"))))
        });
        let result = ConflictResolver::new(coll.clone(), "m", None)
            .with_resolver(Some(merge))
            .run_now();
        assert!(result.error.is_none());
        assert_eq!(side(&coll, "m").as_deref(), Some("merged"));

        let coll = conflicted(&db, "d");
        let delete = resolver(|_, _, _| None);
        let result = ConflictResolver::new(coll.clone(), "d", None)
            .with_resolver(Some(delete))
            .run_now();
        assert!(result.error.is_none());
        assert!(result.flags.contains(DocumentFlags::DELETED));
        assert!(coll.get_document("d").unwrap().is_none());
    }

    #[test]
    fn resolver_sees_deleted_side_as_none() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = db.default_collection();
        let mut doc = Document::with_properties("a", body("local"));
        coll.save_document(&mut doc).unwrap();
        db.store()
            .insert_conflicting_revision(coll.name(), "a", "2-gone", Properties::new(), true)
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let recorder = resolver(move |_, local, remote| {
            *s.lock() = Some((local.is_some(), remote.is_some()));
            local
        });
        ConflictResolver::new(coll, "a", None)
            .with_resolver(Some(recorder))
            .run_now();
        assert_eq!(*seen.lock(), Some((true, false)));
    }

    #[test]
    fn wrong_document_is_rejected() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = conflicted(&db, "a");
        let wrong_id = resolver(|_, _, _| Some(Arc::new(Document::new("not-a"))));
        let result = ConflictResolver::new(coll.clone(), "a", None)
            .with_resolver(Some(wrong_id))
            .run_now();
        assert_eq!(result.error.unwrap().code, ErrorInfo::INVALID_PARAMETER);
        assert_eq!(db.store().conflicting_revisions(coll.name(), "a").unwrap().len(), 1);

        let other = Database::open_in_memory("other").unwrap();
        let foreign = conflicted(&other, "a").get_document("a").unwrap().unwrap();
        let foreign = Arc::new(foreign);
        let wrong_db = resolver(move |_, _, _| Some(Arc::clone(&foreign)));
        let result = ConflictResolver::new(coll, "a", None)
            .with_resolver(Some(wrong_db))
            .run_now();
        assert_eq!(result.error.unwrap().code, ErrorInfo::INVALID_PARAMETER);
    }

    #[test]
    fn panicking_resolver_reports_unexpected_error() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = conflicted(&db, "a");
        let panics = resolver(|_, _, _| panic!("boom"));
        let result = ConflictResolver::new(coll, "a", None)
            .with_resolver(Some(panics))
            .run_now();
        assert_eq!(result.error.unwrap().code, ErrorInfo::UNEXPECTED_ERROR);
    }

    #[test]
    fn racing_saves_give_up_after_max_attempts() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = conflicted(&db, "a");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let writer = coll.clone();
        let racing = resolver(move |id, local, _| {
            c.fetch_add(1, Ordering::SeqCst);
            let mut current = writer.get_document(id).unwrap().unwrap();
            current.set("touched", true);
            writer.save_document(&mut current).unwrap();
            local.map(|l| Arc::new(Document::with_properties(id, l.properties().clone())))
        });

        let result = ConflictResolver::new(coll.clone(), "a", None)
            .with_resolver(Some(racing))
            .run_now();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert!(result.error.unwrap().is_conflict());
        assert_eq!(db.store().conflicting_revisions(coll.name(), "a").unwrap().len(), 1);
    }

    #[test]
    fn missing_document_is_trivially_resolved() {
        let db = Database::open_in_memory("c").unwrap();
        let coll = conflicted(&db, "a");
        coll.purge_document("a").unwrap();
        let result = ConflictResolver::new(coll.clone(), "a", None).run_now();
        assert!(result.error.is_none());

        let coll = conflicted(&db, "b");
        let result = ConflictResolver::new(coll, "b", Some("9-unknown".into())).run_now();
        assert!(result.error.is_none());
    }

    #[test]
    fn run_async_completes_on_scheduler() {
        let scheduler = Arc::new(ManualScheduler::new());
        let db = Database::open_with(
            "c",
            Arc::new(MemoryStore::new()),
            Arc::clone(&scheduler) as Arc<dyn TaskScheduler>,
            DatabaseConfig::default(),
        )
        .unwrap();
        let coll = conflicted(&db, "a");
        let done = Arc::new(Mutex::new(None));
        let d = Arc::clone(&done);
        ConflictResolver::new(coll, "a", None).run_async(Box::new(move |result| {
            *d.lock() = Some(result);
        }));
        assert!(done.lock().is_none());
        assert_eq!(scheduler.run_pending(), 1);
        let result = done.lock().take().unwrap();
        assert_eq!(result.id, "a");
        assert!(result.error.is_none());
    }

    #[test]
    fn sweep_resolves_every_conflict() {
        let db = Database::open_in_memory("c").unwrap();
        for id in ["x", "y", "z"] {
            conflicted(&db, id);
        }
        let coll = db.default_collection();
        coll.save_document(&mut Document::new("clean")).unwrap();

        let results = AllConflictsResolver::new(coll.clone(), None).run().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.error.is_none()));
        assert!(db.store().conflicted_document_ids(coll.name()).unwrap().is_empty());
    }
}
