//! Cursor over a collection's change history.
//!
//! A [`ChangesFeed`] walks the sequence-ordered changes of one collection in pages,
//! remembering the highest sequence examined so it can resume. Filters (document IDs,
//! a predicate, skipping tombstones while catching up) are fixed before the first
//! page. A feed created from a [`Checkpoint`] starts at its local minimum, skips what
//! the checkpoint already has, and reports every page back to it so the returned
//! revisions stay pending until the caller completes them.

use crate::checkpoint::Checkpoint;
use crate::error::{ReplicatorError, ReplicatorResult};
use docsync_core::{ChangeEntry, Collection, ListenerToken, Listeners, SequenceNumber};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Predicate deciding whether a change is returned.
pub type ChangesFeedFilter = dyn Fn(&ChangeEntry) -> bool + Send + Sync;

/// Called when new changes arrive after the feed caught up.
pub type ChangesFeedListener = dyn Fn() + Send + Sync;

/// One page of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedRevisions {
    /// First sequence examined for this page.
    pub first_sequence: SequenceNumber,
    /// Last sequence examined for this page, returned or filtered out.
    pub last_sequence: SequenceNumber,
    /// Revisions that passed the filters, ascending by sequence.
    pub revisions: Vec<ChangeEntry>,
}

#[derive(Default)]
struct FeedState {
    last_checked: SequenceNumber,
    caught_up: bool,
    notified: bool,
}

/// A restartable, forward-only cursor over a collection's changes.
pub struct ChangesFeed {
    collection: Collection,
    checkpoint: Option<Arc<Checkpoint>>,
    doc_ids: Option<HashSet<String>>,
    filter: Option<Arc<ChangesFeedFilter>>,
    skip_deleted: bool,
    started: bool,
    state: Arc<Mutex<FeedState>>,
    listeners: Arc<Listeners<ChangesFeedListener>>,
    observer: Option<ListenerToken>,
}

impl ChangesFeed {
    /// Creates a feed returning changes after `since`.
    pub fn since(collection: Collection, since: SequenceNumber) -> Self {
        Self {
            collection,
            checkpoint: None,
            doc_ids: None,
            filter: None,
            skip_deleted: false,
            started: false,
            state: Arc::new(Mutex::new(FeedState {
                last_checked: since,
                ..FeedState::default()
            })),
            listeners: Arc::new(Listeners::new()),
            observer: None,
        }
    }

    /// Creates a feed starting at a checkpoint's local minimum sequence.
    pub fn from_checkpoint(collection: Collection, checkpoint: Arc<Checkpoint>) -> Self {
        let mut feed = Self::since(collection, checkpoint.local_min_sequence());
        feed.checkpoint = Some(checkpoint);
        feed
    }

    /// Only returns changes to the listed documents.
    pub fn filter_to_doc_ids<I, S>(&mut self, doc_ids: I) -> ReplicatorResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_not_started()?;
        self.doc_ids = Some(doc_ids.into_iter().map(Into::into).collect());
        Ok(())
    }

    /// Only returns changes the predicate accepts.
    pub fn set_filter(&mut self, filter: Arc<ChangesFeedFilter>) -> ReplicatorResult<()> {
        self.check_not_started()?;
        self.filter = Some(filter);
        Ok(())
    }

    /// Skips tombstones until the feed first catches up.
    pub fn set_skip_deleted(&mut self, skip: bool) -> ReplicatorResult<()> {
        self.check_not_started()?;
        self.skip_deleted = skip;
        Ok(())
    }

    /// Registers a listener fired, through the database notification queue, the first
    /// time the collection changes after the feed caught up. It re-arms on every page.
    pub fn add_listener(
        &mut self,
        listener: Arc<ChangesFeedListener>,
    ) -> ReplicatorResult<ListenerToken> {
        self.check_not_started()?;
        if self.observer.is_none() {
            self.observer = Some(self.observe_collection());
        }
        Ok(self.listeners.add(listener))
    }

    /// Highest sequence examined so far.
    pub fn last_sequence_checked(&self) -> SequenceNumber {
        self.state.lock().last_checked
    }

    /// True if the last page came back short.
    pub fn caught_up(&self) -> bool {
        self.state.lock().caught_up
    }

    /// Returns the next page of at most `limit` revisions, or `None` once nothing new
    /// passes the filters.
    pub fn next(&mut self, limit: usize) -> ReplicatorResult<Option<ChangeFeedRevisions>> {
        self.started = true;
        let (since, was_caught_up) = {
            let mut state = self.state.lock();
            state.notified = false;
            (state.last_checked, state.caught_up)
        };
        if limit == 0 {
            return Ok(None);
        }

        let store = self.collection.database().store();
        let mut last = since;
        let mut revisions = Vec::new();
        loop {
            let wanted = limit - revisions.len();
            let entries = store.changes_since(self.collection.name(), last, wanted)?;
            let exhausted = entries.len() < wanted;
            for entry in entries {
                last = entry.sequence;
                if self.accepts(&entry, was_caught_up) {
                    revisions.push(entry);
                }
            }
            if exhausted || revisions.len() >= limit {
                break;
            }
        }

        let first = since.next();
        {
            let mut state = self.state.lock();
            state.last_checked = state.last_checked.max(last);
            state.caught_up = revisions.len() < limit;
        }
        if let Some(checkpoint) = &self.checkpoint {
            let pending: Vec<SequenceNumber> = revisions.iter().map(|r| r.sequence).collect();
            checkpoint.add_sequences(first, last, &pending);
        }
        tracing::trace!(
            collection = %self.collection.name(),
            first = %first,
            last = %last,
            returned = revisions.len(),
            "changes feed page"
        );

        if revisions.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChangeFeedRevisions {
            first_sequence: first,
            last_sequence: last,
            revisions,
        }))
    }

    fn accepts(&self, entry: &ChangeEntry, caught_up: bool) -> bool {
        if self.skip_deleted && !caught_up && entry.flags.is_deleted() {
            return false;
        }
        if let Some(ids) = &self.doc_ids {
            if !ids.contains(&entry.doc_id) {
                return false;
            }
        }
        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.is_sequence_completed(entry.sequence) {
                return false;
            }
        }
        self.filter.as_ref().map_or(true, |filter| filter(entry))
    }

    fn check_not_started(&self) -> ReplicatorResult<()> {
        if self.started {
            Err(ReplicatorError::invalid_state(
                "changes feed options must be set before the first call to next",
            ))
        } else {
            Ok(())
        }
    }

    fn observe_collection(&self) -> ListenerToken {
        let name = self.collection.name().to_string();
        let db = self.collection.database().clone();
        let state = Arc::clone(&self.state);
        let listeners = Arc::clone(&self.listeners);
        self.collection
            .database()
            .store()
            .observe(Arc::new(move |entries: &[ChangeEntry]| {
                {
                    let mut state = state.lock();
                    let fresh = entries
                        .iter()
                        .any(|e| e.collection == name && e.sequence > state.last_checked);
                    if !fresh || !state.caught_up || state.notified {
                        return;
                    }
                    state.notified = true;
                }
                let listeners = Arc::clone(&listeners);
                db.notify(Box::new(move || listeners.call(|listener| listener())));
            }))
    }
}

impl Drop for ChangesFeed {
    fn drop(&mut self) {
        if let Some(token) = self.observer.take() {
            token.remove();
        }
    }
}

impl fmt::Debug for ChangesFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChangesFeed")
            .field("collection", &self.collection.name())
            .field("last_checked", &state.last_checked)
            .field("caught_up", &state.caught_up)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{Database, Document};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn populate(db: &Database, ids: &[&str]) {
        let coll = db.default_collection();
        for id in ids {
            coll.save_document(&mut Document::new(*id)).unwrap();
        }
    }

    #[test]
    fn pages_until_caught_up() {
        let db = Database::open_in_memory("feed").unwrap();
        populate(&db, &["a", "b", "c", "d", "e"]);
        let mut feed = ChangesFeed::since(db.default_collection(), SequenceNumber::ZERO);

        let page = feed.next(2).unwrap().unwrap();
        assert_eq!(page.revisions.len(), 2);
        assert_eq!(page.first_sequence, SequenceNumber::new(1));
        assert_eq!(page.last_sequence, SequenceNumber::new(2));
        assert!(!feed.caught_up());

        assert_eq!(feed.next(2).unwrap().unwrap().revisions.len(), 2);
        let last = feed.next(2).unwrap().unwrap();
        assert_eq!(last.revisions[0].doc_id, "e");
        assert!(feed.caught_up());

        for _ in 0..3 {
            assert!(feed.next(2).unwrap().is_none());
            assert!(feed.caught_up());
            assert_eq!(feed.last_sequence_checked(), SequenceNumber::new(5));
        }

        populate(&db, &["f"]);
        assert_eq!(feed.next(10).unwrap().unwrap().revisions[0].doc_id, "f");
    }

    #[test]
    fn filtered_changes_still_advance() {
        let db = Database::open_in_memory("feed").unwrap();
        populate(&db, &["a", "skip-1", "skip-2", "b"]);
        let mut feed = ChangesFeed::since(db.default_collection(), SequenceNumber::ZERO);
        feed.set_filter(Arc::new(|entry: &ChangeEntry| !entry.doc_id.starts_with("skip")))
            .unwrap();

        let page = feed.next(10).unwrap().unwrap();
        let ids: Vec<_> = page.revisions.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(feed.last_sequence_checked(), SequenceNumber::new(4));

        let mut by_id = ChangesFeed::since(db.default_collection(), SequenceNumber::ZERO);
        by_id.filter_to_doc_ids(["skip-2"]).unwrap();
        assert_eq!(by_id.next(1).unwrap().unwrap().revisions[0].doc_id, "skip-2");
        assert_eq!(by_id.last_sequence_checked(), SequenceNumber::new(3));
    }

    #[test]
    fn filters_rejected_after_first_page() {
        let db = Database::open_in_memory("feed").unwrap();
        let mut feed = ChangesFeed::since(db.default_collection(), SequenceNumber::ZERO);
        assert!(feed.next(5).unwrap().is_none());
        assert!(feed.filter_to_doc_ids(["a"]).is_err());
        assert!(feed.set_skip_deleted(true).is_err());
        assert!(feed.add_listener(Arc::new(|| {})).is_err());
    }

    #[test]
    fn skip_deleted_only_while_catching_up() {
        let db = Database::open_in_memory("feed").unwrap();
        let coll = db.default_collection();
        let mut gone = Document::new("gone");
        coll.save_document(&mut gone).unwrap();
        coll.delete_document(&gone).unwrap();
        populate(&db, &["kept"]);

        let mut feed = ChangesFeed::since(coll.clone(), SequenceNumber::ZERO);
        feed.set_skip_deleted(true).unwrap();
        let page = feed.next(10).unwrap().unwrap();
        assert_eq!(page.revisions.len(), 1);
        assert_eq!(page.revisions[0].doc_id, "kept");

        let kept = coll.get_document("kept").unwrap().unwrap();
        coll.delete_document(&kept).unwrap();
        let page = feed.next(10).unwrap().unwrap();
        assert!(page.revisions[0].flags.is_deleted());
    }

    #[test]
    fn checkpoint_tracks_returned_revisions() {
        let db = Database::open_in_memory("feed").unwrap();
        populate(&db, &["a", "b", "c"]);
        let checkpoint = Checkpoint::with_id(db.clone(), "cp-feed");
        checkpoint.add_sequences(SequenceNumber::new(1), SequenceNumber::new(1), &[]);

        let mut feed = ChangesFeed::from_checkpoint(db.default_collection(), Arc::clone(&checkpoint));
        let page = feed.next(10).unwrap().unwrap();
        let seqs: Vec<_> = page.revisions.iter().map(|r| r.sequence.as_u64()).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(checkpoint.pending_sequence_count(), 2);
        assert_eq!(checkpoint.local_min_sequence(), SequenceNumber::new(1));

        checkpoint.completed_sequence(SequenceNumber::new(2));
        checkpoint.completed_sequence(SequenceNumber::new(3));
        assert_eq!(checkpoint.local_min_sequence(), SequenceNumber::new(3));
    }

    #[test]
    fn listener_fires_once_after_catching_up() {
        let db = Database::open_in_memory("feed").unwrap();
        populate(&db, &["a"]);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let mut feed = ChangesFeed::since(db.default_collection(), SequenceNumber::ZERO);
        feed.add_listener(Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        populate(&db, &["b"]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        feed.next(10).unwrap();
        assert!(feed.caught_up());
        populate(&db, &["c", "d"]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        feed.next(10).unwrap();
        populate(&db, &["e"]);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let other = db.create_collection("other").unwrap();
        other.save_document(&mut Document::new("x")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
