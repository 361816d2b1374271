//! Resumable replication position.
//!
//! A [`Checkpoint`] records how far one replication has come:
//!
//! - the local side as a minimum sequence (everything at or below it has been pushed)
//!   plus the set of examined sequences still waiting to be confirmed,
//! - the remote side as an opaque marker.
//!
//! The checkpoint is persisted as `{"local": <seq>, "remote": <marker>}`. Saving goes
//! through an application callback (typically writing the JSON to the remote) which
//! acknowledges with [`Checkpoint::save_completed`]; at most one save is in flight and
//! requests made meanwhile collapse into a single follow-up save.
//!
//! ## Key Invariants
//!
//! - The local minimum sequence never decreases, except through an explicit reset
//! - Only examined sequences are completed; gaps between examined ranges stay open
//! - A completed sequence is never added back to the pending set
//! - A failed save keeps the checkpoint unsaved; the retry saves the latest state

use crate::config::ReplicatorConfiguration;
use crate::error::{ReplicatorError, ReplicatorResult};
use docsync_core::{
    CoreError, Database, RawDocument, SequenceNumber, CHECKPOINT_STORE, PEER_CHECKPOINT_STORE,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Receives the checkpoint JSON to save. Call [`Checkpoint::save_completed`] when done.
pub type CheckpointSaveCallback = dyn Fn(Value) + Send + Sync;

/// Derives the checkpoint ID of a replication.
///
/// The ID depends on the database, the remote address, the direction and the
/// document ID and channel filters, so changing any of them starts from scratch.
pub fn checkpoint_id(config: &ReplicatorConfiguration) -> ReplicatorResult<String> {
    let db = config.effective_database()?;
    let endpoint = config
        .endpoint
        .as_ref()
        .ok_or_else(|| ReplicatorError::invalid_config("missing endpoint"))?;

    let mut hasher = Sha256::new();
    hasher.update(db.uuid().as_bytes());
    hasher.update(endpoint.address().as_bytes());
    hasher.update(config.replicator_type.as_str().as_bytes());
    for collection in config.effective_collections() {
        hasher.update([0u8]);
        hasher.update(collection.collection.name().as_bytes());
        for id in &collection.document_ids {
            hasher.update([1u8]);
            hasher.update(id.as_bytes());
        }
        for channel in &collection.channels {
            hasher.update([2u8]);
            hasher.update(channel.as_bytes());
        }
    }
    Ok(format!("cp-{}", hex_encode(&hasher.finalize())))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Default, Deserialize)]
struct SavedCheckpoint {
    #[serde(default)]
    local: u64,
    #[serde(default)]
    remote: Option<String>,
}

/// Disjoint, non-adjacent inclusive ranges of completed sequences, keyed by start.
///
/// Always holds a range starting at 0; its end is the local minimum sequence.
struct CompletedRanges(BTreeMap<u64, u64>);

impl Default for CompletedRanges {
    fn default() -> Self {
        Self::up_to(0)
    }
}

impl CompletedRanges {
    fn up_to(end: u64) -> Self {
        Self(BTreeMap::from([(0, end)]))
    }

    fn contains(&self, seq: u64) -> bool {
        self.0
            .range(..=seq)
            .next_back()
            .is_some_and(|(_, &end)| end >= seq)
    }

    fn add(&mut self, mut start: u64, mut end: u64) {
        if let Some((&s, &e)) = self.0.range(..=start).next_back() {
            if e >= end {
                return;
            }
            if e.saturating_add(1) >= start {
                start = s;
            }
        }
        let absorbed: Vec<(u64, u64)> = self
            .0
            .range(start..=end.saturating_add(1))
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in absorbed {
            self.0.remove(&s);
            end = end.max(e);
        }
        self.0.insert(start, end);
    }

    fn first_end(&self) -> u64 {
        self.0.get(&0).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct CheckpointState {
    local_min: u64,
    completed: CompletedRanges,
    pending: BTreeSet<u64>,
    remote: Option<String>,

    changed: bool,
    saving: bool,
    overdue: bool,
    timer_scheduled: bool,
    json_being_saved: Option<Value>,
    save_interval: Option<Duration>,
    save_callback: Option<Arc<CheckpointSaveCallback>>,
}

impl CheckpointState {
    fn to_json(&self) -> Value {
        match &self.remote {
            Some(remote) => json!({ "local": self.local_min, "remote": remote }),
            None => json!({ "local": self.local_min }),
        }
    }

    fn is_completed(&self, seq: u64) -> bool {
        self.completed.contains(seq)
    }

    /// Advances the local minimum to the end of the completed prefix.
    fn update_local_min(&mut self) -> bool {
        let candidate = self.completed.first_end();
        if candidate > self.local_min {
            self.local_min = candidate;
            true
        } else {
            false
        }
    }

    fn reset_local(&mut self) {
        self.restore_local(0);
    }

    fn restore_local(&mut self, local_min: u64) {
        self.local_min = local_min;
        self.completed = CompletedRanges::up_to(local_min);
        self.pending.clear();
    }

    /// Marks the state changed. Returns true if the caller must arm the autosave timer.
    fn mark_changed(&mut self) -> bool {
        self.changed = true;
        self.arm_timer()
    }

    fn arm_timer(&mut self) -> bool {
        if self.save_callback.is_some()
            && self.save_interval.is_some()
            && !self.timer_scheduled
            && !self.saving
        {
            self.timer_scheduled = true;
            true
        } else {
            false
        }
    }
}

/// Replication checkpoint of one database / endpoint pair.
pub struct Checkpoint {
    db: Database,
    id: String,
    this: Weak<Checkpoint>,
    state: Mutex<CheckpointState>,
}

impl Checkpoint {
    /// Creates an empty checkpoint for a replication configuration.
    pub fn new(config: &ReplicatorConfiguration) -> ReplicatorResult<Arc<Self>> {
        config.validate()?;
        let db = config.effective_database()?;
        let id = checkpoint_id(config)?;
        Ok(Self::with_id(db, id))
    }

    /// Creates an empty checkpoint with an explicit ID.
    pub fn with_id(db: Database, id: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|this| Self {
            db,
            id,
            this: this.clone(),
            state: Mutex::new(CheckpointState::default()),
        })
    }

    /// The checkpoint ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Loads the locally saved state.
    ///
    /// With `reset` the saved state is ignored and the checkpoint starts empty. Returns
    /// true if saved state was found and loaded.
    pub fn read(&self, reset: bool) -> ReplicatorResult<bool> {
        let saved = if reset {
            None
        } else {
            self.db.store().get_raw(CHECKPOINT_STORE, &self.id)?
        };
        let parsed = match &saved {
            Some(raw) => {
                serde_json::from_value::<SavedCheckpoint>(raw.body.clone()).map_err(CoreError::from)?
            }
            None => SavedCheckpoint::default(),
        };

        let mut state = self.state.lock();
        state.restore_local(parsed.local);
        state.remote = parsed.remote;
        state.changed = false;
        tracing::debug!(
            checkpoint = %self.id,
            local = state.local_min,
            remote = ?state.remote,
            reset,
            "read checkpoint"
        );
        Ok(saved.is_some())
    }

    /// Every sequence at or below this has been pushed.
    pub fn local_min_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.state.lock().local_min)
    }

    /// The remote marker pulled through.
    pub fn remote_min_sequence(&self) -> Option<String> {
        self.state.lock().remote.clone()
    }

    /// Replaces the remote marker.
    pub fn set_remote_min_sequence(&self, marker: impl Into<String>) {
        let marker = marker.into();
        let arm = {
            let mut state = self.state.lock();
            if state.remote.as_deref() == Some(marker.as_str()) {
                return;
            }
            state.remote = Some(marker);
            state.mark_changed()
        };
        if arm {
            self.arm_timer();
        }
    }

    /// Records one examined sequence that still has to be pushed.
    ///
    /// Nothing below it is considered completed.
    pub fn add_pending_sequence(&self, seq: SequenceNumber) {
        let seq = seq.as_u64();
        let mut state = self.state.lock();
        if !state.is_completed(seq) {
            state.pending.insert(seq);
        }
    }

    /// Records that `first..=last` was examined.
    ///
    /// Every sequence in the range is completed except those listed in `pending`.
    pub fn add_sequences(
        &self,
        first: SequenceNumber,
        last: SequenceNumber,
        pending: &[SequenceNumber],
    ) {
        let (first, last) = (first.as_u64(), last.as_u64());
        if first > last {
            return;
        }
        let arm = {
            let mut state = self.state.lock();
            let listed: BTreeSet<u64> = pending
                .iter()
                .map(|seq| seq.as_u64())
                .filter(|seq| (first..=last).contains(seq) && !state.is_completed(*seq))
                .collect();

            let done: Vec<u64> = state
                .pending
                .range(first..=last)
                .filter(|seq| !listed.contains(seq))
                .copied()
                .collect();
            for seq in done {
                state.pending.remove(&seq);
            }

            let mut from = first;
            for &seq in &listed {
                if seq > from {
                    state.completed.add(from, seq - 1);
                }
                from = seq + 1;
                state.pending.insert(seq);
            }
            if from <= last {
                state.completed.add(from, last);
            }
            state.update_local_min() && state.mark_changed()
        };
        if arm {
            self.arm_timer();
        }
    }

    /// Records that a sequence has been pushed.
    pub fn completed_sequence(&self, seq: SequenceNumber) {
        let seq = seq.as_u64();
        let arm = {
            let mut state = self.state.lock();
            if state.is_completed(seq) {
                return;
            }
            state.pending.remove(&seq);
            state.completed.add(seq, seq);
            state.update_local_min() && state.mark_changed()
        };
        if arm {
            self.arm_timer();
        }
    }

    /// Returns true if `seq` has been pushed.
    pub fn is_sequence_completed(&self, seq: SequenceNumber) -> bool {
        self.state.lock().is_completed(seq.as_u64())
    }

    /// Number of sequences waiting to be pushed.
    pub fn pending_sequence_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// The sequences waiting to be pushed, ascending.
    pub fn pending_sequences(&self) -> Vec<SequenceNumber> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|seq| SequenceNumber::new(*seq))
            .collect()
    }

    /// The JSON form of the checkpoint.
    pub fn to_json(&self) -> Value {
        self.state.lock().to_json()
    }

    /// Checks this checkpoint against the copy saved on the remote.
    ///
    /// Any side that does not match is reset, so replication restarts from scratch in
    /// that direction. Returns true if both sides matched.
    pub fn compare_with_remote(&self, remote: &Value) -> bool {
        let theirs: SavedCheckpoint = serde_json::from_value(remote.clone()).unwrap_or_default();
        let arm = {
            let mut state = self.state.lock();
            let local_ok = theirs.local == state.local_min;
            let remote_ok = theirs.remote == state.remote;
            if local_ok && remote_ok {
                return true;
            }
            tracing::info!(
                checkpoint = %self.id,
                local = state.local_min,
                remote_local = theirs.local,
                remote_matches = remote_ok,
                "checkpoint does not match the remote copy, resetting"
            );
            if !local_ok {
                state.reset_local();
            }
            if !remote_ok {
                state.remote = None;
            }
            state.mark_changed()
        };
        if arm {
            self.arm_timer();
        }
        false
    }

    /// Enables saving through `callback`, automatically `interval` after each change.
    pub fn enable_save(&self, interval: Duration, callback: Arc<CheckpointSaveCallback>) {
        let arm = {
            let mut state = self.state.lock();
            state.save_interval = Some(interval);
            state.save_callback = Some(callback);
            state.changed && state.arm_timer()
        };
        if arm {
            self.arm_timer();
        }
    }

    /// Disables the save callback and autosave. Later saves only write locally.
    pub fn disable_save(&self) {
        let mut state = self.state.lock();
        state.save_interval = None;
        state.save_callback = None;
    }

    /// Saves now if anything changed.
    ///
    /// Returns false if a save is already in flight; exactly one more save then
    /// follows its completion.
    pub fn save(&self) -> bool {
        let (callback, json) = {
            let mut state = self.state.lock();
            if !state.changed {
                return true;
            }
            if state.saving {
                state.overdue = true;
                return false;
            }
            let json = state.to_json();
            state.changed = false;
            match state.save_callback.clone() {
                Some(callback) => {
                    state.saving = true;
                    state.json_being_saved = Some(json.clone());
                    (callback, json)
                }
                None => {
                    drop(state);
                    if self.write_local(json) {
                        return true;
                    }
                    self.state.lock().changed = true;
                    return false;
                }
            }
        };
        tracing::trace!(checkpoint = %self.id, "saving checkpoint");
        callback(json);
        true
    }

    /// Acknowledges the save started by the last callback invocation.
    pub fn save_completed(&self, ok: bool) {
        let (saved, follow_up, arm) = {
            let mut state = self.state.lock();
            if !state.saving {
                return;
            }
            state.saving = false;
            let saved = state.json_being_saved.take();
            if !ok {
                state.changed = true;
            }
            let follow_up = std::mem::take(&mut state.overdue);
            let arm = !follow_up && state.changed && state.arm_timer();
            (saved, follow_up, arm)
        };

        if ok {
            if let Some(json) = saved {
                self.write_local(json);
            }
        } else {
            tracing::warn!(checkpoint = %self.id, "checkpoint save failed, will retry");
        }
        if follow_up {
            self.save();
        } else if arm {
            self.arm_timer();
        }
    }

    /// Returns true if there are changes not yet saved.
    pub fn is_unsaved(&self) -> bool {
        let state = self.state.lock();
        state.changed || state.saving
    }

    /// Reads a checkpoint a remote peer stored in this database.
    pub fn get_peer_checkpoint(db: &Database, id: &str) -> ReplicatorResult<Option<RawDocument>> {
        Ok(db.store().get_raw(PEER_CHECKPOINT_STORE, id)?)
    }

    /// Stores a peer checkpoint if its revision is still `expected_rev` (`None` for a new
    /// one). Returns the new revision.
    pub fn set_peer_checkpoint(
        db: &Database,
        id: &str,
        expected_rev: Option<&str>,
        body: Value,
    ) -> ReplicatorResult<String> {
        Ok(db
            .store()
            .put_raw_if(PEER_CHECKPOINT_STORE, id, expected_rev, body)?)
    }

    fn write_local(&self, json: Value) -> bool {
        match self.db.store().put_raw(CHECKPOINT_STORE, &self.id, json) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(checkpoint = %self.id, error = %err, "couldn't save checkpoint locally");
                false
            }
        }
    }

    fn arm_timer(&self) {
        let Some(interval) = self.state.lock().save_interval else {
            return;
        };
        let weak = self.this.clone();
        self.db.scheduler().run_after(
            interval,
            Box::new(move || {
                if let Some(checkpoint) = weak.upgrade() {
                    checkpoint.timer_fired();
                }
            }),
        );
    }

    fn timer_fired(&self) {
        {
            let mut state = self.state.lock();
            state.timer_scheduled = false;
            if state.save_callback.is_none() {
                return;
            }
        }
        self.save();
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Checkpoint")
            .field("id", &self.id)
            .field("local", &state.local_min)
            .field("pending", &state.pending.len())
            .field("remote", &state.remote)
            .finish()
    }
}
