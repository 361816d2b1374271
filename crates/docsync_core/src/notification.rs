//! Per-database notification queue.
//!
//! By default notifications run immediately on whichever thread produced them. Once
//! an application installs a "ready" callback via [`NotificationQueue::set_callback`],
//! notifications are buffered instead, and the ready callback fires once each time the
//! queue goes from empty to non-empty. The application then drains the queue with
//! [`NotificationQueue::notify_all`] on a thread of its choosing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// A deferred notification.
pub type Notification = Box<dyn FnOnce() + Send + 'static>;

/// Callback telling the application that notifications are waiting.
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct QueueState {
    ready: Option<ReadyCallback>,
    pending: VecDeque<Notification>,
}

/// FIFO queue of notifications with optional buffering.
#[derive(Default)]
pub struct NotificationQueue {
    state: Mutex<QueueState>,
}

impl NotificationQueue {
    /// Creates a queue that delivers notifications immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or removes the ready callback.
    ///
    /// Removing it switches back to immediate delivery; anything still queued is
    /// delivered right away.
    pub fn set_callback(&self, ready: Option<ReadyCallback>) {
        let buffering = ready.is_some();
        self.state.lock().ready = ready;
        if !buffering {
            self.notify_all();
        }
    }

    /// Returns true if notifications are being buffered.
    pub fn is_buffering(&self) -> bool {
        self.state.lock().ready.is_some()
    }

    /// Delivers or enqueues a notification.
    pub fn add(&self, notification: Notification) {
        let ready = {
            let mut state = self.state.lock();
            let Some(ready) = state.ready.clone() else {
                drop(state);
                notification();
                return;
            };
            let was_empty = state.pending.is_empty();
            state.pending.push_back(notification);
            if !was_empty {
                return;
            }
            ready
        };
        ready();
    }

    /// Runs every queued notification in FIFO order.
    ///
    /// The queue is swapped out under the lock, so a notification may call
    /// [`add`](Self::add) without deadlocking; such additions land in the next batch.
    pub fn notify_all(&self) {
        let batch = std::mem::take(&mut self.state.lock().pending);
        for notification in batch {
            notification();
        }
    }

    /// Number of queued notifications.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }
}

impl fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NotificationQueue")
            .field("buffering", &state.ready.is_some())
            .field("pending", &state.pending.len())
            .finish()
    }
}
