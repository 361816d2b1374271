//! Background task scheduling.
//!
//! Asynchronous conflict resolution and debounced checkpoint saves never run on the
//! caller's thread; they are handed to the database's [`TaskScheduler`]. Three
//! implementations are provided:
//!
//! - [`ThreadScheduler`]: one short-lived OS thread per task (the default)
//! - [`TokioScheduler`]: tasks run on a tokio runtime's blocking pool
//! - [`ManualScheduler`]: tasks queue up until a test runs them explicitly

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::thread;
use std::time::Duration;

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks off the calling thread.
pub trait TaskScheduler: Send + Sync {
    /// Runs `task` as soon as possible.
    fn run_async(&self, task: Task);

    /// Runs `task` once `delay` has elapsed.
    fn run_after(&self, delay: Duration, task: Task);
}

/// Spawns a named OS thread per task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    /// Creates a thread scheduler.
    pub fn new() -> Self {
        Self
    }

    fn spawn(name: &str, task: Task) {
        // The task moves into the closure, so a spawn failure can't hand it back.
        if let Err(err) = thread::Builder::new().name(name.to_string()).spawn(task) {
            tracing::error!(error = %err, "failed to spawn background task thread");
        }
    }
}

impl TaskScheduler for ThreadScheduler {
    fn run_async(&self, task: Task) {
        Self::spawn("docsync-task", task);
    }

    fn run_after(&self, delay: Duration, task: Task) {
        Self::spawn(
            "docsync-timer",
            Box::new(move || {
                thread::sleep(delay);
                task();
            }),
        );
    }
}

/// Runs tasks on a tokio runtime.
///
/// Tasks are treated as blocking work, since conflict resolvers call back into
/// application code that may block.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Creates a scheduler on the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a scheduler on the runtime the caller is running in.
    pub fn current() -> CoreResult<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|err| CoreError::invalid_parameter(format!("no tokio runtime: {err}")))
    }
}

impl TaskScheduler for TokioScheduler {
    fn run_async(&self, task: Task) {
        drop(self.handle.spawn_blocking(task));
    }

    fn run_after(&self, delay: Duration, task: Task) {
        drop(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = tokio::task::spawn_blocking(task).await {
                tracing::error!(error = %err, "delayed task failed");
            }
        }));
    }
}

/// Deterministic scheduler for tests.
///
/// Nothing runs until [`run_pending`](Self::run_pending) or
/// [`fire_timers`](Self::fire_timers) is called on the test thread.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Task>>,
    timers: Mutex<Vec<(Duration, Task)>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued tasks, including tasks they queue, until none remain.
    ///
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Runs every timer scheduled so far, regardless of its delay.
    ///
    /// Timers scheduled by the fired tasks wait for the next call. Returns the number
    /// of timers fired.
    pub fn fire_timers(&self) -> usize {
        let timers = std::mem::take(&mut *self.timers.lock());
        let count = timers.len();
        for (_, task) in timers {
            task();
        }
        count
    }

    /// Number of queued tasks.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Delays of the scheduled timers, in scheduling order.
    pub fn timer_delays(&self) -> Vec<Duration> {
        self.timers.lock().iter().map(|(delay, _)| *delay).collect()
    }
}

impl TaskScheduler for ManualScheduler {
    fn run_async(&self, task: Task) {
        self.queue.lock().push_back(task);
    }

    fn run_after(&self, delay: Duration, task: Task) {
        self.timers.lock().push((delay, task));
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.queue.lock().len())
            .field("timers", &self.timers.lock().len())
            .finish()
    }
}
