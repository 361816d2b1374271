//! Replicator status as applications see it.

use crate::engine::{EngineActivityLevel, EngineStatus};
use docsync_core::{DocumentFlags, ErrorInfo};

/// Activity level of a replicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ActivityLevel {
    /// Not running.
    #[default]
    Stopped,
    /// Waiting for the network.
    Offline,
    /// Connecting to the remote.
    Connecting,
    /// Connected, caught up.
    Idle,
    /// Transferring, or resolving conflicts.
    Busy,
}

impl From<EngineActivityLevel> for ActivityLevel {
    fn from(level: EngineActivityLevel) -> Self {
        match level {
            EngineActivityLevel::Stopped => ActivityLevel::Stopped,
            EngineActivityLevel::Offline => ActivityLevel::Offline,
            EngineActivityLevel::Connecting => ActivityLevel::Connecting,
            EngineActivityLevel::Idle => ActivityLevel::Idle,
            EngineActivityLevel::Busy | EngineActivityLevel::Stopping => ActivityLevel::Busy,
        }
    }
}

/// Replication progress.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReplicatorProgress {
    /// Fraction done, 0.0 to 1.0. Only meaningful while the total is known.
    pub complete: f32,
    /// Documents transferred so far.
    pub document_count: u64,
}

/// Status reported to change listeners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicatorStatus {
    /// Activity level.
    pub activity: ActivityLevel,
    /// Progress.
    pub progress: ReplicatorProgress,
    /// Last error, if any.
    pub error: Option<ErrorInfo>,
}

impl From<&EngineStatus> for ReplicatorStatus {
    fn from(status: &EngineStatus) -> Self {
        let activity = ActivityLevel::from(status.level);
        let progress = status.progress;
        let finished = matches!(activity, ActivityLevel::Idle | ActivityLevel::Stopped);
        let complete = if progress.units_total == 0 && finished && status.error.is_none() {
            1.0
        } else {
            let ratio = progress.units_completed as f64 / progress.units_total.max(1) as f64;
            ratio.min(1.0) as f32
        };
        Self {
            activity,
            progress: ReplicatorProgress {
                complete,
                document_count: progress.document_count,
            },
            error: status.error.clone(),
        }
    }
}

impl From<EngineStatus> for ReplicatorStatus {
    fn from(status: EngineStatus) -> Self {
        Self::from(&status)
    }
}

/// A document that finished replicating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedDocument {
    /// Collection name.
    pub collection: String,
    /// Document ID.
    pub id: String,
    /// Deleted / access-removed flags.
    pub flags: DocumentFlags,
    /// Error, if the document failed to replicate or its conflict could not be resolved.
    pub error: Option<ErrorInfo>,
}
