//! # docsync core
//!
//! Engine-facing primitives for the docsync replication layer.
//!
//! This crate provides:
//! - Documents, revision flags and sequence numbers
//! - The `DocumentStore` storage interface and an in-memory implementation
//! - A database handle with change listeners and a stoppable-task registry
//! - A revocable multi-subscriber listener registry
//! - A notification queue with optional application-driven delivery
//! - Background task schedulers (threads, tokio, manual)
//!
//! ## Key Invariants
//!
//! - Sequence numbers are per-database and strictly increasing
//! - Saves use optimistic concurrency on the current revision ID
//! - Listener callbacks never run while a registry lock is held
//! - A closing database refuses new running tasks

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod document;
mod error;
mod listener;
mod memory;
mod notification;
mod scheduler;
mod store;
mod types;

pub use config::DatabaseConfig;
pub use database::{ChangeCallback, Collection, Database, DatabaseChange, Stoppable};
pub use document::{Document, Properties};
pub use error::{CoreError, CoreResult, ErrorDomain, ErrorInfo};
pub use listener::{ListenerToken, Listeners};
pub use memory::MemoryStore;
pub use notification::{Notification, NotificationQueue, ReadyCallback};
pub use scheduler::{ManualScheduler, Task, TaskScheduler, ThreadScheduler, TokioScheduler};
pub use store::{
    ChangeEntry, DocumentStore, RawDocument, ResolvedRevision, StoreObserver, CHECKPOINT_STORE,
    PEER_CHECKPOINT_STORE,
};
pub use types::{
    new_revision_id, revision_generation, DocumentFlags, RevisionFlags, SequenceNumber,
    DEFAULT_COLLECTION,
};
