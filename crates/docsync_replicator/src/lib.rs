//! # docsync replicator
//!
//! Replication session orchestration on top of `docsync_core`.
//!
//! This crate provides:
//! - `Replicator`, which drives an engine replicator and relays status and document
//!   events to application listeners
//! - Checkpoints tracking which local sequences have been pushed
//! - A changes feed enumerating local changes in sequence order
//! - Conflict resolution with application-supplied resolvers
//! - The `ReplicationEngine` interface and a scriptable mock engine
//!
//! ## Key Invariants
//!
//! - A replicator stays alive while running, even if the application drops it
//! - Engine callbacks reach a replicator only through a context handle
//! - Status reports `Busy` while conflicts are being resolved, unless offline
//! - A checkpoint's completed sequence never exceeds a pending sequence

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes_feed;
mod checkpoint;
mod config;
mod conflict;
mod context;
mod engine;
mod error;
mod replicator;
mod status;

pub use changes_feed::{ChangeFeedRevisions, ChangesFeed, ChangesFeedFilter, ChangesFeedListener};
pub use checkpoint::{checkpoint_id, Checkpoint, CheckpointSaveCallback};
pub use config::{
    default_conflict_resolver, default_user_agent, options, Authenticator,
    CollectionConfiguration, ConflictResolverFn, Endpoint, ProxySettings, ProxyType,
    ReplicationFilter, ReplicatorConfiguration, ReplicatorType, UrlEndpoint,
    DEFAULT_HEARTBEAT, DEFAULT_MAX_ATTEMPTS_CONTINUOUS, DEFAULT_MAX_ATTEMPTS_SINGLE_SHOT,
    DEFAULT_MAX_ATTEMPT_WAIT_TIME, DEFAULT_MAX_RESOLUTION_ATTEMPTS, DEFAULT_SESSION_COOKIE_NAME,
    USER_AGENT_HEADER,
};
pub use conflict::{AllConflictsResolver, ConflictResolver, ResolverCompletion};
pub use context::{ContextHandle, ContextManager};
pub use engine::{
    CollectionParameters, DocumentEnded, DocumentsEndedCallback, EngineActivityLevel,
    EngineFilter, EngineProgress, EngineReplicator, EngineStatus, MockEngine, MockReplicator,
    ProgressLevel, ReplicationEngine, ReplicationMode, ReplicatorParameters, StatusCallback,
};
pub use error::{ReplicatorError, ReplicatorResult};
pub use replicator::{DocumentReplicationListener, Replicator, ReplicatorChangeListener};
pub use status::{ActivityLevel, ReplicatedDocument, ReplicatorProgress, ReplicatorStatus};
