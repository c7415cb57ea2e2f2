//! State management module for the bundle deployment engine.
//!
//! This module provides the deployment state model, the local advisory cache,
//! the shared remote store backends, staleness detection and deployment
//! locking.

mod fs;
mod local;
mod lock;
mod memory;
mod remote;
mod s3;
mod staleness;
mod store;
mod types;

pub use fs::FsRemoteStore;
pub use local::{CachedState, LocalStateCache, CACHE_DIR};
pub use lock::{generate_holder_id, Lock, LockInfo, LockManager};
pub use memory::MemoryRemoteStore;
pub use remote::{RemoteObject, RemoteStore, VersionMarker};
pub use s3::S3RemoteStore;
pub use staleness::{StaleReason, Staleness, StalenessDetector};
pub use store::{PersistBase, RemoteState, StateRepository};
pub use types::{
    BundleTarget, DeploymentHistoryEntry, DeploymentOperation, DeploymentState, ResourceKey,
    ResourceRecord, STATE_VERSION,
};
