//! Remote object store interface.
//!
//! The remote store is the durable, shared home of deployment state and lock
//! objects. Every write is conditional on the version marker the writer last
//! observed, which is what linearizes concurrent deployers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Opaque version identifier of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMarker(String);

/// An object fetched from the remote store.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    /// Object body.
    pub bytes: Vec<u8>,
    /// Version of the body.
    pub version: VersionMarker,
}

/// Trait for remote state storage backends.
///
/// `put` and `delete` must fail with [`crate::error::StateError::Conflict`]
/// when the object's current version differs from `expected`. For `put`, an
/// `expected` of `None` means "the object must not exist"; for `delete` it
/// removes the object unconditionally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches an object and its version. Returns `None` if it does not exist.
    async fn get(&self, path: &str) -> Result<Option<RemoteObject>>;

    /// Writes an object if its current version matches `expected`.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<VersionMarker>,
    ) -> Result<VersionMarker>;

    /// Fetches only the current version of an object.
    async fn head_version(&self, path: &str) -> Result<Option<VersionMarker>>;

    /// Deletes an object if its current version matches `expected`.
    ///
    /// Deleting an object that does not exist succeeds.
    async fn delete(&self, path: &str, expected: Option<VersionMarker>) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

impl VersionMarker {
    /// Wraps a backend-specific version string.
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    /// Returns the marker as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
