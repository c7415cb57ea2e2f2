//! Provisioning capability.
//!
//! The engine never talks to a resource API directly. It goes through a
//! [`ResourceProvisioner`] looked up by resource type in an explicitly built
//! [`ProvisionerRegistry`].

mod memory;
mod registry;
mod rest;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ConfigHasher;
use crate::error::Result;
use crate::state::ResourceKey;

pub use memory::{MemoryProvisioner, MemoryResource};
pub use registry::{ProvisionerRegistry, DEFAULT_RESOURCE_TYPES};
pub use rest::RestProvisioner;

/// Result of a delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The resource existed and was deleted.
    Deleted,
    /// The resource was already gone.
    AlreadyAbsent,
}

/// Creates, updates and deletes remote resources of one or more types.
///
/// Errors are reported as [`crate::error::ProvisionError`]: `Transient` for
/// failures worth retrying, `Permanent` for rejections.
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Creates a resource and returns its remote identifier.
    async fn create(&self, key: &ResourceKey, config: &Value) -> Result<String>;

    /// Updates an existing resource in place.
    async fn update(&self, key: &ResourceKey, remote_id: &str, config: &Value) -> Result<()>;

    /// Deletes a resource.
    async fn delete(&self, key: &ResourceKey, remote_id: &str) -> Result<DeleteOutcome>;

    /// Fingerprint of a declared configuration.
    fn fingerprint(&self, key: &ResourceKey, config: &Value) -> String {
        ConfigHasher::fingerprint(&key.resource_type, config)
    }

    /// Short provisioner name for logs.
    fn name(&self) -> &'static str;
}
