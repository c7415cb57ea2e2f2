//! Explicit registry of provisioners by resource type.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ProvisionError, Result};

use super::ResourceProvisioner;

/// Resource types served by the workspace provisioning API.
pub const DEFAULT_RESOURCE_TYPES: &[&str] = &[
    "app",
    "cluster",
    "dashboard",
    "experiment",
    "job",
    "model",
    "model_serving_endpoint",
    "pipeline",
    "quality_monitor",
    "registered_model",
    "schema",
    "volume",
];

/// Maps resource type tags to provisioners.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    provisioners: BTreeMap<String, Arc<dyn ResourceProvisioner>>,
}

impl ProvisionerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provisioner for one type, replacing any previous one.
    #[must_use]
    pub fn register(mut self, resource_type: &str, provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        debug!("Registering {} provisioner for '{resource_type}'", provisioner.name());
        self.provisioners.insert(resource_type.to_string(), provisioner);
        self
    }

    /// Registers one provisioner for several types.
    #[must_use]
    pub fn register_all<I, S>(mut self, types: I, provisioner: &Arc<dyn ResourceProvisioner>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for resource_type in types {
            self = self.register(resource_type.as_ref(), Arc::clone(provisioner));
        }
        self
    }

    /// Looks up the provisioner for a type.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::UnknownType`] if no provisioner is registered.
    pub fn get(&self, resource_type: &str) -> Result<&Arc<dyn ResourceProvisioner>> {
        self.provisioners.get(resource_type).ok_or_else(|| {
            ProvisionError::UnknownType {
                resource_type: resource_type.to_string(),
            }
            .into()
        })
    }

    /// Registered type tags, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        self.provisioners.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BundleError;
    use crate::provision::MemoryProvisioner;

    #[test]
    fn test_lookup() {
        let memory: Arc<dyn ResourceProvisioner> = Arc::new(MemoryProvisioner::new());
        let registry = ProvisionerRegistry::new().register_all(["job", "pipeline"], &memory);

        assert_eq!(registry.types(), vec!["job", "pipeline"]);
        assert_eq!(registry.get("job").expect("registered").name(), "memory");

        let err = registry.get("dashboard").err().expect("unregistered");
        assert!(matches!(
            err,
            BundleError::Provision(ProvisionError::UnknownType { .. })
        ));
    }
}
