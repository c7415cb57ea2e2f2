//! Diff engine for comparing desired resources against tracked state.
//!
//! Each desired resource is fingerprinted through its provisioner and
//! compared with the record of the same logical key. The fingerprint covers
//! the configuration with references resolved to the recorded remote ids, plus
//! the keys the resource depends on, so a recreated dependency or a changed
//! dependency edge both surface as an update.

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::config::{find_references, substitute_references, ConfigHasher, ResourceConfig};
use crate::error::Result;
use crate::provision::{ProvisionerRegistry, ResourceProvisioner};
use crate::state::{DeploymentState, ResourceKey};

/// Engine for computing diffs between desired resources and state.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine<'a> {
    /// Provisioners used for fingerprinting.
    registry: &'a ProvisionerRegistry,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource key.
    pub key: ResourceKey,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Recorded fingerprint (if tracked).
    pub old_fingerprint: Option<String>,
    /// Desired fingerprint, if every referenced resource already has a remote id.
    pub new_fingerprint: Option<String>,
    /// Remote identifier (if tracked).
    pub remote_id: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Desired resources in declaration order, then removed resources in key order.
    pub diffs: Vec<ResourceDiff>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(registry: &'a ProvisionerRegistry) -> Self {
        Self { registry }
    }

    /// Computes the diff between desired resources and the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if a desired resource has no registered provisioner.
    pub fn compute_diff(
        &self,
        desired: &[ResourceConfig],
        state: &DeploymentState,
    ) -> Result<DiffResult> {
        let mut result = DiffResult::default();
        let mut declared = HashSet::new();

        for resource in desired {
            let key = resource.key();
            let fingerprint = self.desired_fingerprint(resource, state)?;
            let record = state.get(&key);

            let diff_type = match (record, &fingerprint) {
                (None, _) => DiffType::Create,
                // A referenced resource is about to get a new remote id
                (Some(_), None) => DiffType::Update,
                (Some(r), Some(fp)) if r.fingerprint != *fp => DiffType::Update,
                (Some(_), Some(_)) => DiffType::NoChange,
            };
            debug!("{key}: {diff_type}");

            result.diffs.push(ResourceDiff {
                diff_type,
                old_fingerprint: record.map(|r| r.fingerprint.clone()),
                new_fingerprint: fingerprint,
                remote_id: record.map(|r| r.remote_id.clone()),
                key: key.clone(),
            });
            declared.insert(key);
        }

        for (key, record) in &state.resources {
            if !declared.contains(key) {
                debug!("{key}: no longer declared");
                result.diffs.push(ResourceDiff {
                    key: key.clone(),
                    diff_type: DiffType::Delete,
                    old_fingerprint: Some(record.fingerprint.clone()),
                    new_fingerprint: None,
                    remote_id: Some(record.remote_id.clone()),
                });
            }
        }

        Ok(result)
    }

    /// Fingerprint a resource would be recorded with if applied against `state`.
    ///
    /// Returns `None` while a resource referenced from the configuration has no
    /// recorded remote id.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource type has no registered provisioner.
    pub fn desired_fingerprint(
        &self,
        resource: &ResourceConfig,
        state: &DeploymentState,
    ) -> Result<Option<String>> {
        let provisioner = self.registry.get(&resource.resource_type)?;
        let key = resource.key();
        let remote_id = |dep: &ResourceKey| state.get(dep).map(|r| r.remote_id.clone());

        if find_references(&resource.config)
            .iter()
            .any(|dep| remote_id(dep).is_none())
        {
            return Ok(None);
        }

        let resolved = substitute_references(&key, &resource.config, &remote_id)?;
        Ok(Some(resolved_fingerprint(
            &**provisioner,
            &key,
            &resolved,
            &resource.references(),
        )))
    }
}

/// Fingerprint of a configuration whose references are already resolved.
pub(super) fn resolved_fingerprint(
    provisioner: &dyn ResourceProvisioner,
    key: &ResourceKey,
    resolved: &Value,
    depends_on: &[ResourceKey],
) -> String {
    ConfigHasher::with_dependencies(&provisioner.fingerprint(key, resolved), depends_on)
}

impl DiffResult {
    /// Gets the diff of one resource.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| &d.key == key)
    }
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::MemoryProvisioner;
    use crate::state::ResourceRecord;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ProvisionerRegistry {
        let memory: Arc<dyn ResourceProvisioner> = Arc::new(MemoryProvisioner::new());
        ProvisionerRegistry::new().register_all(["job", "pipeline"], &memory)
    }

    fn resource(resource_type: &str, name: &str, config: Value) -> ResourceConfig {
        ResourceConfig {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            depends_on: vec![],
            config,
        }
    }

    /// Records every resource as applied against the state built so far.
    fn applied(engine: &DiffEngine<'_>, resources: &[ResourceConfig]) -> DeploymentState {
        let mut state = DeploymentState::new("b", "dev");
        for (i, r) in resources.iter().enumerate() {
            let fp = engine
                .desired_fingerprint(r, &state)
                .expect("registered")
                .expect("references resolved");
            state.set_resource(ResourceRecord::new(&r.key(), &format!("id-{i}"), &fp));
        }
        state
    }

    fn diff_type(result: &DiffResult, key: &ResourceKey) -> DiffType {
        result.get(key).expect("diffed").diff_type
    }

    #[test]
    fn test_classification() {
        let registry = registry();
        let engine = DiffEngine::new(&registry);

        let same = resource("job", "same", json!({"v": 1}));
        let changed = resource("job", "changed", json!({"v": 2}));
        let new = resource("pipeline", "new", json!({}));

        let mut state = applied(&engine, &[same.clone()]);
        state.set_resource(ResourceRecord::new(&changed.key(), "2", "stale-fingerprint"));
        state.set_resource(ResourceRecord::new(&ResourceKey::new("job", "gone"), "3", "x"));

        let result = engine
            .compute_diff(&[same.clone(), changed.clone(), new.clone()], &state)
            .expect("diff");

        assert_eq!(result.diffs.len(), 4);
        assert_eq!(diff_type(&result, &same.key()), DiffType::NoChange);
        assert_eq!(diff_type(&result, &new.key()), DiffType::Create);
        let update = result.get(&changed.key()).expect("changed");
        assert_eq!(update.diff_type, DiffType::Update);
        assert_eq!(update.remote_id.as_deref(), Some("2"));
        assert_eq!(diff_type(&result, &ResourceKey::new("job", "gone")), DiffType::Delete);
    }

    #[test]
    fn test_new_dependency_edge_is_an_update() {
        let registry = registry();
        let engine = DiffEngine::new(&registry);

        let job = resource("job", "z", json!({}));
        let pipeline = resource("pipeline", "a", json!({"v": 1}));
        let state = applied(&engine, &[job.clone(), pipeline.clone()]);

        let unchanged = engine
            .compute_diff(&[job.clone(), pipeline.clone()], &state)
            .expect("diff");
        assert_eq!(diff_type(&unchanged, &pipeline.key()), DiffType::NoChange);

        let mut linked = pipeline.clone();
        linked.depends_on = vec![job.key()];
        let result = engine.compute_diff(&[job.clone(), linked], &state).expect("diff");
        assert_eq!(diff_type(&result, &pipeline.key()), DiffType::Update);
        assert_eq!(diff_type(&result, &job.key()), DiffType::NoChange);
    }

    #[test]
    fn test_recreated_reference_updates_dependent() {
        let registry = registry();
        let engine = DiffEngine::new(&registry);

        let job = resource("job", "source", json!({}));
        let pipeline = resource("pipeline", "sink", json!({"job_id": "${resources.job.source.id}"}));
        let mut state = applied(&engine, &[job.clone(), pipeline.clone()]);

        // The referenced job is gone from state and will be created again
        state.remove_resource(&job.key());
        let result = engine
            .compute_diff(&[job.clone(), pipeline.clone()], &state)
            .expect("diff");
        assert_eq!(diff_type(&result, &job.key()), DiffType::Create);
        let sink = result.get(&pipeline.key()).expect("sink");
        assert_eq!(sink.diff_type, DiffType::Update);
        assert_eq!(sink.new_fingerprint, None);

        // The referenced job was recreated under a new id by another run
        let mut state = applied(&engine, &[job.clone(), pipeline.clone()]);
        state.set_resource(ResourceRecord::new(&job.key(), "id-recreated", "f"));
        let result = engine.compute_diff(&[pipeline.clone()], &state).expect("diff");
        assert_eq!(diff_type(&result, &pipeline.key()), DiffType::Update);
    }

    #[test]
    fn test_unregistered_type_fails() {
        let registry = registry();
        let engine = DiffEngine::new(&registry);
        let state = DeploymentState::new("b", "dev");

        assert!(engine
            .compute_diff(&[resource("dashboard", "d", json!({}))], &state)
            .is_err());
    }
}
