//! Configuration types for the bundle deployment engine.
//!
//! This module defines all the structs that map to the `bundle.yaml` file.
//! These types are declarative and fully describe the desired resources of a
//! bundle and the targets it can be deployed into.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ConfigError, Result};
use crate::state::{BundleTarget, ResourceKey};

use super::interpolate::find_references;

/// Root path used when neither the target nor the workspace sets one.
pub const DEFAULT_ROOT_PATH: &str = "/Workspace/.bundle/${bundle.name}/${bundle.target}";

/// The root configuration structure of a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleConfig {
    /// Bundle-level configuration.
    pub bundle: BundleInfo,
    /// Default workspace settings, overridable per target.
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Remote state backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply/destroy execution settings.
    #[serde(default)]
    pub deploy: DeploySettings,
    /// Deployment lock settings.
    #[serde(default)]
    pub lock: LockSettings,
    /// Deployment targets by name.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    /// Desired resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Bundle-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleInfo {
    /// Unique name for the bundle.
    pub name: String,
}

/// Workspace connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Base URL of the workspace provisioning API.
    #[serde(default)]
    pub host: Option<String>,
    /// Root path under which remote state and lock objects live.
    #[serde(default)]
    pub root_path: Option<String>,
}

/// A deployment target (environment).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    /// Whether this target is used when none is requested.
    #[serde(default)]
    pub default: bool,
    /// Workspace overrides for this target.
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

/// Remote state backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (fs or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Shared directory for the fs backend, relative to the bundle directory.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Shared-directory state storage.
    #[default]
    Fs,
    /// AWS S3-based state storage.
    S3,
}

/// Apply/destroy execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploySettings {
    /// Maximum number of independent actions in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries per action on transient provisioning errors.
    #[serde(default = "default_action_retries")]
    pub action_retries: u32,
    /// Base delay between action retries in milliseconds.
    #[serde(default = "default_action_retry_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Deployment lock settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockSettings {
    /// Lock lease length in seconds.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between lease extensions while applying.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Acquisition attempts before giving up.
    #[serde(default = "default_lock_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay between acquisition attempts in milliseconds.
    #[serde(default = "default_lock_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on the delay between acquisition attempts in milliseconds.
    #[serde(default = "default_lock_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type tag (e.g. `job`, `pipeline`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Unique name within its type.
    pub name: String,
    /// Explicit dependencies in `type.name` form.
    #[serde(default)]
    pub depends_on: Vec<ResourceKey>,
    /// Resource configuration passed to the provisioner.
    #[serde(default)]
    pub config: Value,
}

// Default value functions
const fn default_concurrency() -> usize {
    4
}

const fn default_action_retries() -> u32 {
    3
}

const fn default_action_retry_delay_ms() -> u64 {
    500
}

const fn default_lock_ttl_secs() -> u64 {
    300
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_lock_retry_attempts() -> u32 {
    5
}

const fn default_lock_retry_base_delay_ms() -> u64 {
    1000
}

const fn default_lock_retry_max_delay_ms() -> u64 {
    16_000
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            action_retries: default_action_retries(),
            retry_base_delay_ms: default_action_retry_delay_ms(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            retry_attempts: default_lock_retry_attempts(),
            retry_base_delay_ms: default_lock_retry_base_delay_ms(),
            retry_max_delay_ms: default_lock_retry_max_delay_ms(),
        }
    }
}

impl ResourceConfig {
    /// Logical key of this resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.name)
    }

    /// Resources this one depends on: explicit `depends_on` entries followed by
    /// `${resources.<type>.<name>.id}` references, without duplicates.
    #[must_use]
    pub fn references(&self) -> Vec<ResourceKey> {
        let mut refs: Vec<ResourceKey> = Vec::new();
        for key in self
            .depends_on
            .iter()
            .cloned()
            .chain(find_references(&self.config))
        {
            if !refs.contains(&key) {
                refs.push(key);
            }
        }
        refs
    }
}

impl BundleConfig {
    /// Resolves the target to deploy into.
    ///
    /// With no explicit name, the target marked `default` is used, or the only
    /// declared target if there is exactly one.
    ///
    /// # Errors
    ///
    /// Returns an error if the named target is not declared or no target can be chosen.
    pub fn select_target(&self, name: Option<&str>) -> Result<(&str, &TargetConfig)> {
        if let Some(name) = name {
            return self
                .targets
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| {
                    ConfigError::UnknownTarget {
                        name: name.to_string(),
                        declared: self.target_names().join(", "),
                    }
                    .into()
                });
        }

        if let Some((k, v)) = self.targets.iter().find(|(_, t)| t.default) {
            return Ok((k.as_str(), v));
        }

        if self.targets.len() == 1 {
            if let Some((k, v)) = self.targets.iter().next() {
                return Ok((k.as_str(), v));
            }
        }

        Err(ConfigError::NoTargetSelected.into())
    }

    /// Names of all declared targets.
    #[must_use]
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    /// Workspace host for a target (target override, then bundle default).
    #[must_use]
    pub fn host_for<'a>(&'a self, target: &'a TargetConfig) -> Option<&'a str> {
        target
            .workspace
            .host
            .as_deref()
            .or(self.workspace.host.as_deref())
    }

    /// Builds the state scope of a target.
    #[must_use]
    pub fn bundle_target(&self, name: &str, target: &TargetConfig) -> BundleTarget {
        let root = target
            .workspace
            .root_path
            .as_deref()
            .or(self.workspace.root_path.as_deref())
            .unwrap_or(DEFAULT_ROOT_PATH)
            .replace("${bundle.name}", &self.bundle.name)
            .replace("${bundle.target}", name);

        BundleTarget::new(&self.bundle.name, name, &root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with_targets(yaml_targets: &str) -> BundleConfig {
        let yaml = format!("bundle:\n  name: demo\ntargets:\n{yaml_targets}");
        serde_yaml::from_str(&yaml).expect("valid yaml")
    }

    #[test]
    fn test_defaults() {
        let config = config_with_targets("  dev: {}\n");
        assert_eq!(config.state.backend, StateBackend::Fs);
        assert_eq!(config.deploy.concurrency, 4);
        assert_eq!(config.lock.ttl_secs, 300);
        assert_eq!(config.lock.retry_attempts, 5);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_select_target() {
        let config = config_with_targets("  dev:\n    default: true\n  prod: {}\n");
        assert_eq!(config.select_target(None).expect("default").0, "dev");
        assert_eq!(config.select_target(Some("prod")).expect("named").0, "prod");

        let err = config.select_target(Some("qa")).expect_err("unknown");
        assert!(err.to_string().contains("dev, prod"));

        let ambiguous = config_with_targets("  a: {}\n  b: {}\n");
        assert!(ambiguous.select_target(None).is_err());

        let single = config_with_targets("  only: {}\n");
        assert_eq!(single.select_target(None).expect("single").0, "only");
    }

    #[test]
    fn test_host_for_prefers_target_override() {
        let mut config = config_with_targets(
            "  dev: {}\n  prod:\n    workspace:\n      host: https://prod.example.com\n",
        );
        assert_eq!(config.host_for(&config.targets["dev"]), None);

        config.workspace.host = Some(String::from("https://shared.example.com"));
        let (_, dev) = config.select_target(Some("dev")).expect("dev");
        assert_eq!(config.host_for(dev), Some("https://shared.example.com"));
        let (_, prod) = config.select_target(Some("prod")).expect("prod");
        assert_eq!(config.host_for(prod), Some("https://prod.example.com"));
    }

    #[test]
    fn test_bundle_target_root_path() {
        let config = config_with_targets("  dev: {}\n  prod:\n    workspace:\n      root_path: /shared/prod/\n");

        let (name, dev) = config.select_target(Some("dev")).expect("dev");
        let target = config.bundle_target(name, dev);
        assert_eq!(target.root_path, "/Workspace/.bundle/demo/dev");
        assert_eq!(target.state_path(), "/Workspace/.bundle/demo/dev/state/deployment.json");

        let (name, prod) = config.select_target(Some("prod")).expect("prod");
        assert_eq!(config.bundle_target(name, prod).lock_path(), "/shared/prod/state/deploy.lock");
    }

    #[test]
    fn test_resource_references() {
        let resource = ResourceConfig {
            resource_type: String::from("job"),
            name: String::from("nightly"),
            depends_on: vec![ResourceKey::new("pipeline", "etl")],
            config: json!({
                "tasks": [
                    {"pipeline_id": "${resources.pipeline.etl.id}"},
                    {"cluster": "${resources.cluster.shared.id}"}
                ]
            }),
        };

        assert_eq!(
            resource.references(),
            vec![
                ResourceKey::new("pipeline", "etl"),
                ResourceKey::new("cluster", "shared"),
            ]
        );
    }
}
