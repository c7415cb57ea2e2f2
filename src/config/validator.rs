//! Configuration validation for bundle configurations.
//!
//! This module validates a bundle configuration before any remote call is
//! made: names, targets, settings and resource references.

use crate::error::{BundleError, ConfigError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{BundleConfig, DeploySettings, LockSettings, ResourceConfig, StateBackend, StateConfig};

/// Validator for bundle configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Resource types with a registered provisioner; empty means "don't check".
    known_types: HashSet<String>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator that accepts any resource type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a validator that warns about resource types outside `types`.
    #[must_use]
    pub fn with_known_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_types: types.into_iter().map(Into::into).collect(),
        }
    }

    /// Validates a bundle configuration, collecting every problem found.
    #[must_use]
    pub fn check(&self, config: &BundleConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_bundle(config, &mut result);
        Self::validate_targets(config, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_settings(&config.deploy, &config.lock, &mut result);
        self.validate_resources(&config.resources, &mut result);

        result
    }

    /// Validates a bundle configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if validation fails.
    pub fn validate(&self, config: &BundleConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            Err(BundleError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Configuration validation passed");
            Ok(result)
        }
    }

    fn validate_bundle(config: &BundleConfig, result: &mut ValidationResult) {
        if config.bundle.name.is_empty() {
            result.error("bundle.name", "Bundle name cannot be empty");
        } else if !is_valid_name(&config.bundle.name) {
            result.error(
                "bundle.name",
                format!(
                    "Bundle name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                    config.bundle.name
                ),
            );
        }
    }

    fn validate_targets(config: &BundleConfig, result: &mut ValidationResult) {
        if config.targets.is_empty() {
            result.error("targets", "At least one target must be declared");
            return;
        }

        for name in config.targets.keys() {
            if !is_valid_name(name) {
                result.error(
                    format!("targets.{name}"),
                    format!("Target name '{name}' is invalid"),
                );
            }
        }

        let defaults: Vec<&str> = config
            .targets
            .iter()
            .filter(|(_, t)| t.default)
            .map(|(name, _)| name.as_str())
            .collect();
        if defaults.len() > 1 {
            result.error(
                "targets",
                format!("Only one target may be the default, found: {}", defaults.join(", ")),
            );
        }

        if config.workspace.host.is_none()
            && config.targets.values().any(|t| t.workspace.host.is_none())
        {
            result
                .warnings
                .push(String::from("No workspace host configured; set BUNDLE_HOST to deploy"));
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Fs => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the fs backend"));
                }
                if state.path.is_none() {
                    result.warnings.push(String::from(
                        "No state.path set for the fs backend; remote state is kept inside the bundle directory",
                    ));
                }
            }
        }
    }

    fn validate_settings(deploy: &DeploySettings, lock: &LockSettings, result: &mut ValidationResult) {
        if deploy.concurrency == 0 {
            result.error("deploy.concurrency", "Concurrency must be at least 1");
        }

        if lock.ttl_secs == 0 {
            result.error("lock.ttl_secs", "Lock TTL must be at least 1 second");
        }

        if lock.heartbeat_interval_secs == 0 || lock.heartbeat_interval_secs >= lock.ttl_secs {
            result.error(
                "lock.heartbeat_interval_secs",
                format!(
                    "Heartbeat interval ({}s) must be positive and shorter than the lock TTL ({}s)",
                    lock.heartbeat_interval_secs, lock.ttl_secs
                ),
            );
        }

        if lock.retry_attempts == 0 {
            result.error("lock.retry_attempts", "At least one lock attempt is required");
        }

        if lock.retry_base_delay_ms > lock.retry_max_delay_ms {
            result.warnings.push(format!(
                "lock.retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({}); every wait will be capped",
                lock.retry_base_delay_ms, lock.retry_max_delay_ms
            ));
        }
    }

    fn validate_resources(&self, resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let mut keys = HashSet::new();
        for resource in resources {
            let field = format!("resources.{}.{}", resource.resource_type, resource.name);

            if !is_valid_type(&resource.resource_type) {
                result.error(
                    field.clone(),
                    format!(
                        "Resource type '{}' is invalid. Must be lowercase letters and '_'.",
                        resource.resource_type
                    ),
                );
            } else if !self.known_types.is_empty() && !self.known_types.contains(&resource.resource_type) {
                result.warnings.push(format!(
                    "No provisioner is registered for resource type '{}'",
                    resource.resource_type
                ));
            }

            if !is_valid_name(&resource.name) {
                result.error(
                    field.clone(),
                    format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        resource.name
                    ),
                );
            }

            if !keys.insert(resource.key()) {
                result.error(field, format!("Duplicate resource: {}", resource.key()));
            }
        }

        for resource in resources {
            let key = resource.key();
            for dep in resource.references() {
                if dep == key {
                    result.error(
                        format!("resources.{key}"),
                        format!("Resource {key} cannot depend on itself"),
                    );
                } else if !keys.contains(&dep) {
                    result.error(
                        format!("resources.{key}"),
                        format!("Resource {key} references undeclared resource {dep}"),
                    );
                }
            }
        }
    }
}

/// Checks if a name is valid: a letter followed by letters, digits, `-` or `_`.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Checks if a resource type tag is valid.
fn is_valid_type(resource_type: &str) -> bool {
    !resource_type.is_empty()
        && resource_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> BundleConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("valid yaml")
    }

    const VALID: &str = r"
bundle:
  name: demo
workspace:
  host: https://workspace.example.com
state:
  path: /mnt/shared/state
targets:
  dev:
    default: true
resources:
  - type: pipeline
    name: ingest
  - type: job
    name: test-job-basic-X
    depends_on: [pipeline.ingest]
";

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("test-job-basic-X"));
        assert!(is_valid_name("my_pod_123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("123-job")); // starts with number
        assert!(!is_valid_name("job.name")); // dot would break keys
        assert!(!is_valid_name("job name"));
    }

    #[test]
    fn test_valid_config() {
        let result = ConfigValidator::new()
            .validate(&parse(VALID))
            .expect("valid config");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_collects_all_errors() {
        let config = parse(
            r"
bundle:
  name: 9lives
state:
  backend: s3
deploy:
  concurrency: 0
lock:
  ttl_secs: 10
  heartbeat_interval_secs: 10
targets:
  dev: {}
resources:
  - type: job
    name: a
    depends_on: [job.missing]
  - type: job
    name: a
",
        );

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"bundle.name"));
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"deploy.concurrency"));
        assert!(fields.contains(&"lock.heartbeat_interval_secs"));
        assert!(result.errors.iter().any(|e| e.message.contains("Duplicate")));
        assert!(result.errors.iter().any(|e| e.message.contains("undeclared resource job.missing")));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_interpolated_reference_must_be_declared() {
        let config = parse(
            r#"
bundle:
  name: demo
targets:
  dev: {}
resources:
  - type: job
    name: a
    config:
      pipeline: "${resources.pipeline.nope.id}"
"#,
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("pipeline.nope"));
    }

    #[test]
    fn test_unknown_type_warns() {
        let result = ConfigValidator::with_known_types(["job"]).check(&parse(VALID));
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("'pipeline'")));
    }

    #[test]
    fn test_multiple_defaults() {
        let config = parse(
            r"
bundle:
  name: demo
targets:
  a:
    default: true
  b:
    default: true
",
        );
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "targets"));
    }
}
