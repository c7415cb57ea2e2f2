//! Error types for the bundle deployment engine.
//!
//! This module provides the error hierarchy for every stage of a deploy or
//! destroy: configuration, state storage, locking, provisioning, planning and
//! execution.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit code for a run that failed for any reason other than lock contention.
pub const EXIT_FAILURE: u8 = 1;

/// Process exit code for a run that gave up waiting for the deployment lock.
pub const EXIT_LOCK_CONTENTION: u8 = 3;

/// The main error type for the bundle deployment engine.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Deployment lock errors.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Provisioning capability errors.
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Deploy/destroy execution errors.
    #[error("Deployment error: {0}")]
    Deploy(#[from] DeployError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// The requested target is not declared in the bundle.
    #[error("Unknown target '{name}' (declared: {declared})")]
    UnknownTarget {
        /// Requested target name.
        name: String,
        /// Comma separated list of declared targets.
        declared: String,
    },

    /// No target was requested and none is marked as default.
    #[error("No target selected and no default target declared")]
    NoTargetSelected,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Remote store backend error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// A conditional write lost against a newer object version.
    #[error("Conditional write to {path} rejected: object changed since it was read")]
    Conflict {
        /// Path of the object.
        path: String,
    },

    /// Persisting the deployment state lost against a concurrent writer.
    #[error("Persist conflict on {path}: serial {attempted} is not the successor of the remote state")]
    PersistConflict {
        /// Path of the remote state object.
        path: String,
        /// Serial that was being written.
        attempted: u64,
    },

    /// Local and remote state belong to different deployment histories.
    #[error(
        "Lineage mismatch: local state has lineage {local}, remote state has lineage {remote}. \
         Run `bundle state pull` to discard the local cache."
    )]
    LineageMismatch {
        /// Lineage of the local cache.
        local: String,
        /// Lineage of the remote state.
        remote: String,
    },
}

/// Deployment lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock is held by another deployer and did not free up in time.
    #[error("Deployment lock is held by {holder} (since {since}); gave up after {attempts} attempts")]
    Contention {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// The lock was reclaimed by another deployer while we held it.
    #[error("Deployment lock {lock_id} was lost to another deployer")]
    Lost {
        /// Identifier of the lost lock.
        lock_id: String,
    },
}

/// Provisioning capability errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Network or service failure that may succeed on retry.
    #[error("Transient provisioning failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The provisioning API rejected the request.
    #[error("Provisioning rejected: {message}")]
    Permanent {
        /// Description of the rejection.
        message: String,
    },

    /// No provisioner is registered for the resource type.
    #[error("No provisioner registered for resource type '{resource_type}'")]
    UnknownType {
        /// The unregistered resource type.
        resource_type: String,
    },

    /// The provisioning API returned something we could not understand.
    #[error("Invalid response from provisioning API: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph between resources contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    Cycle {
        /// Description of the cycle, e.g. `job.a -> job.b -> job.a`.
        cycle: String,
    },

    /// A resource references another resource that is not declared.
    #[error("Resource {from} references undeclared resource {to}")]
    UnknownReference {
        /// Referencing resource.
        from: String,
        /// Referenced resource.
        to: String,
    },
}

/// Deploy/destroy execution errors.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Some actions failed or were skipped.
    #[error("{failed} action(s) failed and {skipped} were skipped")]
    PartialFailure {
        /// Number of failed actions.
        failed: usize,
        /// Number of actions skipped because a dependency failed.
        skipped: usize,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resource that failed.
        resource: String,
    },

    /// The run was cancelled by the user.
    #[error("Deployment cancelled; state reflects the last completed action")]
    Cancelled,

    /// The run was aborted.
    #[error("Deployment aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for bundle deployment operations.
pub type Result<T> = std::result::Result<T, BundleError>;

impl BundleError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provision(ProvisionError::Transient { .. })
                | Self::State(StateError::Backend { .. })
        )
    }

    /// Returns true if this error is a lost optimistic-concurrency race on the state object.
    #[must_use]
    pub const fn is_persist_conflict(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::PersistConflict { .. } | StateError::Conflict { .. })
        )
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Lock(LockError::Contention { .. }) => EXIT_LOCK_CONTENTION,
            _ => EXIT_FAILURE,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProvisionError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_has_distinct_exit_code() {
        let err = BundleError::Lock(LockError::Contention {
            holder: String::from("host-1-abc"),
            since: String::from("2026-01-01T00:00:00Z"),
            attempts: 5,
        });
        assert_eq!(err.exit_code(), EXIT_LOCK_CONTENTION);

        let other = BundleError::Plan(PlanError::Cycle {
            cycle: String::from("job.a -> job.a"),
        });
        assert_eq!(other.exit_code(), EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_LOCK_CONTENTION);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BundleError::from(ProvisionError::transient("timeout")).is_retryable());
        assert!(!BundleError::from(ProvisionError::permanent("bad config")).is_retryable());
        assert!(BundleError::from(StateError::PersistConflict {
            path: String::from("p"),
            attempted: 2,
        })
        .is_persist_conflict());
    }
}
