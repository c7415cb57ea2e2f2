//! State types for tracking deployment state.
//!
//! These types form the authoritative record of what has been deployed for a
//! bundle target. The remote copy is shared between deployers; local copies
//! are advisory caches of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries kept in the state.
const MAX_HISTORY: usize = 100;

/// Logical identity of a resource: its type tag plus its declared name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    /// Resource type tag (e.g. `job`, `pipeline`).
    pub resource_type: String,
    /// Declared resource name.
    pub name: String,
}

/// The complete deployment state of one bundle target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Deployment history identifier, assigned once.
    pub lineage: String,
    /// Monotonic write counter.
    pub serial: u64,
    /// Bundle name.
    pub bundle: String,
    /// Target name.
    pub target: String,
    /// Tracked resources keyed by logical key.
    pub resources: BTreeMap<ResourceKey, ResourceRecord>,
    /// When the state was last modified.
    pub timestamp: DateTime<Utc>,
    /// Recent operations.
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// Record of one deployed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Identifier assigned by the provisioning capability.
    pub remote_id: String,
    /// Fingerprint of the declared configuration that produced it.
    pub fingerprint: String,
    /// Resource type tag.
    pub resource_type: String,
    /// Declared name.
    pub name: String,
    /// Resources this one referenced when it was last applied.
    #[serde(default)]
    pub depends_on: Vec<ResourceKey>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// The (bundle, target, workspace root) triple a state is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleTarget {
    /// Bundle name.
    pub bundle: String,
    /// Target (environment) name.
    pub name: String,
    /// Workspace root under which remote state and lock objects live.
    pub root_path: String,
}

/// A single entry in the deployment history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Holder identity of the deployer that ran it.
    pub holder: String,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of deployment operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Deploy of desired resources.
    Deploy,
    /// Destruction of all tracked resources.
    Destroy,
}

impl ResourceKey {
    /// Creates a new resource key.
    #[must_use]
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((resource_type, name))
                if !resource_type.is_empty() && !name.is_empty() && !name.contains('.') =>
            {
                Ok(Self::new(resource_type, name))
            }
            _ => Err(format!("Invalid resource key: {s}. Expected format: TYPE.NAME")),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

impl DeploymentState {
    /// Creates a new empty deployment state with a fresh lineage.
    #[must_use]
    pub fn new(bundle: &str, target: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            bundle: bundle.to_string(),
            target: target.to_string(),
            resources: BTreeMap::new(),
            timestamp: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Creates an empty state for a target.
    #[must_use]
    pub fn for_target(target: &BundleTarget) -> Self {
        Self::new(&target.bundle, &target.name)
    }

    /// Gets a resource record by key.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceRecord> {
        self.resources.get(key)
    }

    /// Adds or replaces a resource record.
    pub fn set_resource(&mut self, record: ResourceRecord) {
        self.resources.insert(record.key(), record);
        self.timestamp = Utc::now();
    }

    /// Removes a resource record.
    pub fn remove_resource(&mut self, key: &ResourceKey) -> Option<ResourceRecord> {
        let result = self.resources.remove(key);
        if result.is_some() {
            self.timestamp = Utc::now();
        }
        result
    }

    /// Returns true if no resources are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Serializes the state to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            crate::error::StateError::serialization(format!("Failed to serialize state: {e}"))
                .into()
        })
    }

    /// Deserializes and checks a state from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid state of a supported version.
    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        let state: Self = serde_json::from_slice(bytes).map_err(|e| {
            crate::error::StateError::corrupted(format!("Failed to parse state: {e}"))
        })?;

        if state.version != STATE_VERSION {
            return Err(crate::error::StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }

        Ok(state)
    }
}

impl ResourceRecord {
    /// Creates a new resource record.
    #[must_use]
    pub fn new(key: &ResourceKey, remote_id: &str, fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            remote_id: remote_id.to_string(),
            fingerprint: fingerprint.to_string(),
            resource_type: key.resource_type.clone(),
            name: key.name.clone(),
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the logical key of this record.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.name)
    }

    /// Records a successful update.
    pub fn touch(&mut self, fingerprint: &str) {
        fingerprint.clone_into(&mut self.fingerprint);
        self.updated_at = Utc::now();
    }
}

impl BundleTarget {
    /// Creates a new bundle target.
    #[must_use]
    pub fn new(bundle: &str, name: &str, root_path: &str) -> Self {
        Self {
            bundle: bundle.to_string(),
            name: name.to_string(),
            root_path: root_path.trim_end_matches('/').to_string(),
        }
    }

    /// Path of the remote state object.
    #[must_use]
    pub fn state_path(&self) -> String {
        format!("{}/state/deployment.json", self.root_path)
    }

    /// Path of the remote lock object.
    #[must_use]
    pub fn lock_path(&self) -> String {
        format!("{}/state/deploy.lock", self.root_path)
    }
}

impl fmt::Display for BundleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bundle, self.name)
    }
}

impl DeploymentHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: DeploymentOperation, holder: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            holder: holder.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: DeploymentOperation,
        holder: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, holder, resources)
        }
    }
}

impl fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Deploy => "deploy",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
