//! Deployment locking for concurrent access protection.
//!
//! One lock object per target lives next to the remote state. Every mutation
//! of the lock is a conditional write against the remote store, so two
//! deployers racing for the same target see exactly one winner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockSettings;
use crate::error::{BundleError, LockError, Result, StateError};

use super::remote::{RemoteStore, VersionMarker};
use super::types::BundleTarget;

/// Information about a deployment lock, as stored in the lock object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires unless heartbeated.
    pub expires_at: DateTime<Utc>,
    /// Lease length in seconds.
    pub ttl_secs: u64,
}

/// A held deployment lock.
#[derive(Debug, Clone)]
pub struct Lock {
    /// Lock information as last written.
    info: LockInfo,
    /// Path of the lock object.
    path: String,
    /// Version of the lock object we wrote last.
    version: VersionMarker,
}

/// Outcome of a single acquisition attempt.
enum Attempt {
    Acquired(Lock),
    Held(LockInfo),
    Raced,
}

/// Acquires, heartbeats and releases deployment locks on a remote store.
#[derive(Clone)]
pub struct LockManager {
    /// Remote store holding the lock objects.
    store: Arc<dyn RemoteStore>,
    /// Lease and retry settings.
    settings: LockSettings,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + lease(ttl_secs),
            ttl_secs,
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Extends the lock expiry by one lease from now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + lease(self.ttl_secs);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            StateError::serialization(format!("Failed to serialize lock: {e}")).into()
        })
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")).into())
    }
}

fn lease(ttl_secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000))
}

impl Lock {
    /// Gets the lock ID.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.info.lock_id
    }

    /// Gets the lock holder.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.info.holder
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl LockManager {
    /// Creates a lock manager over a remote store.
    #[must_use]
    pub fn new(store: Arc<dyn RemoteStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    /// Lease and retry settings in use.
    #[must_use]
    pub const fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Acquires the lock for a target, backing off while another holder has it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Contention`] if the lock stays held through every
    /// attempt, or a backend error.
    pub async fn acquire(&self, target: &BundleTarget, holder: &str) -> Result<Lock> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut last_holder: Option<LockInfo> = None;

        for attempt in 0..attempts {
            match self.try_acquire(target, holder).await? {
                Attempt::Acquired(lock) => {
                    info!(
                        "Acquired deployment lock {} for {target} as {holder}",
                        lock.lock_id()
                    );
                    return Ok(lock);
                }
                Attempt::Held(info) => {
                    debug!(
                        "Lock for {target} held by {} (expires in {}s)",
                        info.holder,
                        info.remaining_secs()
                    );
                    last_holder = Some(info);
                }
                Attempt::Raced => {
                    debug!("Lost lock acquisition race for {target}");
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        let (holder, since) = last_holder.map_or_else(
            || (String::from("unknown"), String::from("unknown")),
            |info| (info.holder, info.acquired_at.to_rfc3339()),
        );
        Err(LockError::Contention {
            holder,
            since,
            attempts,
        }
        .into())
    }

    async fn try_acquire(&self, target: &BundleTarget, holder: &str) -> Result<Attempt> {
        let path = target.lock_path();
        let info = LockInfo::new(holder, self.settings.ttl_secs);

        let expected = match self.store.get(&path).await? {
            None => None,
            Some(object) => match LockInfo::from_bytes(&object.bytes) {
                Ok(current) if !current.is_expired() => return Ok(Attempt::Held(current)),
                Ok(current) => {
                    warn!(
                        "Reclaiming expired deployment lock {} held by {}",
                        current.lock_id, current.holder
                    );
                    Some(object.version)
                }
                Err(e) => {
                    warn!("Reclaiming unreadable deployment lock at {path}: {e}");
                    Some(object.version)
                }
            },
        };

        match self.store.put(&path, info.to_bytes()?, expected).await {
            Ok(version) => Ok(Attempt::Acquired(Lock {
                info,
                path,
                version,
            })),
            Err(BundleError::State(StateError::Conflict { .. })) => Ok(Attempt::Raced),
            Err(e) => Err(e),
        }
    }

    /// Delay before the next attempt: exponential from the base, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self
            .settings
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.settings.retry_max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Extends the lock lease.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Lost`] if another deployer reclaimed the lock.
    pub async fn heartbeat(&self, lock: &mut Lock) -> Result<()> {
        let mut info = lock.info.clone();
        info.refresh();

        match self
            .store
            .put(&lock.path, info.to_bytes()?, Some(lock.version.clone()))
            .await
        {
            Ok(version) => {
                debug!("Heartbeat extended lock {} to {}", info.lock_id, info.expires_at);
                lock.info = info;
                lock.version = version;
                Ok(())
            }
            Err(BundleError::State(StateError::Conflict { .. })) => {
                warn!("Deployment lock {} was reclaimed by another deployer", lock.info.lock_id);
                Err(LockError::Lost {
                    lock_id: lock.info.lock_id.clone(),
                }
                .into())
            }
            Err(e) => Err(e),
        }
    }

    /// Releases a held lock.
    ///
    /// A lock that was reclaimed by someone else is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn release(&self, lock: Lock) -> Result<()> {
        match self.store.delete(&lock.path, Some(lock.version)).await {
            Ok(()) => {
                info!("Released deployment lock {}", lock.info.lock_id);
                Ok(())
            }
            Err(BundleError::State(StateError::Conflict { .. })) => {
                warn!(
                    "Deployment lock {} is now held by another deployer; not releasing",
                    lock.info.lock_id
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the current lock of a target, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the lock object is unreadable.
    pub async fn get_lock_info(&self, target: &BundleTarget) -> Result<Option<LockInfo>> {
        match self.store.get(&target.lock_path()).await? {
            Some(object) => Ok(Some(LockInfo::from_bytes(&object.bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes the lock of a target regardless of its holder.
    ///
    /// Returns the removed lock info, if a readable lock existed. An
    /// unreadable lock object is removed as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn force_unlock(&self, target: &BundleTarget) -> Result<Option<LockInfo>> {
        let path = target.lock_path();
        let previous = match self.get_lock_info(target).await {
            Ok(info) => info,
            Err(BundleError::State(StateError::Corrupted { message })) => {
                warn!("Removing unreadable lock on {target}: {message}");
                None
            }
            Err(e) => return Err(e),
        };
        self.store.delete(&path, None).await?;

        if let Some(info) = &previous {
            warn!("Force-unlocked {target} (was held by {})", info.holder);
        }
        Ok(previous)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.store.backend_type())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}
