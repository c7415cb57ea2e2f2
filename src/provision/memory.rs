//! In-process provisioner.
//!
//! Keeps resources in memory and shares them between clones, so several
//! deployers in one process see the same "workspace". Failures can be
//! injected per resource key.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{ProvisionError, Result};
use crate::state::ResourceKey;

use super::{DeleteOutcome, ResourceProvisioner};

/// A resource held by the memory provisioner.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryResource {
    /// Remote identifier.
    pub id: String,
    /// Logical key it was created for.
    pub key: ResourceKey,
    /// Last applied configuration.
    pub config: Value,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Permanent,
    Transient(u32),
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, MemoryResource>,
    failures: HashMap<ResourceKey, Failure>,
    next_id: u64,
    calls: usize,
}

/// In-memory provisioner.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvisioner {
    inner: Arc<Mutex<Inner>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MemoryProvisioner {
    /// Creates an empty provisioner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every call for `key` fail permanently.
    pub async fn fail_permanently(&self, key: &ResourceKey) {
        self.inner
            .lock()
            .await
            .failures
            .insert(key.clone(), Failure::Permanent);
    }

    /// Makes the next `times` calls for `key` fail transiently.
    pub async fn fail_transiently(&self, key: &ResourceKey, times: u32) {
        self.inner
            .lock()
            .await
            .failures
            .insert(key.clone(), Failure::Transient(times));
    }

    /// All live resources, ordered by id.
    pub async fn resources(&self) -> Vec<MemoryResource> {
        self.inner.lock().await.resources.values().cloned().collect()
    }

    /// Number of live resources created for `key`.
    pub async fn count(&self, key: &ResourceKey) -> usize {
        self.inner
            .lock()
            .await
            .resources
            .values()
            .filter(|r| &r.key == key)
            .count()
    }

    /// Gets a live resource by id.
    pub async fn get(&self, id: &str) -> Option<MemoryResource> {
        self.inner.lock().await.resources.get(id).cloned()
    }

    /// Removes a resource behind the engine's back.
    pub async fn remove_out_of_band(&self, id: &str) -> bool {
        self.inner.lock().await.resources.remove(id).is_some()
    }

    /// Number of create/update/delete calls that reached the provisioner.
    pub async fn calls(&self) -> usize {
        self.inner.lock().await.calls
    }

    /// Highest number of calls that were in progress at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Simulates call latency and records concurrency.
    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn check_failure(inner: &mut Inner, key: &ResourceKey) -> Result<()> {
        inner.calls += 1;
        match inner.failures.get_mut(key) {
            Some(Failure::Permanent) => {
                Err(ProvisionError::permanent(format!("{key} rejected by memory provisioner")).into())
            }
            Some(Failure::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProvisionError::transient(format!("{key} temporarily unavailable")).into())
            }
            _ => Ok(()),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceProvisioner for MemoryProvisioner {
    async fn create(&self, key: &ResourceKey, config: &Value) -> Result<String> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock().await;
        Self::check_failure(&mut inner, key)?;

        inner.next_id += 1;
        let id = format!("{}-{}", key.resource_type, inner.next_id);
        inner.resources.insert(
            id.clone(),
            MemoryResource {
                id: id.clone(),
                key: key.clone(),
                config: config.clone(),
            },
        );
        Ok(id)
    }

    async fn update(&self, key: &ResourceKey, remote_id: &str, config: &Value) -> Result<()> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock().await;
        Self::check_failure(&mut inner, key)?;

        let resource = inner.resources.get_mut(remote_id).ok_or_else(|| {
            ProvisionError::permanent(format!("{key}: remote resource {remote_id} does not exist"))
        })?;
        resource.config = config.clone();
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey, remote_id: &str) -> Result<DeleteOutcome> {
        let _guard = self.enter().await;
        let mut inner = self.inner.lock().await;
        Self::check_failure(&mut inner, key)?;

        Ok(if inner.resources.remove(remote_id).is_some() {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::AlreadyAbsent
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lifecycle() {
        let provisioner = MemoryProvisioner::new();
        let key = ResourceKey::new("job", "nightly");

        let id = provisioner.create(&key, &json!({"a": 1})).await.expect("create");
        provisioner
            .update(&key, &id, &json!({"a": 2}))
            .await
            .expect("update");
        assert_eq!(provisioner.get(&id).await.expect("exists").config, json!({"a": 2}));
        assert_eq!(provisioner.count(&key).await, 1);

        assert_eq!(
            provisioner.delete(&key, &id).await.expect("delete"),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            provisioner.delete(&key, &id).await.expect("delete again"),
            DeleteOutcome::AlreadyAbsent
        );
        assert_eq!(provisioner.calls().await, 4);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let provisioner = MemoryProvisioner::new();
        let flaky = ResourceKey::new("job", "flaky");
        let broken = ResourceKey::new("job", "broken");
        provisioner.fail_transiently(&flaky, 1).await;
        provisioner.fail_permanently(&broken).await;

        assert!(provisioner
            .create(&flaky, &json!({}))
            .await
            .expect_err("first call fails")
            .is_retryable());
        provisioner.create(&flaky, &json!({})).await.expect("second call succeeds");

        let err = provisioner.create(&broken, &json!({})).await.expect_err("rejected");
        assert!(!err.is_retryable());
        assert_eq!(provisioner.count(&broken).await, 0);
    }
}
