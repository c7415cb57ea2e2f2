//! Deployment orchestrator.
//!
//! Runs deploy and destroy for one bundle target: takes the deployment lock,
//! decides whether the local cache can be trusted, plans against the
//! authoritative state, applies the plan with per-action checkpoints, and
//! persists the outcome. The lock is always released.

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::BundleConfig;
use crate::error::{BundleError, Result, StateError};
use crate::planner::{plan, ActionStatus, Checkpointer, DeploymentPlan, ExecutionResult, PlanExecutor};
use crate::provision::ProvisionerRegistry;
use crate::state::{
    generate_holder_id, BundleTarget, DeploymentHistoryEntry, DeploymentOperation,
    DeploymentState, LocalStateCache, Lock, LockInfo, LockManager, PersistBase, RemoteStore,
    StaleReason, Staleness, StalenessDetector, StateRepository,
};

/// Orchestrator for one bundle target.
pub struct Orchestrator {
    /// Bundle configuration.
    config: BundleConfig,
    /// Target being deployed.
    target: BundleTarget,
    /// Remote state access.
    repository: StateRepository,
    /// Local state cache.
    cache: LocalStateCache,
    /// Deployment lock manager.
    locks: LockManager,
    /// Provisioners by resource type.
    registry: ProvisionerRegistry,
    /// Identity recorded in locks and history.
    holder: String,
    /// Set to stop scheduling new actions.
    cancel: Arc<AtomicBool>,
}

/// Outcome of a deploy or destroy.
#[derive(Debug, Serialize)]
pub struct DeployReport {
    /// Operation that ran.
    pub operation: DeploymentOperation,
    /// Target it ran against.
    pub target: String,
    /// Plan that was executed last.
    pub plan: DeploymentPlan,
    /// Per-action results, if anything was executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
    /// Serial of the state after the run.
    pub serial: u64,
    /// Whether the final state was written to the remote store.
    pub persisted: bool,
    /// Why the run did not fully succeed.
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<BundleError>,
}

/// Checkpoints for one locked run.
struct DeploySession<'a> {
    repository: &'a StateRepository,
    locks: &'a LockManager,
    lock: &'a mut Lock,
    base: &'a mut PersistBase,
}

#[async_trait]
impl Checkpointer for DeploySession<'_> {
    async fn checkpoint(&mut self, state: &mut DeploymentState) -> Result<()> {
        self.repository.persist(state, self.base).await.map(|_| ())
    }

    async fn heartbeat(&mut self) -> Result<()> {
        self.locks.heartbeat(self.lock).await
    }
}

impl Orchestrator {
    /// Creates an orchestrator for a target of the bundle.
    ///
    /// The local cache lives under `bundle_root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be selected.
    pub fn new(
        config: BundleConfig,
        target_name: Option<&str>,
        store: Arc<dyn RemoteStore>,
        registry: ProvisionerRegistry,
        bundle_root: impl AsRef<Path>,
    ) -> Result<Self> {
        let (name, target_config) = config.select_target(target_name)?;
        let target = config.bundle_target(name, target_config);
        let cache = LocalStateCache::for_target(bundle_root, name);
        let locks = LockManager::new(Arc::clone(&store), config.lock.clone());
        let repository = StateRepository::new(store, target.clone());

        Ok(Self {
            config,
            target,
            repository,
            cache,
            locks,
            registry,
            holder: generate_holder_id(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Overrides the holder identity.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Shares a cancellation flag with the caller.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The target this orchestrator deploys.
    #[must_use]
    pub const fn target(&self) -> &BundleTarget {
        &self.target
    }

    /// The holder identity.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Deploys the bundle's resources.
    ///
    /// Action failures are reported in [`DeployReport::failure`]; errors that
    /// prevent the run (lock contention, lineage mismatch, plan errors,
    /// repeated persist conflicts) are returned.
    ///
    /// # Errors
    ///
    /// See above.
    pub async fn deploy(&self) -> Result<DeployReport> {
        self.run(DeploymentOperation::Deploy).await
    }

    /// Deletes every tracked resource, then the remote state and local cache.
    ///
    /// # Errors
    ///
    /// Same as [`Self::deploy`].
    pub async fn destroy(&self) -> Result<DeployReport> {
        self.run(DeploymentOperation::Destroy).await
    }

    /// Computes the plan for an operation without taking the lock.
    ///
    /// The plan is informational; the locked run re-plans.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or planning fails.
    pub async fn preview(&self, operation: DeploymentOperation) -> Result<DeploymentPlan> {
        let (state, _) = self.load_state().await?;
        self.plan_for(operation, &state)
    }

    /// Current state of the target, reloaded from the remote store if the
    /// cache is stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn current_state(&self) -> Result<DeploymentState> {
        Ok(self.load_state().await?.0)
    }

    /// Discards the local cache and pulls the remote state.
    ///
    /// No lineage check is made, so this also recovers from a lineage mismatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote store or the cache cannot be accessed.
    pub async fn refresh(&self) -> Result<Option<DeploymentState>> {
        self.cache.clear().await?;

        match self.repository.fetch().await? {
            Some(remote) => {
                self.cache.save(&remote.state, Some(&remote.version)).await?;
                info!(
                    "Pulled state for {} (serial {}, lineage {})",
                    self.target, remote.state.serial, remote.state.lineage
                );
                Ok(Some(remote.state))
            }
            None => {
                info!("No remote state for {}", self.target);
                Ok(None)
            }
        }
    }

    /// Reads the current lock of the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote store cannot be read.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.locks.get_lock_info(&self.target).await
    }

    /// Removes the target's lock regardless of its holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote store cannot be written.
    pub async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        self.locks.force_unlock(&self.target).await
    }

    async fn run(&self, operation: DeploymentOperation) -> Result<DeployReport> {
        info!("Starting {operation} of {} as {}", self.target, self.holder);

        let mut lock = self.locks.acquire(&self.target, &self.holder).await?;
        let result = self.run_locked(operation, &mut lock).await;

        if let Err(e) = self.locks.release(lock).await {
            warn!("Failed to release deployment lock for {}: {e}", self.target);
        }

        match &result {
            Ok(report) if report.failure.is_none() => info!("{operation} of {} complete", self.target),
            Ok(report) => {
                if let Some(e) = &report.failure {
                    error!("{operation} of {} incomplete: {e}", self.target);
                }
            }
            Err(e) => error!("{operation} of {} failed: {e}", self.target),
        }
        result
    }

    async fn run_locked(
        &self,
        operation: DeploymentOperation,
        lock: &mut Lock,
    ) -> Result<DeployReport> {
        let (mut state, mut base) = self.load_state().await?;
        let mut rebased: Vec<String> = Vec::new();
        let mut retried = false;

        loop {
            let plan = self.plan_for(operation, &state)?;
            info!(
                "Plan for {}: {} to create, {} to update, {} to delete, {} unchanged",
                self.target,
                plan.create_count(),
                plan.update_count(),
                plan.delete_count(),
                plan.noop_count()
            );

            let mut execution = None;
            let mut failure = None;
            let mut changed = !rebased.is_empty();
            let mut record_history = true;

            if plan.has_changes() {
                let mut result = self.execute(&plan, &mut state, lock, &mut base).await;
                changed |= result.changed;
                let aborted = result.aborted.is_some();
                record_history = !result.cancelled;
                failure = result.take_error();

                let conflicted = failure.as_ref().is_some_and(BundleError::is_persist_conflict);
                if aborted && !conflicted {
                    let unrecorded = result.succeeded_keys();
                    if !unrecorded.is_empty() {
                        error!(
                            "Run aborted; these changes may not be recorded remotely: {}",
                            unrecorded.join(", ")
                        );
                    }
                    return Ok(self.report(operation, plan, Some(result), &state, false, failure));
                }
                execution = Some(result);
            } else {
                info!("No changes required for {}", self.target);
            }

            let conflict = match failure.take() {
                Some(e) if e.is_persist_conflict() => Err(e),
                other => {
                    failure = other;
                    let mut touched = rebased.clone();
                    if let Some(result) = &execution {
                        touched.extend(result.succeeded_keys());
                    }
                    self.finish(
                        operation,
                        &mut state,
                        &mut base,
                        touched,
                        failure.as_ref(),
                        changed && record_history,
                    )
                    .await
                }
            };

            match conflict {
                Ok(persisted) => {
                    return Ok(self.report(operation, plan, execution, &state, persisted, failure));
                }
                Err(e) if e.is_persist_conflict() && !retried => {
                    warn!("Remote state for {} changed during {operation}; reloading and re-planning", self.target);
                    self.locks.heartbeat(lock).await?;

                    let (mut fresh, fresh_base) = self.reload(Some(&state)).await?;
                    if let Some(result) = &execution {
                        for done in result.with_status(|s| *s == ActionStatus::Succeeded) {
                            match state.get(&done.key) {
                                Some(record) => fresh.set_resource(record.clone()),
                                None => {
                                    fresh.remove_resource(&done.key);
                                }
                            }
                            rebased.push(done.key.to_string());
                        }
                    }

                    state = fresh;
                    base = fresh_base;
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute(
        &self,
        plan: &DeploymentPlan,
        state: &mut DeploymentState,
        lock: &mut Lock,
        base: &mut PersistBase,
    ) -> ExecutionResult {
        let executor = PlanExecutor::new(&self.registry, self.config.deploy.clone())
            .with_heartbeat_interval(Duration::from_secs(self.config.lock.heartbeat_interval_secs))
            .with_cancel_flag(Arc::clone(&self.cancel));

        let mut session = DeploySession {
            repository: &self.repository,
            locks: &self.locks,
            lock,
            base,
        };
        executor.execute(plan, state, &mut session).await
    }

    /// Writes the outcome of a run and refreshes the local cache.
    ///
    /// Returns true if the remote store was written.
    async fn finish(
        &self,
        operation: DeploymentOperation,
        state: &mut DeploymentState,
        base: &mut PersistBase,
        touched: Vec<String>,
        failure: Option<&BundleError>,
        persist: bool,
    ) -> Result<bool> {
        if operation == DeploymentOperation::Destroy && failure.is_none() && state.is_empty() {
            if base.version.is_none() {
                debug!("No remote state to delete for {}", self.target);
                self.cache.clear().await?;
                return Ok(false);
            }
            self.repository.delete(base).await?;
            self.cache.clear().await?;
            info!("Deleted state of {}", self.target);
            return Ok(true);
        }

        let mut persisted = false;
        if persist {
            let entry = match failure {
                Some(e) => {
                    DeploymentHistoryEntry::failed(operation, &self.holder, touched, &e.to_string())
                }
                None => DeploymentHistoryEntry::new(operation, &self.holder, touched),
            };
            state.add_history(entry);
            self.repository.persist(state, base).await?;
            persisted = true;
        }

        // A state that was never written has no version to cache against
        if base.version.is_some() {
            if let Err(e) = self.cache.save(state, base.version.as_ref()).await {
                warn!("Failed to update local state cache: {e}");
            }
        }

        Ok(persisted)
    }

    /// Loads the state to plan against.
    ///
    /// A fresh cache is used as is; otherwise the remote state replaces it.
    async fn load_state(&self) -> Result<(DeploymentState, PersistBase)> {
        let cached = self.cache.load().await;
        let staleness = StalenessDetector::new()
            .detect(cached.as_ref(), &self.repository)
            .await?;

        let (reason, cached) = match (staleness, cached) {
            (Staleness::Fresh, Some(cached)) => {
                debug!(
                    "Using cached state for {} (serial {})",
                    self.target, cached.state.serial
                );
                let base = PersistBase {
                    version: cached.version_marker.clone(),
                    serial: cached.state.serial,
                };
                return Ok((cached.state, base));
            }
            (Staleness::Fresh, None) => (StaleReason::NoLocalState, None),
            (Staleness::Stale(reason), cached) => (reason, cached),
        };

        info!("Local state for {} is stale ({reason}); loading remote state", self.target);
        self.reload(cached.as_ref().map(|c| &c.state)).await
    }

    /// Loads the remote state, checking it continues the local history.
    async fn reload(
        &self,
        local: Option<&DeploymentState>,
    ) -> Result<(DeploymentState, PersistBase)> {
        let Some(remote) = self.repository.fetch().await? else {
            debug!("No remote state for {}; starting a new deployment history", self.target);
            return Ok((DeploymentState::for_target(&self.target), PersistBase::default()));
        };

        // Only a persisted local state has a history to compare
        if let Some(local) = local.filter(|l| l.serial > 0) {
            if local.lineage != remote.state.lineage {
                return Err(StateError::LineageMismatch {
                    local: local.lineage.clone(),
                    remote: remote.state.lineage.clone(),
                }
                .into());
            }
        }

        let base = PersistBase::from_remote(&remote);
        Ok((remote.state, base))
    }

    fn plan_for(
        &self,
        operation: DeploymentOperation,
        state: &DeploymentState,
    ) -> Result<DeploymentPlan> {
        match operation {
            DeploymentOperation::Deploy => plan(&self.config.resources, state, &self.registry),
            DeploymentOperation::Destroy => DeploymentPlan::for_destroy(state),
        }
    }

    fn report(
        &self,
        operation: DeploymentOperation,
        plan: DeploymentPlan,
        execution: Option<ExecutionResult>,
        state: &DeploymentState,
        persisted: bool,
        failure: Option<BundleError>,
    ) -> DeployReport {
        DeployReport {
            operation,
            target: self.target.to_string(),
            plan,
            execution,
            serial: state.serial,
            persisted,
            failure,
        }
    }
}

impl DeployReport {
    /// Returns true if every action completed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("target", &self.target)
            .field("holder", &self.holder)
            .field("repository", &self.repository)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn serialize_failure<S: Serializer>(
    failure: &Option<BundleError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    failure.as_ref().map(ToString::to_string).serialize(serializer)
}
