//! Plan executor for applying deployment plans.
//!
//! Independent actions run concurrently up to the configured limit; an action
//! starts only once every action it depends on has succeeded, and no create or
//! update starts while a delete that does not wait for it is still
//! outstanding. After each successful action the state is checkpointed. A failed action skips its transitive
//! dependents. Nothing is rolled back.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{substitute_references, DeploySettings};
use crate::error::{BundleError, DeployError, Result};
use crate::provision::{DeleteOutcome, ProvisionerRegistry, ResourceProvisioner};
use crate::state::{DeploymentState, ResourceKey, ResourceRecord};

use super::diff::resolved_fingerprint;
use super::plan::{ActionType, DeploymentPlan, PlannedAction};

/// Default interval between lock heartbeats.
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Persists progress and keeps the deployment lock alive during execution.
#[async_trait]
pub trait Checkpointer: Send {
    /// Persists the in-memory state after a completed action.
    async fn checkpoint(&mut self, state: &mut DeploymentState) -> Result<()>;

    /// Extends the deployment lock.
    async fn heartbeat(&mut self) -> Result<()>;
}

/// Executor for deployment plans.
#[derive(Debug, Clone)]
pub struct PlanExecutor<'a> {
    /// Provisioners by resource type.
    registry: &'a ProvisionerRegistry,
    /// Concurrency and retry settings.
    settings: DeploySettings,
    /// Interval between lock heartbeats.
    heartbeat_interval: Duration,
    /// Set when the user asks to stop.
    cancel: Arc<AtomicBool>,
}

/// Status of a single action after execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for dependencies.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Nothing to do.
    Unchanged,
    /// Failed with the given error.
    Failed(String),
    /// Skipped because a dependency failed or was skipped.
    Skipped {
        /// The dependency that did not complete.
        failed_dependency: ResourceKey,
    },
    /// Never started because the run was cancelled or aborted.
    NotStarted,
}

/// Result of executing a single action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    /// Action index in the plan.
    pub index: usize,
    /// Resource key.
    pub key: ResourceKey,
    /// Action type.
    pub action_type: ActionType,
    /// Final status.
    pub status: ActionStatus,
}

/// Result of executing the entire plan.
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    /// Individual action results, in plan order.
    pub results: Vec<ActionResult>,
    /// Number of successful mutations.
    pub succeeded: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions (due to dependency failures).
    pub skipped: usize,
    /// Number of actions never started.
    pub not_started: usize,
    /// Whether the state was modified.
    pub changed: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Error that stopped the run (lost lock, persist conflict).
    #[serde(skip)]
    pub aborted: Option<BundleError>,
}

/// Everything a running action needs, owned.
struct Work {
    action_type: ActionType,
    key: ResourceKey,
    config: Value,
    remote_id: String,
    /// Fingerprint of the resolved configuration, recorded on success.
    fingerprint: String,
    provisioner: Arc<dyn ResourceProvisioner>,
}

/// Provisioner-side effect of a completed action.
enum Applied {
    Created { remote_id: String, fingerprint: String },
    Updated { fingerprint: String },
    Deleted(DeleteOutcome),
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    base_delay_ms: u64,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(registry: &'a ProvisionerRegistry, settings: DeploySettings) -> Self {
        Self {
            registry,
            settings,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the lock heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Shares a cancellation flag with the caller.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.settings.action_retries,
            base_delay_ms: self.settings.retry_base_delay_ms,
        }
    }

    /// Executes a deployment plan against `state`.
    ///
    /// Failures are reported in the result rather than returned, so the caller
    /// can always inspect what completed.
    pub async fn execute(
        &self,
        plan: &DeploymentPlan,
        state: &mut DeploymentState,
        checkpointer: &mut dyn Checkpointer,
    ) -> ExecutionResult {
        info!("Executing deployment plan with {} actions", plan.actions.len());

        let mut statuses: Vec<ActionStatus> = plan
            .actions
            .iter()
            .map(|a| {
                if a.is_mutation() {
                    ActionStatus::Pending
                } else {
                    ActionStatus::Unchanged
                }
            })
            .collect();

        let mut in_flight: FuturesUnordered<BoxFuture<'static, (usize, Result<Applied>)>> =
            FuturesUnordered::new();
        let mut aborted: Option<BundleError> = None;
        let mut cancelled = false;
        let mut changed = false;

        let period = self.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if aborted.is_none() {
                if self.is_cancelled() {
                    if !cancelled {
                        warn!("Cancellation requested; waiting for in-flight actions");
                        cancelled = true;
                    }
                } else {
                    self.schedule(plan, state, &mut statuses, &mut in_flight);
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((index, result)) = in_flight.next() => {
                    let action = &plan.actions[index];
                    match result {
                        Ok(applied) => {
                            record(action, applied, state);
                            statuses[index] = ActionStatus::Succeeded;
                            changed = true;
                            info!("{} succeeded", action.description());

                            if aborted.is_none() {
                                if let Err(e) = checkpointer.checkpoint(state).await {
                                    error!("Checkpoint after {} failed: {e}", action.key);
                                    aborted = Some(e);
                                }
                            } else {
                                warn!(
                                    "{} completed after the run was aborted; it is not recorded remotely",
                                    action.key
                                );
                            }
                        }
                        Err(e) => {
                            error!("{} failed: {e}", action.description());
                            statuses[index] = ActionStatus::Failed(e.to_string());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if aborted.is_none() {
                        if let Err(e) = checkpointer.heartbeat().await {
                            error!("Lock heartbeat failed: {e}");
                            aborted = Some(e);
                        }
                    }
                }
            }
        }

        // Whatever is still pending never ran
        for index in 0..statuses.len() {
            if statuses[index] == ActionStatus::Pending {
                statuses[index] = match blocked_by(&plan.actions[index], &statuses) {
                    Some(dep) => ActionStatus::Skipped {
                        failed_dependency: plan.actions[dep].key.clone(),
                    },
                    None => ActionStatus::NotStarted,
                };
            }
        }

        ExecutionResult::new(plan, statuses, changed, cancelled, aborted)
    }

    /// Starts every action that is ready, up to the concurrency limit.
    fn schedule(
        &self,
        plan: &DeploymentPlan,
        state: &DeploymentState,
        statuses: &mut [ActionStatus],
        in_flight: &mut FuturesUnordered<BoxFuture<'static, (usize, Result<Applied>)>>,
    ) {
        let limit = self.settings.concurrency.max(1);

        for (index, action) in plan.actions.iter().enumerate() {
            if statuses[index] != ActionStatus::Pending {
                continue;
            }

            if let Some(dep) = blocked_by(action, statuses) {
                warn!(
                    "Skipping {} because {} did not complete",
                    action.key, plan.actions[dep].key
                );
                statuses[index] = ActionStatus::Skipped {
                    failed_dependency: plan.actions[dep].key.clone(),
                };
                continue;
            }

            let ready = action
                .dependencies
                .iter()
                .all(|&d| matches!(statuses[d], ActionStatus::Succeeded | ActionStatus::Unchanged));
            if !ready || in_flight.len() >= limit {
                continue;
            }
            if action.action_type != ActionType::Delete && held_by_delete(plan, statuses, index) {
                continue;
            }

            match self.prepare(action, state) {
                Ok(work) => {
                    debug!("Starting {}", action.description());
                    statuses[index] = ActionStatus::Running;
                    let policy = self.retry_policy();
                    in_flight.push(async move { (index, run_action(work, policy).await) }.boxed());
                }
                Err(e) => {
                    error!("{} failed: {e}", action.description());
                    statuses[index] = ActionStatus::Failed(e.to_string());
                }
            }
        }
    }

    /// Resolves the provisioner and substitutes references for an action.
    fn prepare(&self, action: &PlannedAction, state: &DeploymentState) -> Result<Work> {
        let provisioner = Arc::clone(self.registry.get(&action.key.resource_type)?);

        let config = match (&action.action_type, &action.config) {
            (ActionType::Create | ActionType::Update, Some(config)) => {
                substitute_references(&action.key, config, &|key: &ResourceKey| {
                    state.get(key).map(|r| r.remote_id.clone())
                })?
            }
            _ => Value::Null,
        };

        let fingerprint = match action.action_type {
            ActionType::Create | ActionType::Update => {
                resolved_fingerprint(&*provisioner, &action.key, &config, &action.depends_on)
            }
            _ => String::new(),
        };

        let remote_id = match action.action_type {
            ActionType::Update | ActionType::Delete => action.remote_id.clone().ok_or_else(|| {
                BundleError::internal(format!("{} has no remote id", action.key))
            })?,
            _ => String::new(),
        };

        Ok(Work {
            action_type: action.action_type,
            key: action.key.clone(),
            config,
            remote_id,
            fingerprint,
            provisioner,
        })
    }
}

/// Returns true while a delete that does not wait for `index` is outstanding.
fn held_by_delete(plan: &DeploymentPlan, statuses: &[ActionStatus], index: usize) -> bool {
    plan.actions.iter().enumerate().any(|(d, a)| {
        a.action_type == ActionType::Delete
            && matches!(statuses[d], ActionStatus::Pending | ActionStatus::Running)
            && !waits_on(plan, d, index)
    })
}

/// Returns true if `action` waits, directly or through other actions, for `target`.
fn waits_on(plan: &DeploymentPlan, action: usize, target: usize) -> bool {
    let mut pending = vec![action];
    let mut seen = HashSet::new();

    while let Some(current) = pending.pop() {
        for &dep in &plan.actions[current].dependencies {
            if dep == target {
                return true;
            }
            if seen.insert(dep) {
                pending.push(dep);
            }
        }
    }
    false
}

/// Returns the first dependency that failed or was skipped.
fn blocked_by(action: &PlannedAction, statuses: &[ActionStatus]) -> Option<usize> {
    action.dependencies.iter().copied().find(|&d| {
        matches!(
            statuses[d],
            ActionStatus::Failed(_) | ActionStatus::Skipped { .. }
        )
    })
}

/// Runs one action, retrying transient failures with exponential backoff.
async fn run_action(work: Work, policy: RetryPolicy) -> Result<Applied> {
    let mut attempt: u32 = 0;

    loop {
        let result = match work.action_type {
            ActionType::Create => work
                .provisioner
                .create(&work.key, &work.config)
                .await
                .map(|remote_id| Applied::Created {
                    remote_id,
                    fingerprint: work.fingerprint.clone(),
                }),
            ActionType::Update => work
                .provisioner
                .update(&work.key, &work.remote_id, &work.config)
                .await
                .map(|()| Applied::Updated {
                    fingerprint: work.fingerprint.clone(),
                }),
            ActionType::Delete => work
                .provisioner
                .delete(&work.key, &work.remote_id)
                .await
                .map(Applied::Deleted),
            ActionType::NoOp => return Err(BundleError::internal("no-op actions are not executed")),
        };

        match result {
            Err(e) if e.is_retryable() => {
                if attempt >= policy.retries {
                    warn!("Giving up on {} after {} attempts: {e}", work.key, attempt + 1);
                    return Err(DeployError::MaxRetriesExceeded {
                        attempts: attempt + 1,
                        resource: work.key.to_string(),
                    }
                    .into());
                }

                let delay = policy.base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
                warn!("{} failed transiently ({e}); retrying in {delay}ms", work.key);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Applies a completed action to the in-memory state.
fn record(action: &PlannedAction, applied: Applied, state: &mut DeploymentState) {
    match applied {
        Applied::Created { remote_id, fingerprint } => {
            let mut record = ResourceRecord::new(&action.key, &remote_id, &fingerprint);
            record.depends_on.clone_from(&action.depends_on);
            state.set_resource(record);
        }
        Applied::Updated { fingerprint } => {
            if let Some(mut record) = state.get(&action.key).cloned() {
                record.touch(&fingerprint);
                record.depends_on.clone_from(&action.depends_on);
                state.set_resource(record);
            }
        }
        Applied::Deleted(outcome) => {
            if outcome == DeleteOutcome::AlreadyAbsent {
                debug!("{} was already absent", action.key);
            }
            state.remove_resource(&action.key);
        }
    }
}

impl ExecutionResult {
    fn new(
        plan: &DeploymentPlan,
        statuses: Vec<ActionStatus>,
        changed: bool,
        cancelled: bool,
        aborted: Option<BundleError>,
    ) -> Self {
        let mut result = Self {
            results: Vec::with_capacity(statuses.len()),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            not_started: 0,
            changed,
            cancelled,
            aborted,
        };

        for (index, (action, status)) in plan.actions.iter().zip(statuses).enumerate() {
            match status {
                ActionStatus::Succeeded => result.succeeded += 1,
                ActionStatus::Failed(_) => result.failed += 1,
                ActionStatus::Skipped { .. } => result.skipped += 1,
                ActionStatus::NotStarted | ActionStatus::Pending | ActionStatus::Running => {
                    result.not_started += 1;
                }
                ActionStatus::Unchanged => {}
            }
            result.results.push(ActionResult {
                index,
                key: action.key.clone(),
                action_type: action.action_type,
                status,
            });
        }

        result
    }

    /// Returns true if every action completed.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failed == 0
            && self.skipped == 0
            && self.not_started == 0
            && !self.cancelled
            && self.aborted.is_none()
    }

    /// Results with the given status predicate.
    pub fn with_status<F>(&self, predicate: F) -> impl Iterator<Item = &ActionResult>
    where
        F: Fn(&ActionStatus) -> bool,
    {
        self.results.iter().filter(move |r| predicate(&r.status))
    }

    /// Keys of every resource whose action ran successfully.
    #[must_use]
    pub fn succeeded_keys(&self) -> Vec<String> {
        self.with_status(|s| *s == ActionStatus::Succeeded)
            .map(|r| r.key.to_string())
            .collect()
    }

    /// Converts an unsuccessful run into the error that describes it.
    pub fn take_error(&mut self) -> Option<BundleError> {
        if let Some(e) = self.aborted.take() {
            return Some(e);
        }
        if self.cancelled {
            return Some(DeployError::Cancelled.into());
        }
        if self.failed > 0 || self.skipped > 0 {
            return Some(
                DeployError::PartialFailure {
                    failed: self.failed,
                    skipped: self.skipped,
                }
                .into(),
            );
        }
        None
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::Skipped { failed_dependency } => {
                write!(f, "skipped ({failed_dependency} did not complete)")
            }
            Self::NotStarted => write!(f, "not started"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::error::{LockError, StateError};
    use crate::planner::plan::plan;
    use crate::provision::MemoryProvisioner;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingCheckpointer {
        checkpoints: usize,
        heartbeats: usize,
        fail_checkpoint_at: Option<usize>,
        fail_heartbeat: bool,
        resource_counts: Vec<usize>,
    }

    #[async_trait]
    impl Checkpointer for RecordingCheckpointer {
        async fn checkpoint(&mut self, state: &mut DeploymentState) -> Result<()> {
            self.checkpoints += 1;
            self.resource_counts.push(state.resources.len());
            if self.fail_checkpoint_at == Some(self.checkpoints) {
                return Err(StateError::PersistConflict {
                    path: String::from("state"),
                    attempted: 2,
                }
                .into());
            }
            Ok(())
        }

        async fn heartbeat(&mut self) -> Result<()> {
            self.heartbeats += 1;
            if self.fail_heartbeat {
                return Err(LockError::Lost {
                    lock_id: String::from("l1"),
                }
                .into());
            }
            Ok(())
        }
    }

    fn setup(memory: &MemoryProvisioner) -> ProvisionerRegistry {
        let provisioner: Arc<dyn ResourceProvisioner> = Arc::new(memory.clone());
        ProvisionerRegistry::new().register_all(["job", "pipeline"], &provisioner)
    }

    fn settings(concurrency: usize, action_retries: u32) -> DeploySettings {
        DeploySettings {
            concurrency,
            action_retries,
            retry_base_delay_ms: 1,
        }
    }

    fn resource(k: &str, depends_on: &[&str], config: Value) -> ResourceConfig {
        let key: ResourceKey = k.parse().expect("valid key");
        ResourceConfig {
            resource_type: key.resource_type,
            name: key.name,
            depends_on: depends_on.iter().map(|d| d.parse().expect("valid key")).collect(),
            config,
        }
    }

    fn key(s: &str) -> ResourceKey {
        s.parse().expect("valid key")
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_every_action_checkpoints() {
        let memory = MemoryProvisioner::new().with_latency(Duration::from_millis(20));
        let registry = setup(&memory);
        let desired: Vec<_> = (0..6)
            .map(|i| resource(&format!("job.j{i}"), &[], json!({"i": i})))
            .collect();
        let mut state = DeploymentState::new("b", "dev");
        let plan = plan(&desired, &state, &registry).expect("plan");

        let mut checkpointer = RecordingCheckpointer::default();
        let result = PlanExecutor::new(&registry, settings(2, 0))
            .execute(&plan, &mut state, &mut checkpointer)
            .await;

        assert!(result.success());
        assert_eq!(result.succeeded, 6);
        assert!(memory.max_in_flight() <= 2);
        assert!(memory.max_in_flight() >= 1);
        assert_eq!(checkpointer.checkpoints, 6);
        assert_eq!(checkpointer.resource_counts, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(state.resources.len(), 6);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_independent_actions() {
        let memory = MemoryProvisioner::new();
        memory.fail_permanently(&key("pipeline.broken")).await;
        let registry = setup(&memory);

        let desired = vec![
            resource("pipeline.broken", &[], json!({})),
            resource("job.child", &[], json!({"p": "${resources.pipeline.broken.id}"})),
            resource("job.grandchild", &["job.child"], json!({})),
            resource("job.independent", &[], json!({})),
        ];
        let mut state = DeploymentState::new("b", "dev");
        let plan = plan(&desired, &state, &registry).expect("plan");

        let mut checkpointer = RecordingCheckpointer::default();
        let mut result = PlanExecutor::new(&registry, settings(4, 0))
            .execute(&plan, &mut state, &mut checkpointer)
            .await;

        assert_eq!((result.succeeded, result.failed, result.skipped), (1, 1, 2));
        assert!(state.get(&key("job.independent")).is_some());
        assert!(state.get(&key("job.child")).is_none());

        let grandchild = result
            .results
            .iter()
            .find(|r| r.key == key("job.grandchild"))
            .expect("present");
        assert_eq!(
            grandchild.status,
            ActionStatus::Skipped {
                failed_dependency: key("job.child")
            }
        );

        assert!(matches!(
            result.take_error(),
            Some(BundleError::Deploy(DeployError::PartialFailure { failed: 1, skipped: 2 }))
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let memory = MemoryProvisioner::new();
        memory.fail_transiently(&key("job.flaky"), 2).await;
        memory.fail_transiently(&key("job.hopeless"), 10).await;
        let registry = setup(&memory);

        let desired = vec![
            resource("job.flaky", &[], json!({})),
            resource("job.hopeless", &[], json!({})),
        ];
        let mut state = DeploymentState::new("b", "dev");
        let plan = plan(&desired, &state, &registry).expect("plan");

        let result = PlanExecutor::new(&registry, settings(2, 2))
            .execute(&plan, &mut state, &mut RecordingCheckpointer::default())
            .await;

        assert!(state.get(&key("job.flaky")).is_some());
        let hopeless = &result.results[1];
        assert!(
            matches!(&hopeless.status, ActionStatus::Failed(msg) if msg.contains("Maximum retry attempts (3)")),
            "{:?}",
            hopeless.status
        );
    }

    #[tokio::test]
    async fn test_references_are_substituted_with_remote_ids() {
        let memory = MemoryProvisioner::new();
        let registry = setup(&memory);

        let desired = vec![
            resource("job.consumer", &[], json!({"source": "${resources.pipeline.feed.id}"})),
            resource("pipeline.feed", &[], json!({})),
        ];
        let mut state = DeploymentState::new("b", "dev");
        let plan = plan(&desired, &state, &registry).expect("plan");

        let result = PlanExecutor::new(&registry, settings(4, 0))
            .execute(&plan, &mut state, &mut RecordingCheckpointer::default())
            .await;
        assert!(result.success());

        let pipeline_id = state.get(&key("pipeline.feed")).expect("pipeline").remote_id.clone();
        let consumer_id = state.get(&key("job.consumer")).expect("job").remote_id.clone();
        let consumer = memory.get(&consumer_id).await.expect("created");
        assert_eq!(consumer.config, json!({"source": pipeline_id}));
        assert_eq!(
            state.get(&key("job.consumer")).expect("job").depends_on,
            vec![key("pipeline.feed")]
        );
    }

    #[tokio::test]
    async fn test_checkpoint_failure_aborts_run() {
        let memory = MemoryProvisioner::new();
        let registry = setup(&memory);
        let desired: Vec<_> = (0..3)
            .map(|i| resource(&format!("job.j{i}"), &[], json!({})))
            .collect();
        let mut state = DeploymentState::new("b", "dev");
        let plan = plan(&desired, &state, &registry).expect("plan");

        let mut checkpointer = RecordingCheckpointer {
            fail_checkpoint_at: Some(1),
            ..RecordingCheckpointer::default()
        };
        let mut result = PlanExecutor::new(&registry, settings(1, 0))
            .execute(&plan, &mut state, &mut checkpointer)
            .await;

        assert_eq!(result.succeeded, 1);
        assert_eq!(result.not_started, 2);
        assert_eq!(checkpointer.checkpoints, 1);
        assert!(result.take_error().is_some_and(|e| e.is_persist_conflict()));
    }

    #[tokio::test]
    async fn test_lost_lock_aborts_run() {
        let memory = MemoryProvisioner::new().with_latency(Duration::from_millis(40));
        let registry = setup(&memory);
        let desired: Vec<_> = (0..3)
            .map(|i| resource(&format!("job.j{i}"), &[], json!({})))
            .collect();
        let mut state = DeploymentState::new("b", "dev");
        let plan = plan(&desired, &state, &registry).expect("plan");

        let mut checkpointer = RecordingCheckpointer {
            fail_heartbeat: true,
            ..RecordingCheckpointer::default()
        };
        let mut result = PlanExecutor::new(&registry, settings(1, 0))
            .with_heartbeat_interval(Duration::from_millis(10))
            .execute(&plan, &mut state, &mut checkpointer)
            .await;

        assert!(checkpointer.heartbeats >= 1);
        assert_eq!(checkpointer.checkpoints, 0);
        assert!(matches!(
            result.take_error(),
            Some(BundleError::Lock(LockError::Lost { .. }))
        ));
        // The in-flight action still finished and is in memory
        assert_eq!(result.succeeded, 1);
        assert_eq!(state.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let memory = MemoryProvisioner::new();
        let registry = setup(&memory);
        let desired = vec![resource("job.a", &[], json!({}))];
        let mut state = DeploymentState::new("b", "dev");
        let plan = plan(&desired, &state, &registry).expect("plan");

        let cancel = Arc::new(AtomicBool::new(true));
        let mut result = PlanExecutor::new(&registry, settings(1, 0))
            .with_cancel_flag(cancel)
            .execute(&plan, &mut state, &mut RecordingCheckpointer::default())
            .await;

        assert!(result.cancelled);
        assert_eq!(memory.calls().await, 0);
        assert!(matches!(
            result.take_error(),
            Some(BundleError::Deploy(DeployError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_destroy_treats_already_absent_as_success() {
        let memory = MemoryProvisioner::new();
        let registry = setup(&memory);
        let desired = vec![
            resource("pipeline.p", &[], json!({})),
            resource("job.j", &["pipeline.p"], json!({})),
        ];
        let mut state = DeploymentState::new("b", "dev");
        let apply = plan(&desired, &state, &registry).expect("plan");
        let executor = PlanExecutor::new(&registry, settings(2, 0));
        assert!(executor
            .execute(&apply, &mut state, &mut RecordingCheckpointer::default())
            .await
            .success());

        // Someone deleted the job by hand
        let job_id = state.get(&key("job.j")).expect("job").remote_id.clone();
        assert!(memory.remove_out_of_band(&job_id).await);

        let destroy = DeploymentPlan::for_destroy(&state).expect("destroy plan");
        let result = executor
            .execute(&destroy, &mut state, &mut RecordingCheckpointer::default())
            .await;

        assert!(result.success());
        assert!(state.is_empty());
        assert!(memory.resources().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_waits_for_update_dropping_its_reference() {
        let memory = MemoryProvisioner::new();
        let registry = setup(&memory);
        let mut state = DeploymentState::new("b", "dev");
        let before = vec![
            resource("pipeline.p", &[], json!({})),
            resource("job.j", &["pipeline.p"], json!({"n": 1})),
        ];
        let apply = plan(&before, &state, &registry).expect("plan");
        let executor = PlanExecutor::new(&registry, settings(4, 0));
        assert!(executor
            .execute(&apply, &mut state, &mut RecordingCheckpointer::default())
            .await
            .success());

        let after = vec![resource("job.j", &[], json!({"n": 1}))];
        let next = plan(&after, &state, &registry).expect("plan");
        assert_eq!(next.actions[0].action_type, ActionType::Delete);
        assert_eq!(next.actions[1].action_type, ActionType::Update);

        let mut checkpointer = RecordingCheckpointer::default();
        let result = executor.execute(&next, &mut state, &mut checkpointer).await;

        assert!(result.success());
        assert_eq!(result.succeeded, 2);
        // The update is checkpointed while the pipeline is still recorded
        assert_eq!(checkpointer.resource_counts, vec![2, 1]);
        assert!(state.get(&key("pipeline.p")).is_none());
        assert!(state.get(&key("job.j")).expect("job").depends_on.is_empty());
    }

    #[tokio::test]
    async fn test_dependent_of_recreated_resource_is_updated_then_settles() {
        let memory = MemoryProvisioner::new();
        let registry = setup(&memory);
        let desired = vec![
            resource("pipeline.feed", &[], json!({})),
            resource("job.consumer", &[], json!({"source": "${resources.pipeline.feed.id}"})),
        ];
        let mut state = DeploymentState::new("b", "dev");
        let executor = PlanExecutor::new(&registry, settings(2, 0));
        let apply = plan(&desired, &state, &registry).expect("plan");
        assert!(executor
            .execute(&apply, &mut state, &mut RecordingCheckpointer::default())
            .await
            .success());

        // The pipeline is dropped from state and has to be created again
        let old_id = state
            .remove_resource(&key("pipeline.feed"))
            .expect("recorded")
            .remote_id;
        let recreate = plan(&desired, &state, &registry).expect("plan");
        let types: Vec<_> = recreate.actions.iter().map(|a| a.action_type).collect();
        assert!(types.contains(&ActionType::Create));
        assert!(types.contains(&ActionType::Update));

        assert!(executor
            .execute(&recreate, &mut state, &mut RecordingCheckpointer::default())
            .await
            .success());

        let new_id = state.get(&key("pipeline.feed")).expect("pipeline").remote_id.clone();
        assert_ne!(new_id, old_id);
        let consumer_id = state.get(&key("job.consumer")).expect("job").remote_id.clone();
        let consumer = memory.get(&consumer_id).await.expect("consumer");
        assert_eq!(consumer.config, json!({"source": new_id}));

        let settled = plan(&desired, &state, &registry).expect("plan");
        assert!(settled.actions.iter().all(|a| a.action_type == ActionType::NoOp));
    }
}
