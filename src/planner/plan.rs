//! Deployment plan types and construction.
//!
//! This module turns a diff into an ordered list of actions. Deletes come
//! first, dependents before their dependencies; desired resources follow in
//! dependency order. Each action lists the indices of the actions it must wait
//! for.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::config::ResourceConfig;
use crate::error::{PlanError, Result};
use crate::provision::ProvisionerRegistry;
use crate::state::{DeploymentState, ResourceKey};

use super::diff::{DiffEngine, DiffType};
use super::graph::DependencyGraph;

/// A complete deployment plan.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Resource key.
    pub key: ResourceKey,
    /// Declared configuration (creates, updates and no-ops).
    #[serde(skip)]
    pub config: Option<Value>,
    /// Remote identifier of the tracked resource (updates, deletes and no-ops).
    pub remote_id: Option<String>,
    /// Desired fingerprint (creates, updates and no-ops).
    pub fingerprint: Option<String>,
    /// Resources the declared configuration depends on.
    pub depends_on: Vec<ResourceKey>,
    /// Reason for this action.
    pub reason: String,
    /// Dependencies (action indices that must complete first).
    pub dependencies: Vec<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// No operation (for tracking).
    NoOp,
}

/// Computes the plan that moves `state` to the desired resources.
///
/// # Errors
///
/// Returns an error if a resource type has no provisioner, a reference names an
/// undeclared resource, or the dependencies contain a cycle.
pub fn plan(
    desired: &[ResourceConfig],
    state: &DeploymentState,
    registry: &ProvisionerRegistry,
) -> Result<DeploymentPlan> {
    let diff = DiffEngine::new(registry).compute_diff(desired, state)?;

    let removed: Vec<ResourceKey> = diff
        .diffs
        .iter()
        .filter(|d| d.diff_type == DiffType::Delete)
        .map(|d| d.key.clone())
        .collect();
    let mut actions = delete_actions(&removed, state, "Resource removed from configuration")?;

    let mut graph = DependencyGraph::new();
    for resource in desired {
        graph.add_node(resource.key());
    }
    for resource in desired {
        let key = resource.key();
        for dep in resource.references() {
            if !graph.add_edge(&key, &dep) {
                return Err(PlanError::UnknownReference {
                    from: key.to_string(),
                    to: dep.to_string(),
                }
                .into());
            }
        }
    }

    let by_key: HashMap<ResourceKey, &ResourceConfig> =
        desired.iter().map(|r| (r.key(), r)).collect();
    let mut positions: HashMap<ResourceKey, usize> = HashMap::new();

    for key in graph.topological_order()? {
        let (Some(resource), Some(resource_diff)) = (by_key.get(key), diff.get(key)) else {
            continue;
        };

        let (action_type, reason) = match resource_diff.diff_type {
            DiffType::Create => (ActionType::Create, "Resource defined in configuration"),
            DiffType::Update if resource_diff.new_fingerprint.is_none() => {
                (ActionType::Update, "Referenced resource will be recreated")
            }
            DiffType::Update => (ActionType::Update, "Configuration or dependencies changed"),
            DiffType::NoChange | DiffType::Delete => (ActionType::NoOp, "Up to date"),
        };

        let dependencies = graph
            .waits_for(key)
            .into_iter()
            .filter_map(|dep| positions.get(dep).copied())
            .collect();

        positions.insert(key.clone(), actions.len());
        actions.push(PlannedAction {
            action_type,
            key: key.clone(),
            config: Some(resource.config.clone()),
            remote_id: resource_diff.remote_id.clone(),
            fingerprint: resource_diff.new_fingerprint.clone(),
            depends_on: resource.references(),
            reason: reason.to_string(),
            dependencies,
        });
    }

    // A resource that drops its reference to a removed one is updated before
    // the removed one is deleted
    let delete_count = removed.len();
    for di in 0..delete_count {
        let waits: Vec<usize> = (delete_count..actions.len())
            .filter(|&ui| {
                actions[ui].action_type == ActionType::Update
                    && state
                        .get(&actions[ui].key)
                        .is_some_and(|r| r.depends_on.contains(&actions[di].key))
            })
            .collect();
        actions[di].dependencies.extend(waits);
    }

    Ok(DeploymentPlan {
        created_at: Utc::now(),
        actions,
    })
}

/// Builds delete actions for `keys`, dependents before their dependencies.
///
/// Ordering uses the `depends_on` edges recorded in the state; ties are broken
/// by key order.
fn delete_actions(
    keys: &[ResourceKey],
    state: &DeploymentState,
    reason: &str,
) -> Result<Vec<PlannedAction>> {
    let mut sorted = keys.to_vec();
    sorted.sort();

    let mut graph = DependencyGraph::new();
    for key in &sorted {
        graph.add_node(key.clone());
    }
    // A dependency is deleted after everything that depends on it
    for key in &sorted {
        if let Some(record) = state.get(key) {
            for dep in &record.depends_on {
                graph.add_edge(dep, key);
            }
        }
    }

    let mut positions: HashMap<&ResourceKey, usize> = HashMap::new();
    let mut actions = Vec::with_capacity(sorted.len());

    for key in graph.topological_order()? {
        let dependencies = graph
            .waits_for(key)
            .into_iter()
            .filter_map(|k| positions.get(k).copied())
            .collect();

        positions.insert(key, actions.len());
        actions.push(PlannedAction {
            action_type: ActionType::Delete,
            key: key.clone(),
            config: None,
            remote_id: state.get(key).map(|r| r.remote_id.clone()),
            fingerprint: None,
            depends_on: Vec::new(),
            reason: reason.to_string(),
            dependencies,
        });
    }

    Ok(actions)
}

impl DeploymentPlan {
    /// Creates a plan that deletes every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the recorded dependencies contain a cycle.
    pub fn for_destroy(state: &DeploymentState) -> Result<Self> {
        let keys: Vec<ResourceKey> = state.resources.keys().cloned().collect();
        Ok(Self {
            created_at: Utc::now(),
            actions: delete_actions(&keys, state, "Destroying target")?,
        })
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            created_at: Utc::now(),
            actions: vec![],
        }
    }

    /// Returns true if executing the plan would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.action_type != ActionType::NoOp)
    }

    fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Returns the number of create actions.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ActionType::Create)
    }

    /// Returns the number of update actions.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ActionType::Update)
    }

    /// Returns the number of delete actions.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ActionType::Delete)
    }

    /// Returns the number of no-op actions.
    #[must_use]
    pub fn noop_count(&self) -> usize {
        self.count(ActionType::NoOp)
    }
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create {}", self.key),
            ActionType::Update => format!("Update {}", self.key),
            ActionType::Delete => format!("Delete {}", self.key),
            ActionType::NoOp => format!("No change for {}", self.key),
        }
    }

    /// Returns true if the action calls the provisioner.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        self.action_type != ActionType::NoOp
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action_type, self.key)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Deployment Plan ({} actions):", self.actions.len())?;
        for (i, action) in self.actions.iter().enumerate() {
            writeln!(f, "  {i}. {action}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::{MemoryProvisioner, ResourceProvisioner};
    use crate::state::ResourceRecord;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ProvisionerRegistry {
        let memory: Arc<dyn ResourceProvisioner> = Arc::new(MemoryProvisioner::new());
        ProvisionerRegistry::new().register_all(["job", "pipeline", "cluster"], &memory)
    }

    fn key(s: &str) -> ResourceKey {
        s.parse().expect("valid key")
    }

    fn resource(k: &str, depends_on: &[&str], config: Value) -> ResourceConfig {
        let k = key(k);
        ResourceConfig {
            resource_type: k.resource_type,
            name: k.name,
            depends_on: depends_on.iter().map(|d| key(d)).collect(),
            config,
        }
    }

    /// State after applying `desired` in order, as the executor records it.
    fn applied(desired: &[ResourceConfig], registry: &ProvisionerRegistry) -> DeploymentState {
        let engine = DiffEngine::new(registry);
        let mut state = DeploymentState::new("b", "dev");
        for (i, r) in desired.iter().enumerate() {
            let fp = engine
                .desired_fingerprint(r, &state)
                .expect("registered")
                .expect("references resolved");
            let mut record = ResourceRecord::new(&r.key(), &i.to_string(), &fp);
            record.depends_on = r.references();
            state.set_resource(record);
        }
        state
    }

    fn order(plan: &DeploymentPlan) -> Vec<String> {
        plan.actions
            .iter()
            .map(|a| format!("{} {}", a.action_type, a.key))
            .collect()
    }

    #[test]
    fn test_fresh_plan_orders_by_dependencies() {
        let desired = vec![
            resource("job.report", &[], json!({"pipeline": "${resources.pipeline.etl.id}"})),
            resource("pipeline.etl", &["cluster.shared"], json!({})),
            resource("cluster.shared", &[], json!({})),
        ];
        let state = DeploymentState::new("b", "dev");

        let plan = plan(&desired, &state, &registry()).expect("plan");

        assert_eq!(
            order(&plan),
            vec!["create cluster.shared", "create pipeline.etl", "create job.report"]
        );
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![1]);
        assert_eq!(plan.actions[2].depends_on, vec![key("pipeline.etl")]);
        assert_eq!(plan.create_count(), 3);
    }

    #[test]
    fn test_replan_of_applied_state_is_all_noop() {
        let registry = registry();
        let desired = vec![
            resource("pipeline.etl", &[], json!({"a": 1})),
            resource("job.nightly", &["pipeline.etl"], json!({"b": 2})),
        ];

        let state = applied(&desired, &registry);

        let plan = plan(&desired, &state, &registry).expect("plan");
        assert!(!plan.has_changes());
        assert_eq!(plan.noop_count(), 2);
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_deletes_come_first_dependents_before_dependencies() {
        let mut state = DeploymentState::new("b", "dev");
        let mut job = ResourceRecord::new(&key("job.a-report"), "1", "f");
        job.depends_on = vec![key("pipeline.z-etl")];
        state.set_resource(job);
        state.set_resource(ResourceRecord::new(&key("pipeline.z-etl"), "2", "f"));
        state.set_resource(ResourceRecord::new(&key("cluster.m-other"), "3", "f"));

        let desired = vec![resource("job.keep", &[], json!({}))];
        let plan = plan(&desired, &state, &registry()).expect("plan");

        assert_eq!(
            order(&plan),
            vec![
                "delete cluster.m-other",
                "delete job.a-report",
                "delete pipeline.z-etl",
                "create job.keep",
            ]
        );
        assert_eq!(plan.actions[2].dependencies, vec![1]);
    }

    #[test]
    fn test_added_dependency_is_updated_and_orders_destroy() {
        let registry = registry();
        let job = resource("job.z", &[], json!({}));
        let pipeline = resource("pipeline.a", &[], json!({}));
        let mut state = applied(&[job.clone(), pipeline], &registry);

        let linked = resource("pipeline.a", &["job.z"], json!({}));
        let plan = plan(&[job, linked], &state, &registry).expect("plan");
        assert_eq!(order(&plan), vec!["noop job.z", "update pipeline.a"]);
        let update = &plan.actions[1];
        assert_eq!(update.depends_on, vec![key("job.z")]);

        // What the executor records for the update
        let mut record = state.get(&key("pipeline.a")).cloned().expect("tracked");
        record.touch(update.fingerprint.as_deref().expect("resolved"));
        record.depends_on.clone_from(&update.depends_on);
        state.set_resource(record);

        let destroy = DeploymentPlan::for_destroy(&state).expect("destroy");
        assert_eq!(order(&destroy), vec!["delete pipeline.a", "delete job.z"]);
        assert_eq!(destroy.actions[1].dependencies, vec![0]);
    }

    #[test]
    fn test_delete_waits_for_update_dropping_the_reference() {
        let registry = registry();
        let referencing = resource("job.j", &["pipeline.p"], json!({}));
        let state = applied(&[resource("pipeline.p", &[], json!({})), referencing], &registry);

        let desired = vec![resource("job.j", &[], json!({}))];
        let plan = plan(&desired, &state, &registry).expect("plan");

        assert_eq!(order(&plan), vec!["delete pipeline.p", "update job.j"]);
        assert_eq!(plan.actions[0].dependencies, vec![1]);
        assert!(plan.actions[1].dependencies.is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let desired = vec![
            resource("job.a", &["job.b"], json!({})),
            resource("job.b", &[], json!({"x": "${resources.job.a.id}"})),
        ];
        let err = plan(&desired, &DeploymentState::new("b", "dev"), &registry())
            .expect_err("cycle");
        assert!(err.to_string().contains("job.a -> job.b -> job.a"));
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let desired = vec![resource("job.a", &["job.ghost"], json!({}))];
        let err = plan(&desired, &DeploymentState::new("b", "dev"), &registry())
            .expect_err("unknown reference");
        assert!(err.to_string().contains("job.ghost"));
    }

    #[test]
    fn test_for_destroy() {
        let mut state = DeploymentState::new("b", "dev");
        let mut job = ResourceRecord::new(&key("job.report"), "1", "f");
        job.depends_on = vec![key("pipeline.etl")];
        state.set_resource(job);
        state.set_resource(ResourceRecord::new(&key("pipeline.etl"), "2", "f"));

        let plan = DeploymentPlan::for_destroy(&state).expect("plan");
        assert_eq!(order(&plan), vec!["delete job.report", "delete pipeline.etl"]);
        assert_eq!(plan.delete_count(), 2);
        assert_eq!(plan.actions[0].remote_id.as_deref(), Some("1"));

        assert!(!DeploymentPlan::for_destroy(&DeploymentState::new("b", "dev"))
            .expect("empty")
            .has_changes());
    }
}
