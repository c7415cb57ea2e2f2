//! Planning and execution of deployment operations.
//!
//! This module compares the declared resources with the recorded state,
//! orders the resulting actions by dependency, and applies them.

mod diff;
mod executor;
mod graph;
mod plan;

pub use diff::{DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ActionResult, ActionStatus, Checkpointer, ExecutionResult, PlanExecutor};
pub use graph::DependencyGraph;
pub use plan::{plan, ActionType, DeploymentPlan, PlannedAction};
