// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Bundle Deploy
//!
//! A declarative, idempotent deployment engine for bundles of workspace
//! resources, with shared remote state, locking and staleness detection.
//!
//! ## Overview
//!
//! A bundle declares jobs, pipelines and other resources in `bundle.yaml`.
//! Deploying it to a target:
//!
//! - Takes the target's deployment lock in the remote store
//! - Loads the deployment state, preferring the local cache only while it
//!   matches the remote copy
//! - Plans creates, updates and deletes from resource fingerprints
//! - Executes the plan with bounded concurrency, checkpointing the state
//!   after every successful action
//!
//! Several people deploying the same bundle from different machines therefore
//! converge on one set of remote resources instead of duplicating them.
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and fingerprinting
//! - [`state`]: Deployment state, local cache, remote stores and locking
//! - [`provision`]: Resource provisioners and their registry
//! - [`planner`]: Dependency graph, diff, plan and executor
//! - [`orchestrator`]: Locked deploy and destroy runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! bundle:
//!   name: nightly-etl
//!
//! workspace:
//!   host: https://workspace.example.com
//!
//! targets:
//!   dev:
//!     default: true
//!
//! resources:
//!   - type: job
//!     name: ingest
//!     config:
//!       schedule: "0 2 * * *"
//!   - type: pipeline
//!     name: refine
//!     config:
//!       source_job: ${resources.job.ingest.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod provision;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{BundleConfig, ConfigHasher, ConfigParser, ConfigValidator};
pub use error::{BundleError, Result};
pub use orchestrator::{DeployReport, Orchestrator};
pub use planner::{DeploymentPlan, DiffEngine, PlanExecutor};
pub use provision::{ProvisionerRegistry, ResourceProvisioner};
pub use state::{
    DeploymentState, FsRemoteStore, LocalStateCache, LockManager, MemoryRemoteStore, RemoteStore,
    S3RemoteStore,
};
