//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::json;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{BundleConfig, ValidationResult};
use crate::orchestrator::DeployReport;
use crate::planner::{ActionStatus, ActionType, DeploymentPlan};
use crate::state::{BundleTarget, DeploymentState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Action result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Result")]
    result: String,
}

/// Tracked resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Remote ID")]
    remote_id: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &BundleConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let value = json!({
                    "bundle": config.bundle.name,
                    "valid": result.is_valid(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                    "targets": config.target_names(),
                    "resources": config.resources.len(),
                });
                serde_json::to_string_pretty(&value).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid\n", "✓".green())
                } else {
                    let mut out = format!(
                        "{} Configuration has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(out, "   - {error}");
                    }
                    out
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} {} warning(s):\n", "⚠".yellow(), result.warning_count());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(output, "\nBundle: {}\n", config.bundle.name);
                let _ = writeln!(output, "   Targets: {}", config.target_names().join(", "));
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                output
            }
        }
    }

    /// Formats a deployment plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &DeploymentPlan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&json!({
                "creates": plan.create_count(),
                "updates": plan.update_count(),
                "deletes": plan.delete_count(),
                "unchanged": plan.noop_count(),
                "actions": plan.actions,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &DeploymentPlan) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - deployment is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::from("\nDeployment Plan\n\n");

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .filter(|a| a.is_mutation())
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.key.to_string(),
                reason: Self::truncate(&a.reason, 40),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red(),
            plan.noop_count()
        );

        output
    }

    /// Formats the outcome of a deploy or destroy.
    #[must_use]
    pub fn format_report(&self, report: &DeployReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                if let Some(execution) = &report.execution {
                    let rows: Vec<ResultRow> = execution
                        .results
                        .iter()
                        .filter(|r| r.action_type != ActionType::NoOp)
                        .map(|r| ResultRow {
                            action: Self::format_action_type(r.action_type),
                            resource: r.key.to_string(),
                            result: Self::format_status(&r.status),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');

                    let _ = write!(
                        output,
                        "\n{} succeeded, {} failed, {} skipped, {} not started\n",
                        execution.succeeded, execution.failed, execution.skipped, execution.not_started
                    );
                } else {
                    output.push_str(&Self::format_plan_text(&report.plan));
                }

                let status = match &report.failure {
                    None => format!("{} {} of {} complete", "✓".green(), report.operation, report.target),
                    Some(e) => format!("{} {} of {} incomplete: {e}", "✗".red(), report.operation, report.target),
                };
                let _ = write!(output, "\n{status}\n");
                if report.persisted {
                    let _ = writeln!(output, "   State serial: {}", report.serial);
                }
                output
            }
        }
    }

    /// Formats deployment state.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.bundle, state.target);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.timestamp);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .iter()
                        .map(|(key, record)| ResourceRow {
                            resource: key.to_string(),
                            remote_id: record.remote_id.clone(),
                            fingerprint: Self::truncate(&record.fingerprint, 12),
                            updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} by {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.holder,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the lock of a target.
    #[must_use]
    pub fn format_lock(&self, target: &BundleTarget, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&json!({
                "target": target.to_string(),
                "lock": lock,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => match lock {
                None => format!("{} {target} is not locked\n", "✓".green()),
                Some(info) => {
                    let state = if info.is_expired() {
                        "expired".yellow()
                    } else {
                        "held".red()
                    };
                    let mut output = format!("{} Lock on {target} is {state}\n", "⚠".yellow());
                    let _ = writeln!(output, "   Holder: {}", info.holder);
                    let _ = writeln!(output, "   Lock ID: {}", info.lock_id);
                    let _ = writeln!(output, "   Acquired: {}", info.acquired_at);
                    let _ = writeln!(output, "   Expires: {}", info.expires_at);
                    output
                }
            },
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats an action status with color.
    fn format_status(status: &ActionStatus) -> String {
        match status {
            ActionStatus::Succeeded | ActionStatus::Unchanged => status.to_string().green().to_string(),
            ActionStatus::Failed(_) => status.to_string().red().to_string(),
            _ => status.to_string().yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
