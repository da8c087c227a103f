//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::DependencyGraph;
use crate::planner::{ChangeAction, ExecutionResult, Plan, ResourceStatus};
use crate::reconciler::DriftReport;
use crate::state::{DeploymentState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct PlanChangeRow {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

/// Managed resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when producing JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => plan.to_json().unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan for {}/{}\n", plan.project, plan.environment);
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            &plan.config_hash[..8.min(plan.config_hash.len())]
        );

        let rows: Vec<PlanChangeRow> = plan
            .changes
            .iter()
            .filter(|c| c.action.is_change())
            .map(|c| PlanChangeRow {
                rank: c.rank,
                action: Self::format_action(c.action),
                resource: c.address.to_string(),
                reason: Self::truncate(&c.reason, 50),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let detailed: Vec<_> = plan
            .changes
            .iter()
            .filter(|c| !c.changes.is_empty())
            .collect();
        if !detailed.is_empty() {
            output.push_str("\nAttribute changes:\n");
            for change in detailed {
                let _ = writeln!(output, "   {}", change.address);
                for attr in &change.changes {
                    match &attr.old {
                        Some(old) => {
                            let _ = writeln!(output, "     {}: {old} -> {}", attr.attribute, attr.new);
                        }
                        None => {
                            let _ = writeln!(output, "     {}: {}", attr.attribute, attr.new);
                        }
                    }
                }
            }
        }

        for address in &plan.forgotten {
            let _ = writeln!(
                output,
                "\n{} {address} no longer exists and will be dropped from state",
                "⚠".yellow()
            );
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.destroy_count().to_string().red()
        );

        output
    }

    /// Formats the outcome of an apply.
    #[must_use]
    pub fn format_execution(&self, result: &ExecutionResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let rows: Vec<ResultRow> = result
                    .results
                    .iter()
                    .filter(|r| r.action.is_change() || r.status != ResourceStatus::Applied)
                    .map(|r| ResultRow {
                        resource: r.address.to_string(),
                        action: Self::format_action(r.action),
                        status: Self::format_status(r.status),
                        attempts: r.attempts,
                        error: r
                            .error
                            .as_deref()
                            .map(|e| Self::truncate(e, 60))
                            .unwrap_or_default(),
                    })
                    .collect();

                let mut output = String::new();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let status = if result.all_successful() {
                    format!("{} Apply complete", "✓".green())
                } else if result.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply incomplete", "✗".red())
                };
                let _ = writeln!(
                    output,
                    "\n{status}: {} applied, {} failed, {} skipped",
                    result.applied_count(),
                    result.failed_count(),
                    result.skipped_count()
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} resources in sync.\n",
                        "✓".green(),
                        report.in_sync
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for change in &report.drifted {
                    let _ = writeln!(
                        output,
                        "   {} {} ({})",
                        Self::format_action(change.action),
                        change.address,
                        change.reason
                    );
                }
                for address in &report.missing {
                    let _ = writeln!(output, "   {address} no longer exists");
                }
                let _ = write!(output, "\n{} resources in sync.\n", report.in_sync);
                output
            }
        }
    }

    /// Formats a state summary.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => state.to_json().unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(
                    output,
                    "   Config hash: {}",
                    &state.config_hash[..8.min(state.config_hash.len())]
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats the managed resources of a state.
    #[must_use]
    pub fn format_resources(&self, state: &DeploymentState) -> String {
        match self.format {
            OutputFormat::Json => {
                let records: Vec<_> = state.resources.values().collect();
                serde_json::to_string_pretty(&records).unwrap_or_default()
            }
            OutputFormat::Text => {
                if state.resources.is_empty() {
                    return "No managed resources.\n".to_string();
                }
                let rows: Vec<ResourceRow> = state
                    .resources
                    .values()
                    .map(|r| ResourceRow {
                        resource: r.address.to_string(),
                        id: r.provider_id.clone(),
                        depends_on: Self::join(r.dependencies.iter()),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a dependency graph in apply order.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph) -> String {
        let order = graph.apply_order();
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<_> = order
                    .iter()
                    .map(|&address| {
                        serde_json::json!({
                            "address": address,
                            "depends_on": graph.dependencies_of(address),
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&nodes).unwrap_or_default()
            }
            OutputFormat::Text => {
                if order.is_empty() {
                    return "No resources declared.\n".to_string();
                }
                let rows: Vec<GraphRow> = order
                    .iter()
                    .enumerate()
                    .map(|(i, &address)| GraphRow {
                        rank: i + 1,
                        resource: address.to_string(),
                        depends_on: Self::join(graph.dependencies_of(address).into_iter()),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a validation result with an optional warning list.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })
            .to_string(),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                } else if result.warning_count() > 0 {
                    let _ = writeln!(
                        output,
                        "{} warnings (use --warnings to show)",
                        result.warning_count()
                    );
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "Locked by {} for {} (id {}, expires in {}s)\n",
                lock.holder,
                lock.operation,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a change action with color.
    fn format_action(action: ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+create".green().to_string(),
            ChangeAction::Update => "~update".yellow().to_string(),
            ChangeAction::Destroy => "-destroy".red().to_string(),
            ChangeAction::NoOp => "no-op".dimmed().to_string(),
        }
    }

    /// Formats a resource status with color.
    fn format_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Applied => "applied".green().to_string(),
            ResourceStatus::Failed => "failed".red().to_string(),
            ResourceStatus::Skipped => "skipped".yellow().to_string(),
            ResourceStatus::Planned => "planned".dimmed().to_string(),
            ResourceStatus::Applying => "applying".dimmed().to_string(),
        }
    }

    fn join<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
        let joined: Vec<String> = items.map(|i| i.to_string()).collect();
        if joined.is_empty() {
            "-".to_string()
        } else {
            joined.join(", ")
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}
