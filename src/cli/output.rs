//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ConfigEntry;
use crate::manager::{Blueprint, Deployment, PurgeOutcome, SecretView, Snapshot};
use crate::restore::{RestoreReport, RestoreStatus};
use crate::update::{ActionType, DeploymentUpdate, DiffResult, UpdateState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Diff step row for table display.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Entity")]
    entity_type: String,
    #[tabled(rename = "Path")]
    entity_id: String,
}

/// Deployment row for table display.
#[derive(Tabled)]
struct DeploymentRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Blueprint")]
    blueprint_id: String,
    #[tabled(rename = "Nodes")]
    nodes: usize,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

/// Blueprint row for table display.
#[derive(Tabled)]
struct BlueprintRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Tenant")]
    tenant: String,
    #[tabled(rename = "Nodes")]
    nodes: usize,
    #[tabled(rename = "Created")]
    created_at: String,
}

/// Snapshot row for table display.
#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

/// Config entry row for table display.
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Editable")]
    editable: String,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a topology diff.
    #[must_use]
    pub fn format_diff(&self, diff: &DiffResult) -> String {
        match self.format {
            OutputFormat::Json => Self::json(diff),
            OutputFormat::Text => Self::format_diff_text(diff),
        }
    }

    fn format_diff_text(diff: &DiffResult) -> String {
        if diff.is_empty() {
            return format!("{} Topologies are identical.\n", "✓".green());
        }

        let mut output = String::from("\nSteps\n");
        let rows: Vec<StepRow> = diff
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| StepRow {
                index: i + 1,
                action: Self::format_action(step.action),
                entity_type: step.entity_type.to_string(),
                entity_id: Self::truncate(&step.entity_id, 60),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nDiff: {} to add, {} to modify, {} to remove\n",
            diff.count(ActionType::Add).to_string().green(),
            diff.count(ActionType::Modify).to_string().yellow(),
            diff.count(ActionType::Remove).to_string().red()
        );

        if !diff.modified_nodes.is_empty() {
            output.push_str("\nModified nodes:\n");
            for (node, modification) in &diff.modified_nodes {
                let _ = writeln!(output, "   {node}: {}", Self::json(modification).trim_matches('"'));
            }
        }

        output
    }

    /// Formats blueprints.
    #[must_use]
    pub fn format_blueprints(&self, blueprints: &[Blueprint]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(blueprints),
            OutputFormat::Text => {
                if blueprints.is_empty() {
                    return String::from("   No blueprints uploaded.\n");
                }
                let rows: Vec<BlueprintRow> = blueprints
                    .iter()
                    .map(|b| BlueprintRow {
                        id: b.id.clone(),
                        tenant: b.tenant.clone(),
                        nodes: b.topology.nodes.len(),
                        created_at: b.created_at.format(TIME_FORMAT).to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats deployments.
    #[must_use]
    pub fn format_deployments(&self, deployments: &[Deployment]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(deployments),
            OutputFormat::Text => {
                if deployments.is_empty() {
                    return String::from("   No deployments.\n");
                }
                let rows: Vec<DeploymentRow> = deployments
                    .iter()
                    .map(|d| DeploymentRow {
                        id: d.id.clone(),
                        blueprint_id: d.blueprint_id.clone(),
                        nodes: d.topology.nodes.len(),
                        updated_at: d.updated_at.format(TIME_FORMAT).to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a finished deployment update.
    #[must_use]
    pub fn format_update(&self, update: &DeploymentUpdate) -> String {
        match self.format {
            OutputFormat::Json => Self::json(update),
            OutputFormat::Text => {
                let status = match update.state {
                    UpdateState::Successful => format!("{} Update successful", "✓".green()),
                    UpdateState::Failed => format!("{} Update failed", "✗".red()),
                    other => format!("{} Update {other}", "…".yellow()),
                };
                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Update: {}", update.id);
                let _ = writeln!(output, "   Deployment: {}", update.deployment_id);
                let _ = writeln!(output, "   Blueprint: {}", update.blueprint_id);
                let _ = writeln!(output, "   Steps: {}", update.steps.len());
                if let Some(execution) = &update.execution_id {
                    let _ = writeln!(output, "   Execution: {execution}");
                }
                if let Some(error) = &update.error {
                    let _ = writeln!(output, "   Error: {error}");
                }
                output
            }
        }
    }

    /// Formats snapshots.
    #[must_use]
    pub fn format_snapshots(&self, snapshots: &[Snapshot]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(snapshots),
            OutputFormat::Text => {
                if snapshots.is_empty() {
                    return String::from("   No snapshots.\n");
                }
                let rows: Vec<SnapshotRow> = snapshots
                    .iter()
                    .map(|s| SnapshotRow {
                        id: s.id.clone(),
                        status: s.status.to_string(),
                        created_at: s.created_at.format(TIME_FORMAT).to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a restore report.
    #[must_use]
    pub fn format_restore(&self, report: &RestoreReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let status = if report.status.is_success() {
                    format!("{} Snapshot {} restored", "✓".green(), report.snapshot_id)
                } else {
                    format!("{} Restore of {} {}", "✗".red(), report.snapshot_id, report.status)
                };
                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Execution: {}", report.execution_id);
                if let Some(version) = &report.version {
                    let _ = writeln!(output, "   Snapshot version: {version}");
                }
                for (table, count) in &report.imported {
                    let _ = writeln!(output, "   {table}: {count}");
                }
                if !report.failed_plugins.is_empty() {
                    let _ = write!(output, "\n{} Skipped plugins:\n", "⚠".yellow());
                    for failure in &report.failed_plugins {
                        let _ = writeln!(output, "   - {}: {}", failure.plugin_id, failure.reason);
                    }
                }
                output
            }
        }
    }

    /// Formats the restore status.
    #[must_use]
    pub fn format_restore_status(&self, status: RestoreStatus) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({ "status": status })),
            OutputFormat::Text => format!("Restore status: {status}\n"),
        }
    }

    /// Formats the outcome of an event purge.
    #[must_use]
    pub fn format_purge(&self, outcome: &PurgeOutcome) -> String {
        match self.format {
            OutputFormat::Json => Self::json(outcome),
            OutputFormat::Text => {
                let mut output = format!("{} Deleted {} entries\n", "✓".green(), outcome.deleted);
                for path in &outcome.stored_to {
                    let _ = writeln!(output, "   Stored to {}", path.display());
                }
                output
            }
        }
    }

    /// Formats a secret. Hidden values are masked in text output.
    #[must_use]
    pub fn format_secret(&self, secret: &SecretView) -> String {
        match self.format {
            OutputFormat::Json => Self::json(secret),
            OutputFormat::Text => {
                let value = if secret.is_hidden_value {
                    "********".dimmed().to_string()
                } else {
                    secret.value.clone()
                };
                format!("{}: {value}\n", secret.key)
            }
        }
    }

    /// Formats a list of names.
    #[must_use]
    pub fn format_names(&self, names: &[String]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(names),
            OutputFormat::Text => names.iter().fold(String::new(), |mut out, name| {
                let _ = writeln!(out, "{name}");
                out
            }),
        }
    }

    /// Formats the public settings and the stored entries.
    #[must_use]
    pub fn format_config(
        &self,
        settings: &BTreeMap<String, Value>,
        entries: &[ConfigEntry],
    ) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "settings": settings,
                "entries": entries,
            })),
            OutputFormat::Text => {
                let mut output = String::from("\nSettings\n");
                for (name, value) in settings {
                    let _ = writeln!(output, "   {name} = {value}");
                }
                if !entries.is_empty() {
                    output.push_str("\nStored entries\n");
                    let rows: Vec<EntryRow> = entries
                        .iter()
                        .map(|e| EntryRow {
                            scope: e.scope.clone(),
                            name: e.name.clone(),
                            value: Self::truncate(&e.value.to_string(), 40),
                            editable: if e.is_editable { "yes" } else { "no" }.to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats any serializable value; text output falls back to JSON.
    #[must_use]
    pub fn format_value<T: Serialize>(&self, value: &T) -> String {
        Self::json(value)
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                Self::json(&serde_json::json!({ "status": "success", "message": message }))
            }
            OutputFormat::Text => format!("{} {message}", "✓".green()),
        }
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                Self::json(&serde_json::json!({ "status": "error", "message": message }))
            }
            OutputFormat::Text => format!("{} {message}", "✗".red()),
        }
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                Self::json(&serde_json::json!({ "status": "warning", "message": message }))
            }
            OutputFormat::Text => format!("{} {message}", "⚠".yellow()),
        }
    }

    fn format_action(action: ActionType) -> String {
        match action {
            ActionType::Add => "+add".green().to_string(),
            ActionType::Modify => "~modify".yellow().to_string(),
            ActionType::Remove => "-remove".red().to_string(),
        }
    }

    /// Truncates a string to at most `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
