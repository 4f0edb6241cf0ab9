//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::model::ResolvedProperties;
use crate::planner::{DeploymentPlan, Operation, StackOrder};
use crate::report::{DeploymentReport, Outcome};
use crate::state::DeploymentState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Report entry row for table display.
#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// Stack output row for table display.
#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Output")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats plans for display.
    #[must_use]
    pub fn format_plans(&self, plans: &[DeploymentPlan], detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plans).unwrap_or_default(),
            OutputFormat::Text => Self::format_plans_text(plans, detailed),
        }
    }

    fn format_plans_text(plans: &[DeploymentPlan], detailed: bool) -> String {
        if plans.iter().all(DeploymentPlan::is_noop) {
            return format!(
                "{} No changes required - stacks are up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let (mut creates, mut updates, mut deletes) = (0, 0, 0);

        for plan in plans {
            creates += plan.count(Operation::Create);
            updates += plan.count(Operation::Update);
            deletes += plan.count(Operation::Delete);

            if plan.is_noop() {
                let _ = writeln!(output, "\n{} {}: no changes", "✓".green(), plan.stack.bold());
                continue;
            }

            let _ = writeln!(output, "\n{} ({})", plan.stack.bold(), plan.direction);
            let rows: Vec<PlanRow> = plan
                .operations
                .iter()
                .enumerate()
                .map(|(i, op)| PlanRow {
                    index: i + 1,
                    action: Self::format_operation(op.operation),
                    resource: op.logical_id.clone(),
                    kind: op.kind.clone(),
                    reason: Self::truncate(&op.reason, 40),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');

            if detailed {
                for op in &plan.operations {
                    if !op.predecessors.is_empty() {
                        let _ = writeln!(
                            output,
                            "   {} after {}",
                            op.logical_id,
                            op.predecessors.join(", ")
                        );
                    }
                    if let Some(gate) = &op.gate {
                        let _ = writeln!(
                            output,
                            "   {} deleted only if {gate} succeeds",
                            op.logical_id
                        );
                    }
                }
            }

            if !plan.retained.is_empty() {
                let _ = writeln!(
                    output,
                    "   {} retained, dropped from state: {}",
                    "⚠".yellow(),
                    plan.retained.join(", ")
                );
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete\n",
            creates.to_string().green(),
            updates.to_string().yellow(),
            deletes.to_string().red()
        );
        output
    }

    /// Formats a deployment report.
    #[must_use]
    pub fn format_report(&self, report: &DeploymentReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &DeploymentReport) -> String {
        let mut output = String::new();

        for stack in &report.stacks {
            let marker = if stack.has_failures() || stack.cancelled {
                "✗".red()
            } else {
                "✓".green()
            };
            let _ = writeln!(output, "\n{marker} {} ({})", stack.stack.bold(), stack.direction);

            if !stack.entries.is_empty() {
                let rows: Vec<ReportRow> = stack
                    .entries
                    .iter()
                    .map(|e| ReportRow {
                        resource: e.logical_id.clone(),
                        operation: e.operation.to_string(),
                        outcome: Self::format_outcome(&e.outcome),
                        duration: format!("{}ms", e.duration_ms),
                        attempts: e.attempts,
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
            }
            if let Some(error) = &stack.error {
                let _ = writeln!(output, "   {}", error.red());
            }
        }

        let elapsed = report.finished_at - report.started_at;
        let summary = if report.has_failures() {
            format!("{} Deployment finished with failures", "✗".red())
        } else {
            format!("{} Deployment complete", "✓".green())
        };
        let _ = writeln!(
            output,
            "\n{summary} ({}s)",
            elapsed.num_milliseconds() as f64 / 1000.0
        );
        output
    }

    /// Formats stack waves and the node order of each stack.
    #[must_use]
    pub fn format_graph(&self, order: &StackOrder, stacks: &[(String, Vec<String>)]) -> String {
        match self.format {
            OutputFormat::Json => {
                let nodes: BTreeMap<&str, &[String]> = stacks
                    .iter()
                    .map(|(name, ids)| (name.as_str(), ids.as_slice()))
                    .collect();
                let json = serde_json::json!({ "waves": order.waves, "stacks": nodes });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for (i, wave) in order.waves.iter().enumerate() {
                    let _ = writeln!(output, "Wave {}: {}", i + 1, wave.join(", ").bold());
                    for name in wave {
                        if let Some((_, ids)) = stacks.iter().find(|(n, _)| n == name) {
                            let _ = writeln!(output, "   {name}: {}", ids.join(" -> "));
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats published stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, ResolvedProperties>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => {
                let rows: Vec<OutputRow> = outputs
                    .iter()
                    .flat_map(|(stack, values)| {
                        values.iter().map(move |(name, value)| OutputRow {
                            stack: stack.clone(),
                            name: name.clone(),
                            value: Self::format_value(value),
                        })
                    })
                    .collect();
                if rows.is_empty() {
                    return String::from("No outputs published.\n");
                }
                format!("{}\n", Table::new(rows))
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

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);

                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Descriptor hash: {}",
                    &state.descriptor_hash[..8.min(state.descriptor_hash.len())]
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resource_count());

                for (name, stack) in &state.stacks {
                    let status = if stack.completed {
                        "complete".green()
                    } else {
                        "incomplete".yellow()
                    };
                    let _ = writeln!(
                        output,
                        "     {name}: {} resources, {status}",
                        stack.resources.len()
                    );
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.stack,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats an operation with color.
    fn format_operation(operation: Operation) -> String {
        match operation {
            Operation::Create => "+create".green().to_string(),
            Operation::Update => "~update".yellow().to_string(),
            Operation::Delete => "-delete".red().to_string(),
            Operation::NoOp => "no-op".dimmed().to_string(),
        }
    }

    /// Formats an outcome with color.
    fn format_outcome(outcome: &Outcome) -> String {
        match outcome {
            Outcome::Succeeded => "succeeded".green().to_string(),
            Outcome::Unchanged => "unchanged".dimmed().to_string(),
            Outcome::Failed(message) => format!("failed: {}", Self::truncate(message, 60)).red().to_string(),
            Outcome::NotAttempted => "not attempted".yellow().to_string(),
            Outcome::Retained => "retained".cyan().to_string(),
        }
    }

    /// Renders strings bare and everything else as JSON.
    fn format_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
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

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, marker: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Direction;
    use crate::report::{ReportEntry, StackReport};
    use serde_json::json;

    fn report() -> DeploymentReport {
        let mut stack = StackReport::new("DataStack", Direction::Up);
        stack.entries.push(ReportEntry {
            logical_id: "ChatHistory".into(),
            kind: "nosql.table".into(),
            operation: Operation::Create,
            outcome: Outcome::Succeeded,
            duration_ms: 12,
            attempts: 1,
        });
        let mut report = DeploymentReport::new();
        report.stacks.push(stack);
        report.finish();
        report
    }

    #[test]
    fn test_report_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let value: Value = serde_json::from_str(&formatter.format_report(&report())).unwrap();
        assert_eq!(value["stacks"][0]["stack"], "DataStack");
        assert_eq!(value["stacks"][0]["entries"][0]["logicalId"], "ChatHistory");
        assert_eq!(value["stacks"][0]["entries"][0]["outcome"]["status"], "succeeded");
    }

    #[test]
    fn test_report_text_lists_entries() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_report(&report());
        assert!(text.contains("ChatHistory"));
        assert!(text.contains("succeeded"));
        assert!(text.contains("Deployment complete"));
    }

    #[test]
    fn test_outputs_table() {
        colored::control::set_override(false);
        let outputs = BTreeMap::from([(
            "AuthStack".to_string(),
            ResolvedProperties::from([("userPoolId".to_string(), json!("pool-1"))]),
        )]);
        let text = OutputFormatter::new(OutputFormat::Text).format_outputs(&outputs);
        assert!(text.contains("userPoolId"));
        assert!(text.contains("pool-1"));
        assert!(!text.contains("\"pool-1\""));

        let empty = OutputFormatter::new(OutputFormat::Text).format_outputs(&BTreeMap::new());
        assert_eq!(empty, "No outputs published.\n");
    }

    #[test]
    fn test_messages() {
        let json = OutputFormatter::new(OutputFormat::Json).warning("retained");
        assert_eq!(json, r#"{"message":"retained","status":"warning"}"#);
        assert_eq!(OutputFormatter::truncate("abcdefgh", 6), "abc...");
    }
}
