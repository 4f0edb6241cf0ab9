//! Deployment reports.
//!
//! A report lists, per stack and in plan order, what happened to every
//! node. Partial failures show which nodes succeeded, which failed and
//! which were never attempted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::planner::{Direction, Operation};

/// What happened to one planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum Outcome {
    /// The operation ran and succeeded.
    Succeeded,
    /// Nothing had to change.
    Unchanged,
    /// The operation failed.
    Failed(String),
    /// A failure or cancellation stopped the run first.
    NotAttempted,
    /// The node was kept at the provider and dropped from state.
    Retained,
}

impl Outcome {
    /// True for outcomes that leave the node settled.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Unchanged | Self::Retained)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed(message) => write!(f, "failed: {message}"),
            Self::NotAttempted => write!(f, "not attempted"),
            Self::Retained => write!(f, "retained"),
        }
    }
}

/// One line of a stack report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    /// Node logical id.
    pub logical_id: String,
    /// Node kind.
    pub kind: String,
    /// Planned operation.
    pub operation: Operation,
    /// Result.
    pub outcome: Outcome,
    /// Wall time spent on the node.
    pub duration_ms: u64,
    /// Provider or hook calls made.
    pub attempts: u32,
}

/// Result of running one stack plan.
#[derive(Debug, Clone, Serialize)]
pub struct StackReport {
    /// Stack name.
    pub stack: String,
    /// Plan direction.
    pub direction: Direction,
    /// Entries in plan order, retained nodes last.
    pub entries: Vec<ReportEntry>,
    /// True if a cancel request stopped dispatching.
    pub cancelled: bool,
    /// Plan-time or fatal error that prevented execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StackReport {
    /// Empty report for a stack.
    #[must_use]
    pub fn new(stack: &str, direction: Direction) -> Self {
        Self {
            stack: stack.to_string(),
            direction,
            entries: Vec::new(),
            cancelled: false,
            error: None,
        }
    }

    /// Report for a stack that failed before any operation ran.
    #[must_use]
    pub fn failed(stack: &str, direction: Direction, error: impl fmt::Display) -> Self {
        let mut report = Self::new(stack, direction);
        report.error = Some(error.to_string());
        report
    }

    /// True if any entry failed or the stack could not be planned.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.error.is_some() || self.entries.iter().any(|e| matches!(e.outcome, Outcome::Failed(_)))
    }

    /// True if every entry settled and nothing stopped the run.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.error.is_none() && self.entries.iter().all(|e| e.outcome.is_settled())
    }

    /// Looks up the entry of a node.
    #[must_use]
    pub fn entry(&self, logical_id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.logical_id == logical_id)
    }

    /// Logical ids whose outcome matches `predicate`.
    pub fn ids_where(&self, predicate: impl Fn(&Outcome) -> bool) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| predicate(&e.outcome))
            .map(|e| e.logical_id.as_str())
            .collect()
    }
}

/// Result of a whole session.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    /// Per-stack reports, in execution order.
    pub stacks: Vec<StackReport>,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end.
    pub finished_at: DateTime<Utc>,
}

impl Default for DeploymentReport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentReport {
    /// Starts a report now.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            stacks: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Stamps the end time.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Looks up a stack report.
    #[must_use]
    pub fn stack(&self, name: &str) -> Option<&StackReport> {
        self.stacks.iter().find(|s| s.stack == name)
    }

    /// True if any stack failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.stacks.iter().any(StackReport::has_failures)
    }

    /// Process exit status: non-zero on any failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(self.has_failures())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, outcome: Outcome) -> ReportEntry {
        ReportEntry {
            logical_id: id.to_string(),
            kind: "generic".to_string(),
            operation: Operation::Create,
            outcome,
            duration_ms: 0,
            attempts: 1,
        }
    }

    #[test]
    fn test_exit_code_follows_failures() {
        let mut report = DeploymentReport::new();
        let mut auth = StackReport::new("AuthStack", Direction::Up);
        auth.entries.push(entry("UserPool", Outcome::Succeeded));
        report.stacks.push(auth);
        assert_eq!(report.exit_code(), 0);

        let mut data = StackReport::new("DataStack", Direction::Up);
        data.entries.push(entry("CrawlerTrigger", Outcome::Failed("denied".into())));
        data.entries.push(entry("Workgroup", Outcome::NotAttempted));
        report.stacks.push(data);
        assert_eq!(report.exit_code(), 1);

        let data = report.stack("DataStack").unwrap();
        assert!(!data.is_complete());
        assert_eq!(data.ids_where(|o| *o == Outcome::NotAttempted), vec!["Workgroup"]);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(entry("Table", Outcome::Failed("boom".into()))).unwrap();
        assert_eq!(json["logicalId"], "Table");
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["message"], "boom");
        assert_eq!(json["durationMs"], 0);
    }
}
