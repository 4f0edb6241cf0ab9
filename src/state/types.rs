//! Persisted record of what has been applied.
//!
//! The planner never looks at live infrastructure: this snapshot is the
//! only `previous state` it diffs against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, StateError};
use crate::graph::EdgeKind;
use crate::hooks::LifecycleHook;
use crate::model::{RemovalPolicy, ResolvedProperties, ResourceNode};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete deployment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied descriptor.
    pub descriptor_hash: String,
    /// Applied stacks by name.
    #[serde(default)]
    pub stacks: BTreeMap<String, StackState>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Deployment history (recent entries).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// Applied record of one stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    /// Applied nodes, in the order they settled.
    #[serde(default)]
    pub resources: Vec<AppliedResource>,
    /// Stack outputs published after the last complete deployment.
    #[serde(default)]
    pub outputs: ResolvedProperties,
    /// True once every node settled and outputs were published.
    #[serde(default)]
    pub completed: bool,
    /// When the stack record last changed.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Applied record of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedResource {
    /// Logical id.
    pub logical_id: String,
    /// Resource kind.
    pub kind: String,
    /// Resolved properties as sent to the provider.
    pub properties: ResolvedProperties,
    /// Hash of `properties`.
    pub properties_hash: String,
    /// Outputs returned by the provider or hook.
    #[serde(default)]
    pub outputs: ResolvedProperties,
    /// Removal policy at apply time.
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
    /// Dependencies at apply time.
    #[serde(default)]
    pub depends_on: Vec<RecordedDependency>,
    /// Hook definition, kept so the node can be deleted once undeclared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<LifecycleHook>,
    /// True for hook-bearing nodes.
    #[serde(default)]
    pub is_hook: bool,
    /// Set once the cleanup hook guarding this node succeeded.
    #[serde(default)]
    pub cleanup_succeeded: bool,
    /// Set when the provider created the node but its create hook failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hook_pending: bool,
    /// When the node last settled.
    pub applied_at: DateTime<Utc>,
}

/// Dependency as recorded in state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDependency {
    /// Logical id depended upon.
    pub logical_id: String,
    /// Edge origin.
    pub kind: EdgeKind,
}

impl RecordedDependency {
    /// Dependencies of a declared node: referenced nodes first, then
    /// explicit edges not already implied by a reference.
    #[must_use]
    pub fn of(node: &ResourceNode) -> Vec<Self> {
        let mut out: Vec<Self> = Vec::new();
        let implicit = node.referenced_nodes().into_iter().map(|id| (id, EdgeKind::Implicit));
        let explicit = node.depends_on.iter().map(|id| (id.as_str(), EdgeKind::Explicit));
        for (id, kind) in implicit.chain(explicit) {
            if !out.iter().any(|d| d.logical_id == id) {
                out.push(Self {
                    logical_id: id.to_string(),
                    kind,
                });
            }
        }
        out
    }
}

impl AppliedResource {
    /// What differs between this record and `node` outside of properties,
    /// or `None` if the record still describes it.
    #[must_use]
    pub fn metadata_change(&self, node: &ResourceNode) -> Option<&'static str> {
        if self.removal_policy != node.removal_policy {
            Some("removal policy changed")
        } else if !same_dependencies(&self.depends_on, &RecordedDependency::of(node)) {
            Some("dependencies changed")
        } else if self.hook != node.hook {
            Some("hook changed")
        } else {
            None
        }
    }

    /// Rewrites the metadata from `node`, keeping properties and outputs.
    pub fn refresh_metadata(&mut self, node: &ResourceNode) {
        self.removal_policy = node.removal_policy;
        self.depends_on = RecordedDependency::of(node);
        self.hook = node.hook.clone();
        self.is_hook = node.is_hook();
        if node.removal_policy != RemovalPolicy::RetainUntilExplicitDelete {
            self.cleanup_succeeded = false;
        }
        self.applied_at = Utc::now();
    }
}

fn same_dependencies(a: &[RecordedDependency], b: &[RecordedDependency]) -> bool {
    a.len() == b.len() && a.iter().all(|d| b.contains(d))
}

/// A single entry in the deployment history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the deployment occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Stack affected.
    pub stack: String,
    /// Descriptor hash at time of deployment.
    pub descriptor_hash: String,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether the deployment succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of deployment operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// Up plan.
    Apply,
    /// Down plan.
    Destroy,
}

impl DeploymentState {
    /// Creates a new empty deployment state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            descriptor_hash: String::new(),
            stacks: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a stack record.
    #[must_use]
    pub fn stack(&self, name: &str) -> Option<&StackState> {
        self.stacks.get(name)
    }

    /// Replaces a stack record.
    pub fn set_stack(&mut self, name: &str, stack: StackState) {
        self.stacks.insert(name.to_string(), stack);
        self.last_updated = Utc::now();
    }

    /// Removes a stack record.
    pub fn remove_stack(&mut self, name: &str) -> Option<StackState> {
        let result = self.stacks.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Stacks whose last deployment completed.
    pub fn completed_stacks(&self) -> impl Iterator<Item = (&str, &StackState)> {
        self.stacks
            .iter()
            .filter(|(_, s)| s.completed)
            .map(|(name, s)| (name.as_str(), s))
    }

    /// Total number of applied nodes across stacks.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.stacks.values().map(|s| s.resources.len()).sum()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

/// Parses a serialized state, rejecting unknown format versions.
///
/// # Errors
///
/// Returns `StateError::Corrupted` or `StateError::VersionMismatch`.
pub fn decode_state(content: &str) -> Result<DeploymentState> {
    let state: DeploymentState = serde_json::from_str(content).map_err(|e| StateError::Corrupted {
        message: format!("Failed to parse state: {e}"),
    })?;
    if state.version != STATE_VERSION {
        return Err(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: state.version,
        }
        .into());
    }
    Ok(state)
}

/// Serializes a state for storage.
///
/// # Errors
///
/// Returns `StateError::SerializationError`.
pub fn encode_state(state: &DeploymentState) -> Result<String> {
    serde_json::to_string_pretty(state)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
}

impl StackState {
    /// Gets a node record.
    #[must_use]
    pub fn resource(&self, logical_id: &str) -> Option<&AppliedResource> {
        self.resources.iter().find(|r| r.logical_id == logical_id)
    }

    /// Gets a mutable node record.
    pub fn resource_mut(&mut self, logical_id: &str) -> Option<&mut AppliedResource> {
        self.resources.iter_mut().find(|r| r.logical_id == logical_id)
    }

    /// Inserts or replaces a node record. New nodes are appended so the
    /// vector keeps settle order.
    pub fn upsert(&mut self, resource: AppliedResource) {
        match self.resource_mut(&resource.logical_id) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
        self.updated_at = Some(Utc::now());
    }

    /// Drops a node record.
    pub fn remove(&mut self, logical_id: &str) -> Option<AppliedResource> {
        let pos = self.resources.iter().position(|r| r.logical_id == logical_id)?;
        self.updated_at = Some(Utc::now());
        Some(self.resources.remove(pos))
    }

    /// True if the node is recorded.
    #[must_use]
    pub fn contains(&self, logical_id: &str) -> bool {
        self.resource(logical_id).is_some()
    }

    /// Recorded logical ids.
    #[must_use]
    pub fn logical_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.logical_id.as_str()).collect()
    }

    /// True if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl DeploymentHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(
        operation: DeploymentOperation,
        stack: &str,
        descriptor_hash: &str,
        resources: Vec<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            stack: stack.to_string(),
            descriptor_hash: descriptor_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Marks the entry as failed.
    #[must_use]
    pub fn failed(mut self, error: &str) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> AppliedResource {
        AppliedResource {
            logical_id: id.to_string(),
            kind: "s3-bucket".to_string(),
            properties: ResolvedProperties::new(),
            properties_hash: "h".to_string(),
            outputs: ResolvedProperties::new(),
            removal_policy: RemovalPolicy::Destroy,
            depends_on: Vec::new(),
            hook: None,
            is_hook: false,
            cleanup_succeeded: false,
            hook_pending: false,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_keeps_position() {
        let mut stack = StackState::default();
        stack.upsert(record("A"));
        stack.upsert(record("B"));
        let mut updated = record("A");
        updated.properties_hash = "h2".to_string();
        stack.upsert(updated);

        assert_eq!(stack.logical_ids(), vec!["A", "B"]);
        assert_eq!(stack.resource("A").unwrap().properties_hash, "h2");
        assert!(stack.remove("A").is_some());
        assert!(!stack.contains("A"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = DeploymentState::new("nlq", "dev");
        for i in 0..105 {
            state.add_history(DeploymentHistoryEntry::new(
                DeploymentOperation::Apply,
                "AuthStack",
                &format!("hash-{i}"),
                Vec::new(),
            ));
        }
        assert_eq!(state.history.len(), 100);
        assert_eq!(state.history[0].descriptor_hash, "hash-5");
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let mut state = DeploymentState::new("nlq", "dev");
        let encoded = encode_state(&state).unwrap();
        assert_eq!(decode_state(&encoded).unwrap().project, "nlq");

        state.version = "0.1".to_string();
        let encoded = encode_state(&state).unwrap();
        assert!(decode_state(&encoded).is_err());
        assert!(decode_state("{not json").is_err());
    }

    #[test]
    fn test_completed_stacks() {
        let mut state = DeploymentState::new("nlq", "dev");
        state.set_stack(
            "AuthStack",
            StackState {
                completed: true,
                ..StackState::default()
            },
        );
        state.set_stack("DataStack", StackState::default());

        let done: Vec<_> = state.completed_stacks().map(|(n, _)| n).collect();
        assert_eq!(done, vec!["AuthStack"]);
    }

    #[test]
    fn test_refresh_metadata_keeps_outputs() {
        let mut applied = record("Workgroup");
        applied.outputs.insert("name".into(), serde_json::json!("wg-1"));
        applied.cleanup_succeeded = true;

        let mut node = ResourceNode::new(
            "s3-bucket",
            "Workgroup",
            BTreeMap::new(),
            RemovalPolicy::RetainUntilExplicitDelete,
        );
        assert_eq!(applied.metadata_change(&node), Some("removal policy changed"));
        node.removal_policy = RemovalPolicy::Destroy;
        node.depends_on.push("WorkgroupCleanup".into());
        assert_eq!(applied.metadata_change(&node), Some("dependencies changed"));

        applied.refresh_metadata(&node);
        assert_eq!(applied.metadata_change(&node), None);
        assert_eq!(applied.depends_on[0].kind, EdgeKind::Explicit);
        assert_eq!(applied.outputs["name"], serde_json::json!("wg-1"));
        assert_eq!(applied.properties_hash, "h");
        assert!(!applied.cleanup_succeeded);
    }
}
