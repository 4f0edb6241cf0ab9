//! Deployment plan types and construction.
//!
//! The planner diffs a stack's dependency graph against its previous
//! record and emits operations in dependency order: ancestors first when
//! going up, descendants first when going down.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::ValueBroker;
use crate::config::ConfigHasher;
use crate::error::{ConfigError, GraphError, ModelError, Result};
use crate::graph::{DependencyGraph, EdgeKind, build_graph};
use crate::model::{
    OutputRef, Reference, RemovalPolicy, ResolvedProperties, Stack, ValueSource,
    resolve_properties,
};
use crate::state::StackState;

/// Plan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Create and update, ancestors first.
    Up,
    /// Delete, descendants first.
    Down,
}

/// Operation planned for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Node has no previous record.
    Create,
    /// Node changed, or its inputs are only known at apply time.
    Update,
    /// Node is removed.
    Delete,
    /// Node is unchanged.
    NoOp,
}

/// How cross-stack imports that are not available yet are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    /// Unavailable imports are errors.
    #[default]
    Strict,
    /// Unavailable imports are unknown values, for previews.
    Preview,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedOperation {
    /// Node logical id.
    pub logical_id: String,
    /// Node kind.
    pub kind: String,
    /// What to do.
    pub operation: Operation,
    /// Why.
    pub reason: String,
    /// Operations of this plan that must succeed first.
    pub predecessors: Vec<String>,
    /// Cleanup hook whose success in this run is required first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    /// Removal policy.
    pub removal_policy: RemovalPolicy,
    /// True for hook-bearing nodes.
    pub is_hook: bool,
    /// Properties known at plan time.
    #[serde(skip)]
    pub resolved: Option<ResolvedProperties>,
    /// Hash of `resolved`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// A complete plan for one stack.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    /// Stack name.
    pub stack: String,
    /// Direction.
    pub direction: Direction,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Operations in execution order.
    pub operations: Vec<PlannedOperation>,
    /// Removed nodes kept at the provider and dropped from state.
    pub retained: Vec<String>,
}

impl DeploymentPlan {
    fn new(stack: &str, direction: Direction) -> Self {
        Self {
            stack: stack.to_string(),
            direction,
            created_at: Utc::now(),
            operations: Vec::new(),
            retained: Vec::new(),
        }
    }

    /// True if applying the plan changes nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.retained.is_empty()
            && self
                .operations
                .iter()
                .all(|op| op.operation == Operation::NoOp)
    }

    /// Number of operations of a given type.
    #[must_use]
    pub fn count(&self, operation: Operation) -> usize {
        self.operations
            .iter()
            .filter(|op| op.operation == operation)
            .count()
    }

    /// Looks up the operation planned for a node.
    #[must_use]
    pub fn operation(&self, logical_id: &str) -> Option<&PlannedOperation> {
        self.operations.iter().find(|op| op.logical_id == logical_id)
    }

    /// Logical ids in execution order.
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.logical_id.as_str()).collect()
    }
}

/// Reads an attribute from recorded outputs.
pub(crate) fn read_attribute(outputs: &ResolvedProperties, reference: &Reference) -> Result<Value> {
    outputs.get(&reference.attribute).cloned().ok_or_else(|| {
        ConfigError::invalid_reference(
            reference.to_string(),
            format!("'{}' has no attribute '{}'", reference.node, reference.attribute),
        )
        .into()
    })
}

struct PlanSource<'a> {
    previous: &'a StackState,
    pending: &'a HashSet<String>,
    broker: &'a ValueBroker,
    imports: ImportMode,
}

impl ValueSource for PlanSource<'_> {
    fn node_attribute(&self, reference: &Reference) -> Result<Option<Value>> {
        if self.pending.contains(&reference.node) {
            return Ok(None);
        }
        match self.previous.resource(&reference.node) {
            Some(record) => read_attribute(&record.outputs, reference).map(Some),
            None => Ok(None),
        }
    }

    fn stack_output(&self, output: &OutputRef) -> Result<Option<Value>> {
        match self.broker.resolve(&output.stack, &output.output) {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.imports == ImportMode::Preview => {
                debug!(import = %output, error = %e, "Import unknown at plan time");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds deployment plans.
#[derive(Debug)]
pub struct Planner<'a> {
    broker: &'a ValueBroker,
    hasher: ConfigHasher,
    imports: ImportMode,
}

impl<'a> Planner<'a> {
    /// Creates a planner resolving imports through `broker`.
    #[must_use]
    pub const fn new(broker: &'a ValueBroker) -> Self {
        Self {
            broker,
            hasher: ConfigHasher::new(),
            imports: ImportMode::Strict,
        }
    }

    /// Sets how unavailable imports are treated.
    #[must_use]
    pub const fn with_import_mode(mut self, imports: ImportMode) -> Self {
        self.imports = imports;
        self
    }

    /// Plans one direction over `graph`.
    ///
    /// Going up, `graph` is the graph of `desired`. Going down, it is the
    /// graph of `previous` and every node `desired` no longer declares is
    /// removed.
    ///
    /// # Errors
    ///
    /// `GraphError::UnreachableNode` if a desired node depends on a node
    /// absent from both desired and previous state, and resolution errors
    /// for malformed references or unavailable imports.
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        previous: &StackState,
        desired: &Stack,
        direction: Direction,
    ) -> Result<DeploymentPlan> {
        let mut plan = DeploymentPlan::new(graph.stack(), direction);
        match direction {
            Direction::Up => plan.operations = self.plan_up(graph, previous, desired)?,
            Direction::Down => {
                let (operations, retained) = plan_down(graph, previous, desired);
                plan.operations = operations;
                plan.retained = retained;
            }
        }
        debug!(
            stack = %plan.stack,
            direction = ?direction,
            operations = plan.operations.len(),
            "Plan built"
        );
        Ok(plan)
    }

    /// Plans an apply: the up plan of `desired` followed by the teardown of
    /// nodes only `previous` knows.
    ///
    /// # Errors
    ///
    /// See [`Planner::plan`], plus `GraphError::CycleDetected`.
    pub fn plan_apply(&self, desired: &Stack, previous: &StackState) -> Result<DeploymentPlan> {
        let graph = build_graph(desired)?;
        let mut plan = self.plan(&graph, previous, desired, Direction::Up)?;

        let has_orphans = previous
            .resources
            .iter()
            .any(|r| desired.node(&r.logical_id).is_none());
        if has_orphans {
            let recorded = DependencyGraph::from_state(desired.name(), previous)?;
            let teardown = self.plan(&recorded, previous, desired, Direction::Down)?;
            for mut op in teardown.operations {
                // Desired nodes still reading an orphan settle before it goes.
                for edge in graph.dangling().iter().filter(|e| e.from == op.logical_id) {
                    if !op.predecessors.contains(&edge.to) {
                        op.predecessors.push(edge.to.clone());
                    }
                }
                plan.operations.push(op);
            }
            plan.retained = teardown.retained;
        }
        Ok(plan)
    }

    /// Plans the removal of every recorded node of a stack.
    ///
    /// # Errors
    ///
    /// `GraphError::CycleDetected` if the record is corrupt.
    pub fn plan_destroy(&self, stack: &str, previous: &StackState) -> Result<DeploymentPlan> {
        let recorded = DependencyGraph::from_state(stack, previous)?;
        self.plan(&recorded, previous, &Stack::new(stack), Direction::Down)
    }

    fn plan_up(
        &self,
        graph: &DependencyGraph,
        previous: &StackState,
        desired: &Stack,
    ) -> Result<Vec<PlannedOperation>> {
        for edge in graph.dangling() {
            if !previous.contains(&edge.from) {
                return Err(GraphError::UnreachableNode {
                    stack: graph.stack().to_string(),
                    logical_id: edge.to.clone(),
                    missing: edge.from.clone(),
                }
                .into());
            }
        }

        let mut pending: HashSet<String> = HashSet::new();
        let mut operations = Vec::with_capacity(graph.len());

        for id in graph.topological_order() {
            let node = desired.node(id).ok_or_else(|| ModelError::UnknownNode {
                stack: graph.stack().to_string(),
                logical_id: id.to_string(),
            })?;

            let source = PlanSource {
                previous,
                pending: &pending,
                broker: self.broker,
                imports: self.imports,
            };
            let resolved = resolve_properties(&node.properties, &source)?;
            let hash = resolved.as_ref().map(|p| self.hasher.hash_properties(p));

            // Metadata-only updates leave outputs as recorded.
            let mut outputs_change = true;
            let (operation, reason) = match (previous.resource(id), hash.as_deref()) {
                (None, _) => (Operation::Create, "not yet applied"),
                (Some(record), _) if record.hook_pending => (Operation::Create, "create hook did not complete"),
                (Some(record), _) if record.kind != node.kind => (Operation::Update, "kind changed"),
                (Some(record), Some(h)) if ConfigHasher::hashes_match(h, &record.properties_hash) => {
                    outputs_change = false;
                    record
                        .metadata_change(node)
                        .map_or((Operation::NoOp, "unchanged"), |change| (Operation::Update, change))
                }
                (Some(_), Some(_)) => (Operation::Update, "properties changed"),
                (Some(_), None) => (Operation::Update, "inputs resolved at apply time"),
            };
            if outputs_change && operation != Operation::NoOp {
                pending.insert(id.to_string());
            }

            operations.push(PlannedOperation {
                logical_id: id.to_string(),
                kind: node.kind.clone(),
                operation,
                reason: reason.to_string(),
                predecessors: graph.dependencies(id).into_iter().map(str::to_string).collect(),
                gate: None,
                removal_policy: node.removal_policy,
                is_hook: node.is_hook(),
                resolved,
                hash,
            });
        }

        Ok(operations)
    }
}

/// Hook node with an explicit edge to `id` that is itself being deleted.
fn cleanup_hook<'g>(
    graph: &'g DependencyGraph,
    id: &str,
    removed: &HashSet<&'g str>,
) -> Option<&'g str> {
    graph.incoming_edges(id).into_iter().find_map(|edge| {
        let eligible = edge.kind == EdgeKind::Explicit
            && graph
                .node(&edge.from)
                .is_some_and(|n| n.is_hook && n.removal_policy == RemovalPolicy::Destroy);
        if eligible {
            removed.get(edge.from.as_str()).copied()
        } else {
            None
        }
    })
}

fn plan_down(
    graph: &DependencyGraph,
    previous: &StackState,
    desired: &Stack,
) -> (Vec<PlannedOperation>, Vec<String>) {
    let removed: Vec<&str> = graph
        .topological_order()
        .into_iter()
        .rev()
        .filter(|id| desired.node(id).is_none())
        .collect();
    let removed_set: HashSet<&str> = removed.iter().copied().collect();

    let mut retained = Vec::new();
    let mut held: HashSet<&str> = HashSet::new();
    let mut gated: HashMap<&str, Vec<&str>> = HashMap::new();

    for &id in &removed {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let cleaned = previous.resource(id).is_some_and(|r| r.cleanup_succeeded);
        match node.removal_policy {
            RemovalPolicy::Retain => {
                retained.push(id.to_string());
                held.insert(id);
            }
            RemovalPolicy::RetainUntilExplicitDelete if !cleaned => {
                held.insert(id);
                match cleanup_hook(graph, id, &removed_set) {
                    Some(hook) => gated.entry(hook).or_default().push(id),
                    None => {
                        warn!(stack = %graph.stack(), logical_id = id, "No cleanup hook scheduled, retaining");
                        retained.push(id.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let deleted: HashSet<&str> = removed
        .iter()
        .copied()
        .filter(|id| !held.contains(id))
        .chain(gated.values().flatten().copied())
        .collect();

    let mut operations = Vec::new();
    for &id in &removed {
        if held.contains(id) {
            continue;
        }
        let guarded = gated.get(id).map(Vec::as_slice).unwrap_or_default();
        operations.push(delete_operation(graph, previous, id, None, &deleted, guarded));
        for &target in guarded {
            operations.push(delete_operation(graph, previous, target, Some(id), &deleted, &[]));
        }
    }

    (operations, retained)
}

fn delete_operation(
    graph: &DependencyGraph,
    previous: &StackState,
    id: &str,
    gate: Option<&str>,
    deleted: &HashSet<&str>,
    guarded: &[&str],
) -> PlannedOperation {
    let mut predecessors: Vec<String> = gate.map(str::to_string).into_iter().collect();
    predecessors.extend(
        graph
            .dependents(id)
            .into_iter()
            .filter(|d| deleted.contains(d) && !guarded.contains(d) && Some(*d) != gate)
            .map(str::to_string),
    );

    let record = previous.resource(id);
    let node = graph.node(id);
    PlannedOperation {
        logical_id: id.to_string(),
        kind: node.map(|n| n.kind.clone()).unwrap_or_default(),
        operation: Operation::Delete,
        reason: gate.map_or_else(
            || "no longer declared".to_string(),
            |h| format!("after cleanup hook '{h}'"),
        ),
        predecessors,
        gate: gate.map(str::to_string),
        removal_policy: node.map(|n| n.removal_policy).unwrap_or_default(),
        is_hook: node.is_some_and(|n| n.is_hook),
        resolved: record.map(|r| r.properties.clone()),
        hash: record.map(|r| r.properties_hash.clone()),
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.operation, self.logical_id, self.reason)
    }
}

impl fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noop() {
            return write!(f, "{}: no changes", self.stack);
        }

        writeln!(
            f,
            "{} ({}, {} operations):",
            self.stack,
            self.direction,
            self.operations.len()
        )?;
        for (i, op) in self.operations.iter().enumerate() {
            writeln!(f, "  {i}. {op}")?;
        }
        if !self.retained.is_empty() {
            writeln!(f, "  retained: {}", self.retained.join(", "))?;
        }
        Ok(())
    }
}
