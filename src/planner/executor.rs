//! Plan executor.
//!
//! Runs the operations of a plan against a resource provider, dispatching
//! every operation whose predecessors succeeded, up to `max_parallelism`
//! at a time. Properties not known at plan time are resolved when their
//! operation is dispatched. The stack record is updated as each operation
//! settles, so it only ever holds nodes the provider holds too. A node
//! whose create hook failed is recorded with `hook_pending` set and is
//! planned as a create again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::plan::{DeploymentPlan, Operation, PlannedOperation, read_attribute};
use crate::broker::ValueBroker;
use crate::config::ConfigHasher;
use crate::error::{ConfigError, DeployError, ExecutionError, ProviderError, Result};
use crate::hooks::{HookDispatcher, HookOperation, HookPayload, LifecycleHook};
use crate::model::{
    OutputRef, Reference, ResolvedProperties, Stack, ValueSource, resolve_properties,
};
use crate::provider::{ResourceProvider, ResourceRequest};
use crate::report::{Outcome, ReportEntry, StackReport};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::state::{AppliedResource, RecordedDependency, StackState};

/// Default number of operations in flight.
pub const DEFAULT_MAX_PARALLELISM: usize = 8;

/// Shared cancellation flag.
///
/// Cancelling stops dispatching; operations already in flight finish.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelHandle {
    /// Creates an untriggered handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting,
    Running,
    Done { settled: bool },
}

/// Work handed to a spawned task.
#[derive(Debug, Clone)]
struct Job {
    stack: String,
    logical_id: String,
    kind: String,
    operation: Operation,
    properties: ResolvedProperties,
    previous: Option<AppliedResource>,
    hook: Option<LifecycleHook>,
}

#[derive(Debug)]
struct JobOutput {
    outputs: ResolvedProperties,
    attempts: u32,
    /// Create hook failure after the provider created the node.
    hook_error: Option<DeployError>,
}

/// What is needed to record a job once it settles.
struct InFlight {
    job: Job,
    hash: String,
    depends_on: Vec<RecordedDependency>,
    started: Instant,
}

enum Dispatch {
    Immediate(Outcome),
    /// Inputs unchanged, only the recorded metadata is stale.
    Refresh,
    Spawn(InFlight),
}

/// Resolves references against the record being built.
struct StateSource<'a> {
    state: &'a StackState,
    broker: &'a ValueBroker,
}

impl ValueSource for StateSource<'_> {
    fn node_attribute(&self, reference: &Reference) -> Result<Option<Value>> {
        match self.state.resource(&reference.node) {
            Some(record) => read_attribute(&record.outputs, reference).map(Some),
            None => Ok(None),
        }
    }

    fn stack_output(&self, output: &OutputRef) -> Result<Option<Value>> {
        self.broker
            .resolve(&output.stack, &output.output)
            .map(Some)
            .map_err(Into::into)
    }
}

/// Evaluates the declared outputs of a stack against its applied record.
///
/// # Errors
///
/// Fails if an output reads a node that is not recorded, an attribute the
/// node does not have, or an import that is unavailable.
pub fn evaluate_outputs(
    stack: &Stack,
    state: &StackState,
    broker: &ValueBroker,
) -> Result<ResolvedProperties> {
    let source = StateSource { state, broker };
    let mut outputs = ResolvedProperties::new();
    for (name, value) in stack.outputs() {
        let resolved = value.resolve(&source)?.ok_or_else(|| {
            ConfigError::invalid_reference(
                format!("{}.{name}", stack.name()),
                "output reads a node that is not deployed",
            )
        })?;
        outputs.insert(name.clone(), resolved);
    }
    Ok(outputs)
}

/// Executor for deployment plans.
#[derive(Clone)]
pub struct PlanExecutor {
    provider: Arc<dyn ResourceProvider>,
    hooks: Arc<HookDispatcher>,
    hasher: ConfigHasher,
    max_parallelism: usize,
    retry: RetryConfig,
    cancel: CancelHandle,
    continue_on_error: bool,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("max_parallelism", &self.max_parallelism)
            .field("retry", &self.retry)
            .field("continue_on_error", &self.continue_on_error)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: Arc<dyn ResourceProvider>, hooks: Arc<HookDispatcher>) -> Self {
        Self {
            provider,
            hooks,
            hasher: ConfigHasher::new(),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            retry: RetryConfig::default(),
            cancel: CancelHandle::new(),
            continue_on_error: false,
        }
    }

    /// Sets the number of operations in flight.
    #[must_use]
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    /// Sets the retry policy for provider calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Shares a cancellation handle.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Keeps dispatching independent branches after a failure.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Executes a plan, updating `state` as operations settle.
    ///
    /// `desired` is the declared stack for up plans; destroy plans pass
    /// `None`. Failures are reported per node, never returned.
    pub async fn execute(
        &self,
        plan: &DeploymentPlan,
        desired: Option<&Stack>,
        state: &mut StackState,
        broker: &ValueBroker,
    ) -> StackReport {
        let ops = &plan.operations;
        info!(
            stack = %plan.stack,
            direction = %plan.direction,
            operations = ops.len(),
            "Executing plan"
        );

        let position: HashMap<&str, usize> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| (op.logical_id.as_str(), i))
            .collect();
        let mut slots = vec![Slot::Waiting; ops.len()];
        let mut entries: Vec<Option<ReportEntry>> = vec![None; ops.len()];
        let mut in_flight: HashMap<usize, InFlight> = HashMap::new();
        let mut tasks: JoinSet<(usize, Result<JobOutput>)> = JoinSet::new();

        let mut halted = false;
        let mut cancelled = false;
        let mut fatal: Option<String> = None;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                warn!(stack = %plan.stack, "Cancellation requested, draining in-flight operations");
                cancelled = true;
            }

            let mut progressed = true;
            while progressed && !halted && !cancelled {
                progressed = false;
                for i in 0..ops.len() {
                    if slots[i] != Slot::Waiting || tasks.len() >= self.max_parallelism {
                        continue;
                    }
                    let ready = ops[i]
                        .predecessors
                        .iter()
                        .filter_map(|p| position.get(p.as_str()))
                        .all(|&p| slots[p] == Slot::Done { settled: true });
                    if !ready {
                        continue;
                    }

                    match self.dispatch(&plan.stack, &ops[i], desired, state, broker) {
                        Dispatch::Immediate(outcome) => {
                            let settled = outcome.is_settled();
                            if let Outcome::Failed(message) = &outcome {
                                error!(stack = %plan.stack, logical_id = %ops[i].logical_id, error = %message, "Operation failed before dispatch");
                                halted = !self.continue_on_error;
                            }
                            slots[i] = Slot::Done { settled };
                            entries[i] = Some(entry(&ops[i], outcome, 0, 0));
                            progressed = true;
                        }
                        Dispatch::Refresh => {
                            let node = desired.and_then(|s| s.node(&ops[i].logical_id));
                            if let (Some(node), Some(mut record)) = (node, state.resource(&ops[i].logical_id).cloned()) {
                                record.refresh_metadata(node);
                                state.upsert(record);
                            }
                            info!(stack = %plan.stack, logical_id = %ops[i].logical_id, "Record refreshed");
                            slots[i] = Slot::Done { settled: true };
                            entries[i] = Some(entry(&ops[i], Outcome::Succeeded, 0, 0));
                            progressed = true;
                        }
                        Dispatch::Spawn(flight) => {
                            let job = flight.job.clone();
                            let provider = Arc::clone(&self.provider);
                            let hooks = Arc::clone(&self.hooks);
                            let retry = self.retry.clone();
                            debug!(stack = %plan.stack, logical_id = %job.logical_id, operation = %job.operation, "Dispatching");
                            tasks.spawn(async move { (i, run_job(&job, provider, hooks, retry).await) });
                            slots[i] = Slot::Running;
                            in_flight.insert(i, flight);
                        }
                    }
                    if halted {
                        break;
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((i, result)) => {
                    let Some(flight) = in_flight.remove(&i) else {
                        continue;
                    };
                    let elapsed = elapsed_ms(flight.started);
                    let (outcome, attempts) = match result {
                        Ok(JobOutput {
                            outputs,
                            attempts,
                            hook_error: None,
                        }) => {
                            self.record(&ops[i], plan, flight, outputs, false, state);
                            (Outcome::Succeeded, attempts)
                        }
                        Ok(JobOutput {
                            outputs,
                            attempts,
                            hook_error: Some(e),
                        }) => {
                            error!(stack = %plan.stack, logical_id = %ops[i].logical_id, error = %e, "Created, but its hook failed");
                            self.record(&ops[i], plan, flight, outputs, true, state);
                            halted = halted || !self.continue_on_error;
                            (Outcome::Failed(e.to_string()), attempts)
                        }
                        Err(e) => {
                            error!(stack = %plan.stack, logical_id = %ops[i].logical_id, error = %e, "Operation failed");
                            halted = halted || !self.continue_on_error;
                            (Outcome::Failed(e.to_string()), failed_attempts(&e))
                        }
                    };
                    slots[i] = Slot::Done {
                        settled: outcome.is_settled(),
                    };
                    entries[i] = Some(entry(&ops[i], outcome, elapsed, attempts));
                }
                Err(e) => {
                    error!(stack = %plan.stack, error = %e, "Operation task aborted");
                    fatal = Some(e.to_string());
                    halted = true;
                }
            }
        }

        // Tasks lost to a join error never reported back.
        for (i, flight) in in_flight {
            let message = fatal.clone().unwrap_or_else(|| "task lost".to_string());
            entries[i] = Some(entry(&ops[i], Outcome::Failed(message), elapsed_ms(flight.started), 0));
        }

        let mut report = StackReport::new(&plan.stack, plan.direction);
        report.cancelled = cancelled;
        report.entries = entries
            .into_iter()
            .zip(ops)
            .map(|(e, op)| e.unwrap_or_else(|| entry(op, Outcome::NotAttempted, 0, 0)))
            .collect();

        let clean = !cancelled && !report.entries.iter().any(|e| matches!(e.outcome, Outcome::Failed(_)));
        for id in &plan.retained {
            let outcome = if clean {
                state.remove(id);
                info!(stack = %plan.stack, logical_id = %id, "Retained at provider, dropped from state");
                Outcome::Retained
            } else {
                Outcome::NotAttempted
            };
            report.entries.push(ReportEntry {
                logical_id: id.clone(),
                kind: String::new(),
                operation: Operation::Delete,
                outcome,
                duration_ms: 0,
                attempts: 0,
            });
        }

        if cancelled {
            report.error = Some(
                ExecutionError::Cancelled {
                    stack: plan.stack.clone(),
                }
                .to_string(),
            );
        } else if let Some(message) = fatal {
            report.error = Some(message);
        }
        report
    }

    fn dispatch(
        &self,
        stack: &str,
        op: &PlannedOperation,
        desired: Option<&Stack>,
        state: &StackState,
        broker: &ValueBroker,
    ) -> Dispatch {
        let started = Instant::now();
        let previous = state.resource(&op.logical_id).cloned();

        match op.operation {
            Operation::NoOp => Dispatch::Immediate(Outcome::Unchanged),
            Operation::Create | Operation::Update => {
                let Some(node) = desired.and_then(|s| s.node(&op.logical_id)) else {
                    return Dispatch::Immediate(Outcome::Failed(format!(
                        "'{}' is not declared",
                        op.logical_id
                    )));
                };

                let properties = match &op.resolved {
                    Some(p) => p.clone(),
                    None => {
                        let source = StateSource { state, broker };
                        match resolve_properties(&node.properties, &source) {
                            Ok(Some(p)) => p,
                            Ok(None) => {
                                return Dispatch::Immediate(Outcome::Failed(format!(
                                    "'{}' references a node that has not settled",
                                    op.logical_id
                                )));
                            }
                            Err(e) => return Dispatch::Immediate(Outcome::Failed(e.to_string())),
                        }
                    }
                };
                let hash = self.hasher.hash_properties(&properties);

                if op.operation == Operation::Update {
                    let unchanged = previous.as_ref().is_some_and(|p| {
                        p.kind == node.kind && ConfigHasher::hashes_match(&p.properties_hash, &hash)
                    });
                    if unchanged {
                        if previous.as_ref().and_then(|p| p.metadata_change(node)).is_some() {
                            return Dispatch::Refresh;
                        }
                        debug!(stack, logical_id = %op.logical_id, "Resolved inputs unchanged");
                        return Dispatch::Immediate(Outcome::Unchanged);
                    }
                }

                Dispatch::Spawn(InFlight {
                    job: Job {
                        stack: stack.to_string(),
                        logical_id: op.logical_id.clone(),
                        kind: node.kind.clone(),
                        operation: op.operation,
                        properties,
                        previous,
                        hook: node.hook.clone(),
                    },
                    hash,
                    depends_on: RecordedDependency::of(node),
                    started,
                })
            }
            Operation::Delete => {
                let Some(record) = previous else {
                    debug!(stack, logical_id = %op.logical_id, "Not recorded, nothing to delete");
                    return Dispatch::Immediate(Outcome::Succeeded);
                };
                Dispatch::Spawn(InFlight {
                    job: Job {
                        stack: stack.to_string(),
                        logical_id: op.logical_id.clone(),
                        kind: record.kind.clone(),
                        operation: op.operation,
                        properties: record.properties.clone(),
                        hook: record.hook.clone(),
                        previous: Some(record),
                    },
                    hash: String::new(),
                    depends_on: Vec::new(),
                    started,
                })
            }
        }
    }

    fn record(
        &self,
        op: &PlannedOperation,
        plan: &DeploymentPlan,
        flight: InFlight,
        outputs: ResolvedProperties,
        hook_pending: bool,
        state: &mut StackState,
    ) {
        let InFlight {
            job, hash, depends_on, ..
        } = flight;

        if op.operation == Operation::Delete {
            state.remove(&op.logical_id);
            if op.is_hook {
                for guarded in plan
                    .operations
                    .iter()
                    .filter(|o| o.gate.as_deref() == Some(op.logical_id.as_str()))
                {
                    if let Some(record) = state.resource_mut(&guarded.logical_id) {
                        record.cleanup_succeeded = true;
                    }
                }
            }
            info!(stack = %plan.stack, logical_id = %op.logical_id, "Deleted");
            return;
        }

        let is_hook = job.hook.is_some();
        state.upsert(AppliedResource {
            logical_id: job.logical_id,
            kind: job.kind,
            properties: job.properties,
            properties_hash: hash,
            outputs,
            removal_policy: op.removal_policy,
            depends_on,
            hook: job.hook,
            is_hook,
            cleanup_succeeded: false,
            hook_pending,
            applied_at: Utc::now(),
        });
        info!(stack = %plan.stack, logical_id = %op.logical_id, operation = %op.operation, hook_pending, "Applied");
    }
}

fn entry(op: &PlannedOperation, outcome: Outcome, duration_ms: u64, attempts: u32) -> ReportEntry {
    ReportEntry {
        logical_id: op.logical_id.clone(),
        kind: op.kind.clone(),
        operation: op.operation,
        outcome,
        duration_ms,
        attempts,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

const fn failed_attempts(error: &DeployError) -> u32 {
    match error {
        DeployError::Hook(e) => e.attempts(),
        _ => 1,
    }
}

async fn run_job(
    job: &Job,
    provider: Arc<dyn ResourceProvider>,
    hooks: Arc<HookDispatcher>,
    retry: RetryConfig,
) -> Result<JobOutput> {
    let request = ResourceRequest {
        stack: job.stack.clone(),
        logical_id: job.logical_id.clone(),
        kind: job.kind.clone(),
        properties: job.properties.clone(),
        previous_outputs: job.previous.as_ref().map(|p| p.outputs.clone()),
    };
    let label = format!("{} {}", job.operation, job.logical_id);
    let payload = HookPayload {
        logical_id: job.logical_id.clone(),
        stack: job.stack.clone(),
        properties: job.properties.clone(),
        previous_properties: match job.operation {
            Operation::Update => job.previous.as_ref().map(|p| p.properties.clone()),
            _ => None,
        },
    };

    match job.operation {
        Operation::Create | Operation::Update => {
            let update = job.operation == Operation::Update;
            // A create left pending by its hook already exists at the provider.
            let exists = update || job.previous.is_some();
            let mut outputs = retry_with_backoff(&retry, &label, DeployError::is_retryable, || {
                let provider = Arc::clone(&provider);
                let request = request.clone();
                async move {
                    if exists {
                        provider.update(&request).await
                    } else {
                        provider.create(&request).await
                    }
                }
            })
            .await?;

            let mut attempts = 1;
            if let Some(hook) = &job.hook {
                let operation = if update {
                    HookOperation::Update
                } else {
                    HookOperation::Create
                };
                match hooks
                    .invoke(hook, operation, &payload)
                    .await
                    .map_err(DeployError::from)
                {
                    Ok(result) => {
                        attempts = result.attempts;
                        outputs.extend(result.outputs);
                    }
                    Err(e) if !update => {
                        return Ok(JobOutput {
                            outputs,
                            attempts: failed_attempts(&e),
                            hook_error: Some(e),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(JobOutput {
                outputs,
                attempts,
                hook_error: None,
            })
        }
        Operation::Delete => {
            let mut attempts = 1;
            if let Some(hook) = &job.hook {
                let result = hooks.invoke(hook, HookOperation::Delete, &payload).await?;
                attempts = result.attempts;
            }

            let deleted = retry_with_backoff(&retry, &label, DeployError::is_retryable, || {
                let provider = Arc::clone(&provider);
                let request = request.clone();
                async move { provider.delete(&request).await }
            })
            .await;
            match deleted {
                Ok(()) | Err(DeployError::Provider(ProviderError::NotFound { .. })) => Ok(JobOutput {
                    outputs: ResolvedProperties::new(),
                    attempts,
                    hook_error: None,
                }),
                Err(e) => Err(e),
            }
        }
        Operation::NoOp => Ok(JobOutput {
            outputs: ResolvedProperties::new(),
            attempts: 0,
            hook_error: None,
        }),
    }
}
