//! Deployment sessions across stacks.
//!
//! A [`Deployer`] owns the built stacks and their wave order. `apply` walks
//! the selected stacks wave by wave: each stack is planned against its
//! record, executed, its outputs published for the stacks downstream, and
//! state is saved before the next stack starts. `destroy` walks the same
//! order backwards. Both hold the state lock for the whole session.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::broker::ValueBroker;
use crate::config::{ConfigHasher, DeployDescriptor};
use crate::error::{ConfigError, ExecutionError, Result};
use crate::hooks::HookDispatcher;
use crate::model::{ResolvedProperties, Stack};
use crate::planner::{
    CancelHandle, DeploymentPlan, Direction, ImportMode, Operation, PlanExecutor, Planner,
    StackOrder, evaluate_outputs, order_stacks,
};
use crate::provider::ResourceProvider;
use crate::report::{DeploymentReport, Outcome, StackReport};
use crate::state::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, LockInfo, StateStore,
    generate_holder_id,
};

/// Runs plan, apply and destroy sessions for a descriptor.
pub struct Deployer<S: StateStore> {
    descriptor: DeployDescriptor,
    stacks: Vec<Stack>,
    order: StackOrder,
    store: S,
    provider: Arc<dyn ResourceProvider>,
    hooks: Arc<HookDispatcher>,
    cancel: CancelHandle,
    hasher: ConfigHasher,
}

impl<S: StateStore> std::fmt::Debug for Deployer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("project", &self.descriptor.qualified_name())
            .field("order", &self.order)
            .field("backend", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl<S: StateStore> Deployer<S> {
    /// Builds the stacks of `descriptor` and orders them.
    ///
    /// # Errors
    ///
    /// Declaration errors, and stack-level cycles or unknown stacks.
    pub fn new(
        descriptor: DeployDescriptor,
        store: S,
        provider: Arc<dyn ResourceProvider>,
        hooks: Arc<HookDispatcher>,
    ) -> Result<Self> {
        let stacks = descriptor.build_stacks()?;
        let order = order_stacks(&stacks)?;
        info!(
            project = %descriptor.qualified_name(),
            stacks = stacks.len(),
            waves = order.waves.len(),
            "Deployer ready"
        );

        Ok(Self {
            descriptor,
            stacks,
            order,
            store,
            provider,
            hooks,
            cancel: CancelHandle::new(),
            hasher: ConfigHasher::new(),
        })
    }

    /// Shares a cancellation handle.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle cancelling the running session.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &DeployDescriptor {
        &self.descriptor
    }

    /// Stack waves.
    #[must_use]
    pub const fn order(&self) -> &StackOrder {
        &self.order
    }

    /// Built stacks in declaration order.
    #[must_use]
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Looks up a built stack.
    #[must_use]
    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.name() == name)
    }

    /// The state store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Previews the apply of `selection` (every stack when empty).
    ///
    /// Imports of stacks that are not deployed yet show up as updates
    /// resolved at apply time.
    ///
    /// # Errors
    ///
    /// Unknown stacks, state errors, and plan-time graph errors.
    pub async fn plan(&self, selection: &[String]) -> Result<Vec<DeploymentPlan>> {
        let selected = self.select(selection)?;
        let state = self.load_state().await?;
        let broker = seed_broker(&state, &selected);
        let planner = Planner::new(&broker).with_import_mode(ImportMode::Preview);

        let mut plans = Vec::with_capacity(selected.len());
        for stack in selected {
            let previous = state.stack(stack.name()).cloned().unwrap_or_default();
            let plan = planner.plan_apply(stack, &previous)?;
            // Unchanged stacks keep their outputs, so downstream previews can use them.
            if plan.is_noop() && previous.completed {
                broker.publish_all(stack.name(), &previous.outputs);
            }
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Previews the destroy of `selection` (every recorded stack when empty).
    ///
    /// # Errors
    ///
    /// Unknown stacks, state errors, and `ExecutionError::Aborted` when a
    /// deployed stack outside the selection imports a selected one.
    pub async fn plan_destroy(&self, selection: &[String]) -> Result<Vec<DeploymentPlan>> {
        let state = self.load_state().await?;
        let targets = self.destroy_targets(&state, selection)?;
        let broker = ValueBroker::new();
        let planner = Planner::new(&broker);

        targets
            .iter()
            .filter_map(|name| state.stack(name).map(|record| (name, record)))
            .map(|(name, record)| planner.plan_destroy(name, record))
            .collect()
    }

    /// Applies `selection` (every stack when empty).
    ///
    /// Per-node failures are reported, not returned.
    ///
    /// # Errors
    ///
    /// Unknown stacks, lock contention, and state load or save failures.
    pub async fn apply(&self, selection: &[String]) -> Result<DeploymentReport> {
        let selected = self.select(selection)?;
        let lock = self
            .store
            .acquire_lock(&generate_holder_id(), &DeploymentOperation::Apply.to_string())
            .await?;
        let result = self.run_apply(&selected).await;
        self.release(&lock).await;
        result
    }

    /// Destroys `selection` (every recorded stack when empty), dependents
    /// first.
    ///
    /// # Errors
    ///
    /// Unknown stacks, lock contention, state failures, and
    /// `ExecutionError::Aborted` when a deployed stack outside the
    /// selection still imports a selected one.
    pub async fn destroy(&self, selection: &[String]) -> Result<DeploymentReport> {
        self.select(selection)?;
        let lock = self
            .store
            .acquire_lock(&generate_holder_id(), &DeploymentOperation::Destroy.to_string())
            .await?;
        let result = self.run_destroy(selection).await;
        self.release(&lock).await;
        result
    }

    /// Outputs of every completed stack.
    ///
    /// # Errors
    ///
    /// State load failures.
    pub async fn outputs(&self) -> Result<BTreeMap<String, ResolvedProperties>> {
        let state = self.load_state().await?;
        Ok(state
            .completed_stacks()
            .map(|(name, record)| (name.to_string(), record.outputs.clone()))
            .collect())
    }

    async fn run_apply(&self, selected: &[&Stack]) -> Result<DeploymentReport> {
        let mut state = self.load_state().await?;
        let descriptor_hash = self.hasher.hash_descriptor(&self.descriptor);
        let broker = seed_broker(&state, selected);
        let planner = Planner::new(&broker);
        let executor = self.executor();
        let continue_on_error = self.descriptor.execution.continue_on_error;

        let mut report = DeploymentReport::new();
        let mut stopped: Option<String> = None;

        for stack in selected {
            let name = stack.name();
            if let Some(skipped) = self.skipped(name, Direction::Up, stopped.as_deref()) {
                report.stacks.push(skipped);
                continue;
            }

            let previous = state.stack(name).cloned().unwrap_or_default();
            let plan = match planner.plan_apply(stack, &previous) {
                Ok(plan) => plan,
                Err(e) => {
                    error!(stack = name, error = %e, "Planning failed");
                    state.add_history(
                        DeploymentHistoryEntry::new(
                            DeploymentOperation::Apply,
                            name,
                            &descriptor_hash,
                            Vec::new(),
                        )
                        .failed(&e.to_string()),
                    );
                    report.stacks.push(StackReport::failed(name, Direction::Up, &e));
                    if !continue_on_error {
                        stopped = Some(format!("stack '{name}' failed"));
                    }
                    continue;
                }
            };

            let mut record = previous;
            record.completed = false;
            let mut stack_report = executor.execute(&plan, Some(stack), &mut record, &broker).await;

            if stack_report.is_complete() {
                match evaluate_outputs(stack, &record, &broker) {
                    Ok(outputs) => {
                        broker.publish_all(name, &outputs);
                        record.outputs = outputs;
                        record.completed = true;
                    }
                    Err(e) => {
                        error!(stack = name, error = %e, "Output evaluation failed");
                        stack_report.error = Some(e.to_string());
                    }
                }
            }
            record.updated_at = Some(Utc::now());
            state.set_stack(name, record);
            state.add_history(history_entry(
                DeploymentOperation::Apply,
                &stack_report,
                &descriptor_hash,
            ));
            self.store.save(&state).await?;

            if stack_report.cancelled {
                stopped = Some(String::from("cancelled"));
            } else if stack_report.has_failures() {
                warn!(stack = name, "Stack did not complete");
                if !continue_on_error {
                    stopped = Some(format!("stack '{name}' failed"));
                }
            } else {
                info!(stack = name, "Stack deployed");
            }
            report.stacks.push(stack_report);
        }

        if !report.has_failures() && !self.cancel.is_cancelled() {
            state.descriptor_hash = descriptor_hash;
            self.store.save(&state).await?;
        }
        report.finish();
        Ok(report)
    }

    async fn run_destroy(&self, selection: &[String]) -> Result<DeploymentReport> {
        let mut state = self.load_state().await?;
        let targets = self.destroy_targets(&state, selection)?;
        let descriptor_hash = self.hasher.hash_descriptor(&self.descriptor);
        let broker = ValueBroker::new();
        let planner = Planner::new(&broker);
        let executor = self.executor();

        let mut report = DeploymentReport::new();
        let mut stopped: Option<String> = None;

        for name in &targets {
            if let Some(skipped) = self.skipped(name, Direction::Down, stopped.as_deref()) {
                report.stacks.push(skipped);
                continue;
            }
            let Some(previous) = state.stack(name).cloned() else {
                continue;
            };

            let plan = match planner.plan_destroy(name, &previous) {
                Ok(plan) => plan,
                Err(e) => {
                    error!(stack = %name, error = %e, "Planning failed");
                    report.stacks.push(StackReport::failed(name, Direction::Down, &e));
                    stopped = Some(format!("stack '{name}' failed"));
                    continue;
                }
            };

            let mut record = previous;
            record.completed = false;
            record.outputs.clear();
            let stack_report = executor.execute(&plan, None, &mut record, &broker).await;

            if record.is_empty() && stack_report.is_complete() {
                state.remove_stack(name);
                info!(stack = %name, "Stack destroyed");
            } else {
                record.updated_at = Some(Utc::now());
                state.set_stack(name, record);
                stopped = Some(if stack_report.cancelled {
                    String::from("cancelled")
                } else {
                    format!("stack '{name}' failed")
                });
            }
            state.add_history(history_entry(
                DeploymentOperation::Destroy,
                &stack_report,
                &descriptor_hash,
            ));
            self.store.save(&state).await?;
            report.stacks.push(stack_report);
        }

        report.finish();
        Ok(report)
    }

    /// Stacks to tear down, dependents first.
    ///
    /// With an empty selection, recorded stacks the descriptor no longer
    /// declares go first.
    fn destroy_targets(&self, state: &DeploymentState, selection: &[String]) -> Result<Vec<String>> {
        let selected = self.select(selection)?;
        let mut targets: Vec<String> = Vec::new();
        if selection.is_empty() {
            targets.extend(
                state
                    .stacks
                    .keys()
                    .filter(|name| self.stack(name.as_str()).is_none())
                    .cloned(),
            );
        }
        targets.extend(
            selected
                .iter()
                .rev()
                .map(|s| s.name().to_string())
                .filter(|name| state.stack(name).is_some()),
        );

        for stack in &self.stacks {
            if targets.iter().any(|t| t == stack.name()) || state.stack(stack.name()).is_none() {
                continue;
            }
            if let Some(upstream) = stack.upstream_stacks().into_iter().find(|u| targets.contains(u)) {
                return Err(ExecutionError::Aborted {
                    reason: format!(
                        "stack '{}' is deployed and depends on '{upstream}'; destroy it first",
                        stack.name()
                    ),
                }
                .into());
            }
        }
        Ok(targets)
    }

    /// Selected stacks in deployment order.
    fn select(&self, selection: &[String]) -> Result<Vec<&Stack>> {
        if let Some(unknown) = selection.iter().find(|name| self.stack(name).is_none()) {
            return Err(ConfigError::validation(format!("Unknown stack '{unknown}'"), "stacks").into());
        }
        Ok(self
            .order
            .flatten()
            .into_iter()
            .filter(|name| selection.is_empty() || selection.iter().any(|s| s == name))
            .filter_map(|name| self.stack(name))
            .collect())
    }

    /// Report for a stack that is not run because the session stopped.
    fn skipped(&self, name: &str, direction: Direction, stopped: Option<&str>) -> Option<StackReport> {
        if self.cancel.is_cancelled() {
            let mut report = StackReport::new(name, direction);
            report.cancelled = true;
            report.error = Some(ExecutionError::Cancelled { stack: name.to_string() }.to_string());
            return Some(report);
        }
        stopped.map(|reason| StackReport::failed(name, direction, format!("not attempted: {reason}")))
    }

    fn executor(&self) -> PlanExecutor {
        let execution = &self.descriptor.execution;
        PlanExecutor::new(Arc::clone(&self.provider), Arc::clone(&self.hooks))
            .with_max_parallelism(execution.max_parallelism)
            .with_retry(execution.retry_config())
            .with_cancel_handle(self.cancel.clone())
            .with_continue_on_error(execution.continue_on_error)
    }

    async fn load_state(&self) -> Result<DeploymentState> {
        self.store
            .load_or_new(&self.descriptor.project.name, &self.descriptor.project.environment)
            .await
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(lock_id = %lock.lock_id, error = %e, "Failed to release state lock");
        }
    }
}

/// Broker holding the outputs of completed stacks outside `selected`.
fn seed_broker(state: &DeploymentState, selected: &[&Stack]) -> ValueBroker {
    let broker = ValueBroker::new();
    for (name, record) in state.completed_stacks() {
        if selected.iter().all(|s| s.name() != name) {
            broker.publish_all(name, &record.outputs);
        }
    }
    broker
}

fn history_entry(
    operation: DeploymentOperation,
    report: &StackReport,
    descriptor_hash: &str,
) -> DeploymentHistoryEntry {
    let touched = report
        .entries
        .iter()
        .filter(|e| e.operation != Operation::NoOp)
        .map(|e| e.logical_id.clone())
        .collect();
    let entry = DeploymentHistoryEntry::new(operation, &report.stack, descriptor_hash, touched);

    if let Some(error) = &report.error {
        return entry.failed(error);
    }
    let failed = report.entries.iter().find_map(|e| match &e.outcome {
        Outcome::Failed(message) => Some(format!("{}: {message}", e.logical_id)),
        _ => None,
    });
    match failed {
        Some(message) => entry.failed(&message),
        None if report.cancelled => entry.failed("cancelled"),
        None => entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{BrokerError, DeployError, StateError};
    use crate::provider::SimulatedProvider;
    use crate::state::LocalStateStore;

    const DESCRIPTOR: &str = r"
project:
  name: nlq-chat
stacks:
  - name: APIStack
    resources:
      - id: QueryHandler
        kind: compute.function
        properties:
          userPoolId: { $import: AuthStack.userPoolId }
          tableName: { $import: DataStack.tableName }
    outputs:
      handlerArn: { $ref: QueryHandler.arn }
  - name: AuthStack
    resources:
      - id: UserPool
        kind: identity.user-pool
      - id: UserPoolClient
        kind: identity.user-pool-client
        properties:
          userPoolId: { $ref: UserPool }
    outputs:
      userPoolId: { $ref: UserPool.id }
      clientId: { $ref: UserPoolClient.id }
  - name: DataStack
    resources:
      - id: ChatHistory
        kind: nosql.table
        properties:
          partitionKey: sessionId
    outputs:
      tableName: { $ref: ChatHistory.name }
";

    struct Harness {
        _dir: tempfile::TempDir,
        provider: Arc<SimulatedProvider>,
        deployer: Deployer<LocalStateStore>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ConfigParser::new().parse_yaml(DESCRIPTOR, None).unwrap();
        let provider = Arc::new(SimulatedProvider::default());
        let deployer = Deployer::new(
            descriptor,
            LocalStateStore::with_base_dir(dir.path().join(".nlq-deploy")),
            provider.clone(),
            Arc::new(HookDispatcher::default()),
        )
        .unwrap();
        Harness {
            _dir: dir,
            provider,
            deployer,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_waves() {
        let h = harness();
        assert_eq!(
            h.deployer.order().waves,
            vec![names(&["AuthStack", "DataStack"]), names(&["APIStack"])]
        );
    }

    #[tokio::test]
    async fn test_apply_publishes_outputs_downstream() {
        let h = harness();
        let report = h.deployer.apply(&[]).await.unwrap();
        assert_eq!(report.exit_code(), 0, "{report:?}");
        let order: Vec<&str> = report.stacks.iter().map(|s| s.stack.as_str()).collect();
        assert_eq!(order, vec!["AuthStack", "DataStack", "APIStack"]);
        assert_eq!(h.provider.len(), 4);

        let outputs = h.deployer.outputs().await.unwrap();
        let state = h.deployer.store().load().await.unwrap().unwrap();
        let handler = state.stack("APIStack").unwrap().resource("QueryHandler").unwrap();
        assert_eq!(handler.properties["userPoolId"], outputs["AuthStack"]["userPoolId"]);
        assert_eq!(handler.properties["tableName"], outputs["DataStack"]["tableName"]);
        assert_eq!(outputs["APIStack"]["handlerArn"], handler.outputs["arn"]);
        assert!(!state.descriptor_hash.is_empty());
        assert_eq!(state.history.len(), 3);
        assert!(!h.deployer.store().is_locked().await.unwrap());

        // Everything settled, so the preview is empty.
        let plans = h.deployer.plan(&[]).await.unwrap();
        assert!(plans.iter().all(DeploymentPlan::is_noop));
    }

    #[tokio::test]
    async fn test_selected_stack_reads_recorded_outputs() {
        let h = harness();
        h.deployer.apply(&names(&["AuthStack", "DataStack"])).await.unwrap();

        let report = h.deployer.apply(&names(&["APIStack"])).await.unwrap();
        assert_eq!(report.exit_code(), 0, "{report:?}");
        assert_eq!(
            report.stack("APIStack").unwrap().entry("QueryHandler").unwrap().outcome,
            Outcome::Succeeded
        );
    }

    #[tokio::test]
    async fn test_import_of_undeployed_stack_fails_before_side_effects() {
        let h = harness();

        let preview = h.deployer.plan(&names(&["APIStack"])).await.unwrap();
        assert_eq!(preview[0].operation("QueryHandler").unwrap().operation, Operation::Create);

        let report = h.deployer.apply(&names(&["APIStack"])).await.unwrap();
        assert_eq!(report.exit_code(), 1);
        let api = report.stack("APIStack").unwrap();
        assert!(api.entries.is_empty());
        // Properties resolve in key order, so the table import is hit first.
        let expected = BrokerError::OutputNotYetAvailable {
            stack: "DataStack".into(),
            output: "tableName".into(),
        };
        assert!(api.error.as_deref().unwrap().contains(&expected.to_string()));
        assert!(h.provider.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_guards_deployed_dependents() {
        let h = harness();
        h.deployer.apply(&[]).await.unwrap();

        let err = h.deployer.destroy(&names(&["AuthStack"])).await.unwrap_err();
        assert!(matches!(err, DeployError::Execution(ExecutionError::Aborted { .. })));
        assert_eq!(h.provider.len(), 4);

        let plans = h.deployer.plan_destroy(&[]).await.unwrap();
        let order: Vec<&str> = plans.iter().map(|p| p.stack.as_str()).collect();
        assert_eq!(order, vec!["APIStack", "DataStack", "AuthStack"]);
        assert_eq!(plans[1].order(), vec!["ChatHistory"]);

        let report = h.deployer.destroy(&[]).await.unwrap();
        assert_eq!(report.exit_code(), 0, "{report:?}");
        assert!(h.provider.is_empty());
        let state = h.deployer.store().load().await.unwrap().unwrap();
        assert!(state.stacks.is_empty());
        assert!(h.deployer.outputs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_session_skips_stacks() {
        let h = harness();
        h.deployer.cancel_handle().cancel();

        let report = h.deployer.apply(&[]).await.unwrap();
        assert!(report.stacks.iter().all(|s| s.cancelled));
        assert_eq!(report.exit_code(), 1);
        assert!(h.provider.is_empty());
    }

    #[tokio::test]
    async fn test_apply_refuses_locked_state() {
        let h = harness();
        h.deployer.store().acquire_lock("ci-runner", "manual").await.unwrap();

        let err = h.deployer.apply(&[]).await.unwrap_err();
        assert!(matches!(err, DeployError::State(StateError::LockedByOther { .. })));
    }

    #[tokio::test]
    async fn test_unknown_stack_selection() {
        let h = harness();
        let err = h.deployer.plan(&names(&["FrontendStack"])).await.unwrap_err();
        assert!(err.to_string().contains("Unknown stack 'FrontendStack'"));
        assert_eq!(h.deployer.stacks().len(), 3);
    }
}
