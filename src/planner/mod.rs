//! Planning module for deployment operations.
//!
//! This module covers:
//! - Per-stack plans diffing the dependency graph against previous state
//! - Stack-level ordering into waves
//! - Concurrent plan execution with cancellation

mod executor;
mod order;
mod plan;

pub use executor::{CancelHandle, DEFAULT_MAX_PARALLELISM, PlanExecutor, evaluate_outputs};
pub use order::{STACK_GRAPH, StackOrder, order_stacks};
pub use plan::{DeploymentPlan, Direction, ImportMode, Operation, PlannedOperation, Planner};
