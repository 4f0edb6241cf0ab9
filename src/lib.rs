// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![allow(clippy::module_name_repetitions)]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # NLQ Deploy Stacks
//!
//! A declarative, dependency-ordered provisioning engine with lifecycle hooks
//! for the NLQ chat demo stacks.
//!
//! ## Overview
//!
//! Stacks of resource nodes are described in a YAML descriptor. The engine:
//!
//! - Builds a dependency graph per stack from references and explicit edges
//! - Orders stacks by the outputs they import from each other
//! - Diffs each stack against its last applied state and plans the changes
//! - Runs independent branches of the plan concurrently
//! - Invokes lifecycle hooks inline for custom resources
//! - Publishes stack outputs to the stacks that import them
//!
//! ## Architecture
//!
//! 1. **Model**: [`model::Stack`] holds immutable [`model::ResourceNode`]s
//! 2. **Graph**: [`graph::build_graph`] derives edges and rejects cycles
//! 3. **Planner**: [`planner::Planner`] emits an ordered [`planner::DeploymentPlan`]
//! 4. **Executor**: [`planner::PlanExecutor`] applies it through a [`provider::ResourceProvider`]
//! 5. **Broker**: [`broker::ValueBroker`] carries outputs across stacks
//!
//! ## Modules
//!
//! - [`model`]: Resource nodes, property values and stacks
//! - [`graph`]: Per-stack dependency graphs
//! - [`planner`]: Stack ordering, planning and plan execution
//! - [`hooks`]: Lifecycle hook handlers and the dispatcher
//! - [`broker`]: Cross-stack output publication
//! - [`provider`]: Resource provider boundary and the simulated provider
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`engine`]: Multi-stack deployment sessions
//! - [`config`]: Descriptor parsing and validation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: nlq-chat-demo
//!
//! stacks:
//!   - name: AuthStack
//!     resources:
//!       - id: UserPool
//!         kind: identity.user-pool
//!     outputs:
//!       userPoolId: { $ref: UserPool.id }
//!
//!   - name: APIStack
//!     resources:
//!       - id: QueryFunction
//!         kind: compute.function
//!         properties:
//!           userPoolId: { $import: AuthStack.userPoolId }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod broker;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod model;
pub mod planner;
pub mod provider;
pub mod report;
pub mod retry;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use broker::ValueBroker;
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployDescriptor};
pub use engine::Deployer;
pub use error::{DeployError, Result};
pub use graph::{DependencyGraph, build_graph};
pub use hooks::{HookDispatcher, LifecycleHook};
pub use model::{PropertyValue, RemovalPolicy, ResourceNode, Stack};
pub use planner::{DeploymentPlan, PlanExecutor, Planner, order_stacks};
pub use provider::{ResourceProvider, SimulatedProvider};
pub use report::DeploymentReport;
pub use state::{DeploymentState, LocalStateStore, S3StateStore, StateStore};
