//! Lifecycle hooks for custom resources.
//!
//! This module covers:
//! - Hook definitions attached to `custom-resource` nodes
//! - The handler boundary (command, HTTP webhook, static outputs)
//! - The dispatcher enforcing timeout, retry budget and backoff

mod dispatcher;
mod handler;
mod types;

pub use dispatcher::{HookDispatcher, RetryPolicy};
pub use handler::{CommandHandler, HandlerRegistry, HookHandler, HttpHandler, StaticHandler};
pub use types::{
    FailureKind, HandlerSpec, HookOperation, HookPayload, HookRequest, HookResponse, HookResult,
    HookState, HookStatus, HookTransition, LifecycleHook,
};
