//! Cross-stack value broker.
//!
//! Stacks publish their outputs once their deployment completes; dependent
//! stacks resolve them by name. A value can only be resolved after its
//! owning stack was marked complete.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::error::BrokerError;

#[derive(Debug, Default)]
struct StackOutputs {
    values: BTreeMap<String, Value>,
    complete: bool,
}

/// Thread-safe registry of stack outputs.
#[derive(Debug, Default)]
pub struct ValueBroker {
    stacks: RwLock<HashMap<String, StackOutputs>>,
}

impl ValueBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one output of `stack`.
    pub fn publish(&self, stack: &str, output: &str, value: Value) {
        let mut stacks = self.stacks.write().unwrap_or_else(PoisonError::into_inner);
        debug!(stack, output, "Publishing stack output");
        stacks
            .entry(stack.to_string())
            .or_default()
            .values
            .insert(output.to_string(), value);
    }

    /// Marks `stack` as completed; its outputs become resolvable.
    pub fn mark_complete(&self, stack: &str) {
        let mut stacks = self.stacks.write().unwrap_or_else(PoisonError::into_inner);
        stacks.entry(stack.to_string()).or_default().complete = true;
    }

    /// Publishes every output of a completed stack at once.
    pub fn publish_all(&self, stack: &str, outputs: &BTreeMap<String, Value>) {
        let mut stacks = self.stacks.write().unwrap_or_else(PoisonError::into_inner);
        let entry = stacks.entry(stack.to_string()).or_default();
        entry
            .values
            .extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        entry.complete = true;
    }

    /// Resolves `stack.output`.
    ///
    /// # Errors
    ///
    /// `BrokerError::OutputNotYetAvailable` until `stack` is complete, then
    /// `BrokerError::UnknownOutput` if it never published `output`.
    pub fn resolve(&self, stack: &str, output: &str) -> Result<Value, BrokerError> {
        let stacks = self.stacks.read().unwrap_or_else(PoisonError::into_inner);
        let entry = stacks
            .get(stack)
            .filter(|s| s.complete)
            .ok_or_else(|| BrokerError::OutputNotYetAvailable {
                stack: stack.to_string(),
                output: output.to_string(),
            })?;

        entry
            .values
            .get(output)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownOutput {
                stack: stack.to_string(),
                output: output.to_string(),
            })
    }

    /// True once `stack` was marked complete.
    #[must_use]
    pub fn is_complete(&self, stack: &str) -> bool {
        self.stacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stack)
            .is_some_and(|s| s.complete)
    }

    /// Snapshot of a stack's published outputs.
    #[must_use]
    pub fn outputs(&self, stack: &str) -> BTreeMap<String, Value> {
        self.stacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stack)
            .map(|s| s.values.clone())
            .unwrap_or_default()
    }
}
