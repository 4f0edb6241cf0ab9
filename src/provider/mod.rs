//! Resource provider boundary.
//!
//! This module covers:
//! - The `ResourceProvider` trait every backend implements
//! - A simulated provider issuing deterministic identifiers

mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::ResolvedProperties;

pub use simulated::SimulatedProvider;

/// One resource operation sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Owning stack.
    pub stack: String,
    /// Logical id.
    pub logical_id: String,
    /// Resource kind.
    pub kind: String,
    /// Resolved properties.
    pub properties: ResolvedProperties,
    /// Outputs recorded by the previous apply, on update and delete.
    #[serde(default)]
    pub previous_outputs: Option<ResolvedProperties>,
}

/// Creates, updates and deletes resources of any kind.
///
/// Implementations must be idempotent: the executor retries throttled and
/// network failures with the same request. A node whose create hook failed
/// stays recorded as pending and is finished with `update` on the next
/// apply, never with a second `create`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Creates a resource and returns its outputs.
    async fn create(&self, request: &ResourceRequest) -> Result<ResolvedProperties>;

    /// Updates a resource in place and returns its outputs.
    async fn update(&self, request: &ResourceRequest) -> Result<ResolvedProperties>;

    /// Deletes a resource. `ProviderError::NotFound` means already gone.
    async fn delete(&self, request: &ResourceRequest) -> Result<()>;

    /// Provider name for logs.
    fn name(&self) -> &'static str;
}
