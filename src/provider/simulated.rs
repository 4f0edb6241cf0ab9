//! In-memory provider.
//!
//! Physical ids are derived from stack and logical id, so repeated runs
//! against the same descriptor produce the same identifiers.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{ResourceProvider, ResourceRequest};
use crate::error::{ProviderError, Result};
use crate::model::ResolvedProperties;

/// Provider keeping resources in memory.
#[derive(Debug)]
pub struct SimulatedProvider {
    region: String,
    account: String,
    resources: Mutex<BTreeMap<String, ResolvedProperties>>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new("local", "000000000000")
    }
}

impl SimulatedProvider {
    /// Creates a provider for a region and account.
    #[must_use]
    pub fn new(region: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account: account.into(),
            resources: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `stack/logical_id` is live.
    #[must_use]
    pub fn contains(&self, stack: &str, logical_id: &str) -> bool {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key(stack, logical_id))
    }

    fn outputs(&self, request: &ResourceRequest) -> ResolvedProperties {
        let digest = Sha256::digest(key(&request.stack, &request.logical_id).as_bytes());
        let physical_id = hex::encode(&digest[..6]);
        let name = format!("{}-{}", request.logical_id.to_lowercase(), &physical_id[..6]);
        let kind = request.kind.replace(['.', ':'], "-");

        let mut outputs = request.properties.clone();
        outputs.insert("id".to_string(), Value::String(physical_id.clone()));
        outputs.insert("name".to_string(), Value::String(name));
        outputs.insert(
            "arn".to_string(),
            Value::String(format!(
                "arn:sim:{}:{}:{kind}/{physical_id}",
                self.region, self.account
            )),
        );
        outputs
    }
}

fn key(stack: &str, logical_id: &str) -> String {
    format!("{stack}/{logical_id}")
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    async fn create(&self, request: &ResourceRequest) -> Result<ResolvedProperties> {
        let outputs = self.outputs(request);
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(&request.stack, &request.logical_id), outputs.clone());
        info!(
            stack = %request.stack,
            logical_id = %request.logical_id,
            kind = %request.kind,
            "Created resource"
        );
        Ok(outputs)
    }

    async fn update(&self, request: &ResourceRequest) -> Result<ResolvedProperties> {
        let outputs = self.outputs(request);
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = resources
            .get_mut(&key(&request.stack, &request.logical_id))
            .ok_or_else(|| ProviderError::NotFound {
                logical_id: request.logical_id.clone(),
            })?;
        entry.clone_from(&outputs);
        debug!(logical_id = %request.logical_id, "Updated resource");
        Ok(outputs)
    }

    async fn delete(&self, request: &ResourceRequest) -> Result<()> {
        let removed = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(&request.stack, &request.logical_id));
        if removed.is_none() {
            return Err(ProviderError::NotFound {
                logical_id: request.logical_id.clone(),
            }
            .into());
        }
        info!(logical_id = %request.logical_id, "Deleted resource");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use serde_json::json;

    fn request(logical_id: &str) -> ResourceRequest {
        ResourceRequest {
            stack: "DataStack".to_string(),
            logical_id: logical_id.to_string(),
            kind: "storage.bucket".to_string(),
            properties: BTreeMap::from([("versioned".to_string(), json!(false))]),
            previous_outputs: None,
        }
    }

    #[tokio::test]
    async fn test_identifiers_are_deterministic() {
        let a = SimulatedProvider::default();
        let b = SimulatedProvider::default();

        let first = a.create(&request("SampleDataBucket")).await.unwrap();
        let second = b.create(&request("SampleDataBucket")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first["versioned"], json!(false));
        assert!(first["arn"].as_str().unwrap().starts_with("arn:sim:local:000000000000:storage-bucket/"));
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let provider = SimulatedProvider::default();
        let err = provider.update(&request("Missing")).await.unwrap_err();
        assert!(matches!(err, DeployError::Provider(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_lifecycle() {
        let provider = SimulatedProvider::default();
        provider.create(&request("ChatHistoryTable")).await.unwrap();
        assert!(provider.contains("DataStack", "ChatHistoryTable"));

        provider.delete(&request("ChatHistoryTable")).await.unwrap();
        assert!(provider.is_empty());

        let err = provider.delete(&request("ChatHistoryTable")).await.unwrap_err();
        assert!(matches!(err, DeployError::Provider(ProviderError::NotFound { .. })));
    }

    #[test]
    fn test_name_and_region() {
        let provider = SimulatedProvider::new("eu-west-1", "123456789012");
        assert_eq!(provider.name(), "simulated");

        let outputs = tokio_test::block_on(provider.create(&request("WebAcl"))).unwrap();
        assert!(outputs["arn"].as_str().unwrap().contains(":eu-west-1:123456789012:"));
        assert_eq!(provider.len(), 1);
    }
}
