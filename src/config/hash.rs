//! Hashing for change detection.
//!
//! Resolved properties are hashed over their canonical JSON form. Object
//! keys are emitted in sorted order, so two property maps hash equal
//! exactly when they are equal.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::spec::DeployDescriptor;
use crate::model::ResolvedProperties;

/// Hasher for properties and descriptors.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hash of a node's resolved properties.
    #[must_use]
    pub fn hash_properties(&self, properties: &ResolvedProperties) -> String {
        Self::hash_json(properties)
    }

    /// Hash of the whole descriptor, recorded in state after each session.
    #[must_use]
    pub fn hash_descriptor(&self, descriptor: &DeployDescriptor) -> String {
        Self::hash_json(descriptor)
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    fn hash_json<T: Serialize + ?Sized>(value: &T) -> String {
        // serde_json::Value objects are BTreeMap backed, so this is canonical.
        let canonical = serde_json::to_value(value)
            .and_then(|v| serde_json::to_vec(&v))
            .unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(entries: &[(&str, serde_json::Value)]) -> ResolvedProperties {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_properties_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let a = props(&[("billingMode", json!("PAY_PER_REQUEST")), ("partitionKey", json!("id"))]);
        let b = props(&[("partitionKey", json!("id")), ("billingMode", json!("PAY_PER_REQUEST"))]);

        assert_eq!(hasher.hash_properties(&a), hasher.hash_properties(&b));
    }

    #[test]
    fn test_nested_key_order_ignored() {
        let hasher = ConfigHasher::new();
        let a = props(&[("env", json!({"TABLE": "t", "BUCKET": "b"}))]);
        let b = props(&[("env", json!({"BUCKET": "b", "TABLE": "t"}))]);

        assert_eq!(hasher.hash_properties(&a), hasher.hash_properties(&b));
    }

    #[test]
    fn test_different_properties_different_hash() {
        let hasher = ConfigHasher::new();
        let a = props(&[("name", json!("sample-data"))]);
        let b = props(&[("name", json!("sample-data-2"))]);

        assert_ne!(hasher.hash_properties(&a), hasher.hash_properties(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
