//! Stacks: named, independently deployable groups of resource nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::error::{ConfigError, ModelError, Result};
use crate::hooks::LifecycleHook;
use crate::model::resource::{PropertyValue, RemovalPolicy, ResourceNode};

/// A declared stack.
///
/// Nodes keep their declaration order; the graph builder uses it to break
/// ties so identical input always yields the identical plan.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    name: String,
    description: Option<String>,
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    depends_on_stacks: Vec<String>,
    outputs: BTreeMap<String, PropertyValue>,
}

impl Stack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares a resource node.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::DuplicateId` if `logical_id` is already declared.
    pub fn declare(
        &mut self,
        kind: impl Into<String>,
        logical_id: impl Into<String>,
        properties: BTreeMap<String, PropertyValue>,
        removal_policy: RemovalPolicy,
    ) -> Result<&mut ResourceNode> {
        let logical_id = logical_id.into();
        if self.index.contains_key(&logical_id) {
            return Err(ModelError::DuplicateId {
                stack: self.name.clone(),
                logical_id,
            }
            .into());
        }

        let position = self.nodes.len();
        self.index.insert(logical_id.clone(), position);
        self.nodes
            .push(ResourceNode::new(kind, logical_id, properties, removal_policy));
        Ok(&mut self.nodes[position])
    }

    /// Records that `dependent` must wait for `dependency`.
    ///
    /// The dependency may name a node that is no longer declared; the
    /// planner checks it against previous state.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::UnknownNode` if `dependent` is not declared.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) -> Result<()> {
        let node = self.node_mut(dependent)?;
        if !node.depends_on.iter().any(|d| d == dependency) {
            node.depends_on.push(dependency.to_string());
        }
        Ok(())
    }

    /// Attaches a lifecycle hook to a custom resource node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or not a custom resource.
    pub fn attach_hook(&mut self, logical_id: &str, hook: LifecycleHook) -> Result<()> {
        let node = self.node_mut(logical_id)?;
        if !node.is_custom_resource() {
            return Err(ModelError::InvalidHookKind {
                logical_id: logical_id.to_string(),
                kind: node.kind.clone(),
            }
            .into());
        }
        node.hook = Some(hook);
        Ok(())
    }

    /// Declares a named stack output, evaluated after deployment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateName` if the output already exists.
    pub fn add_output(&mut self, name: impl Into<String>, value: PropertyValue) -> Result<()> {
        let name = name.into();
        if self.outputs.contains_key(&name) {
            return Err(ConfigError::DuplicateName {
                resource_type: format!("output of stack {}", self.name),
                name,
            }
            .into());
        }
        self.outputs.insert(name, value);
        Ok(())
    }

    /// Declares an ordering dependency on another stack without consuming
    /// any of its outputs.
    pub fn depend_on_stack(&mut self, stack: impl Into<String>) {
        let stack = stack.into();
        if !self.depends_on_stacks.contains(&stack) {
            self.depends_on_stacks.push(stack);
        }
    }

    fn node_mut(&mut self, logical_id: &str) -> Result<&mut ResourceNode> {
        match self.index.get(logical_id) {
            Some(&i) => Ok(&mut self.nodes[i]),
            None => Err(ModelError::UnknownNode {
                stack: self.name.clone(),
                logical_id: logical_id.to_string(),
            }
            .into()),
        }
    }

    /// Stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, logical_id: &str) -> Option<&ResourceNode> {
        self.index.get(logical_id).map(|&i| &self.nodes[i])
    }

    /// Declaration index of a node.
    #[must_use]
    pub fn position(&self, logical_id: &str) -> Option<usize> {
        self.index.get(logical_id).copied()
    }

    /// Declared outputs.
    #[must_use]
    pub const fn outputs(&self) -> &BTreeMap<String, PropertyValue> {
        &self.outputs
    }

    /// Explicit stack dependencies.
    #[must_use]
    pub fn depends_on_stacks(&self) -> &[String] {
        &self.depends_on_stacks
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no node is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stacks whose outputs this stack imports.
    #[must_use]
    pub fn imported_stacks(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(ResourceNode::imports)
            .chain(self.outputs.values().flat_map(PropertyValue::imports))
            .map(|o| o.stack.clone())
            .collect()
    }

    /// Every stack that must complete before this one.
    #[must_use]
    pub fn upstream_stacks(&self) -> BTreeSet<String> {
        let mut upstream = self.imported_stacks();
        upstream.extend(self.depends_on_stacks.iter().cloned());
        upstream.remove(&self.name);
        upstream
    }

    /// Convenience for building literal property maps in code.
    #[must_use]
    pub fn literal_properties<I, K>(entries: I) -> BTreeMap<String, PropertyValue>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        entries
            .into_iter()
            .map(|(k, v)| (k.into(), PropertyValue::Literal(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use crate::hooks::LifecycleHook;
    use crate::model::resource::CUSTOM_RESOURCE_KIND;
    use serde_json::json;

    #[test]
    fn test_declare_rejects_duplicate_id() {
        let mut stack = Stack::new("AuthStack");
        stack
            .declare("cognito-user-pool", "UserPool", BTreeMap::new(), RemovalPolicy::Destroy)
            .unwrap();
        let err = stack
            .declare("cognito-user-pool", "UserPool", BTreeMap::new(), RemovalPolicy::Destroy)
            .unwrap_err();

        match err {
            DeployError::Model(ModelError::DuplicateId { stack, logical_id }) => {
                assert_eq!(stack, "AuthStack");
                assert_eq!(logical_id, "UserPool");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hook_only_on_custom_resources() {
        let mut stack = Stack::new("DataStack");
        stack
            .declare("s3-bucket", "Bucket", BTreeMap::new(), RemovalPolicy::Destroy)
            .unwrap();
        stack
            .declare(CUSTOM_RESOURCE_KIND, "Trigger", BTreeMap::new(), RemovalPolicy::Destroy)
            .unwrap();

        assert!(stack.attach_hook("Bucket", LifecycleHook::noop()).is_err());
        assert!(stack.attach_hook("Trigger", LifecycleHook::noop()).is_ok());
        assert!(stack.node("Trigger").unwrap().is_hook());
    }

    #[test]
    fn test_add_dependency_dedups() {
        let mut stack = Stack::new("DataStack");
        stack
            .declare("s3-deployment", "Upload", BTreeMap::new(), RemovalPolicy::Destroy)
            .unwrap();
        stack
            .declare(CUSTOM_RESOURCE_KIND, "Trigger", BTreeMap::new(), RemovalPolicy::Destroy)
            .unwrap();
        stack.add_dependency("Trigger", "Upload").unwrap();
        stack.add_dependency("Trigger", "Upload").unwrap();

        assert_eq!(stack.node("Trigger").unwrap().depends_on, vec!["Upload"]);
        assert!(stack.add_dependency("Missing", "Upload").is_err());
    }

    #[test]
    fn test_upstream_stacks() {
        let mut stack = Stack::new("APIStack");
        let mut props = Stack::literal_properties([("runtime", json!("python3.12"))]);
        props.insert("userPoolId".into(), PropertyValue::import("AuthStack", "userPoolId"));
        props.insert("table".into(), PropertyValue::import("DataStack", "tableName"));
        stack
            .declare("lambda-function", "Handler", props, RemovalPolicy::Destroy)
            .unwrap();
        stack.depend_on_stack("RedshiftStack");

        let upstream: Vec<_> = stack.upstream_stacks().into_iter().collect();
        assert_eq!(upstream, vec!["AuthStack", "DataStack", "RedshiftStack"]);
    }

    #[test]
    fn test_duplicate_output() {
        let mut stack = Stack::new("WebAclStack");
        stack
            .add_output("webAclArn", PropertyValue::reference("WebAcl", "arn"))
            .unwrap();
        assert!(
            stack
                .add_output("webAclArn", PropertyValue::reference("WebAcl", "arn"))
                .is_err()
        );
    }
}
