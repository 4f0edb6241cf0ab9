//! Descriptor types for the deployment engine.
//!
//! This module defines the structs that map to `nlq.deploy.yaml`. A
//! descriptor fully describes the desired stacks; `build_stacks` turns it
//! into the resource model.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Result;
use crate::hooks::LifecycleHook;
use crate::model::{PropertyValue, RemovalPolicy, Stack};
use crate::planner::DEFAULT_MAX_PARALLELISM;
use crate::retry::RetryConfig;

/// The root descriptor of an NLQ deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployDescriptor {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared stacks.
    pub stacks: Vec<StackSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Region handed to the provider.
    #[serde(default)]
    pub region: Option<String>,
    /// Account handed to the provider.
    #[serde(default)]
    pub account: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Plan execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Operations in flight per stack.
    #[serde(default = "default_max_parallelism")]
    #[validate(range(min = 1, max = 64))]
    pub max_parallelism: usize,
    /// Provider calls allowed per operation, first one included.
    #[serde(default = "default_provider_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub provider_max_attempts: u32,
    /// First provider retry delay.
    #[serde(default = "default_provider_initial_backoff_ms")]
    #[validate(range(min = 1, max = 60_000))]
    pub provider_initial_backoff_ms: u64,
    /// Keep running independent branches after a failure.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            provider_max_attempts: default_provider_max_attempts(),
            provider_initial_backoff_ms: default_provider_initial_backoff_ms(),
            continue_on_error: false,
        }
    }
}

impl ExecutionConfig {
    /// Retry policy for provider calls.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.provider_max_attempts)
            .with_initial_delay(Duration::from_millis(self.provider_initial_backoff_ms))
    }
}

/// One stack of the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackSpec {
    /// Stack name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stacks that must complete first without any import.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Resource nodes in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    /// Named outputs, evaluated after the stack deploys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, PropertyValue>,
}

/// One resource node of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Logical id, unique in the stack.
    pub id: String,
    /// Opaque kind tag.
    pub kind: String,
    /// Properties, possibly holding `$ref`, `$import` or `$join`.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// What happens when the node leaves the descriptor.
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
    /// Explicit dependencies on nodes of the same stack.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Lifecycle hook, custom resources only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<LifecycleHook>,
}

const fn default_max_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

const fn default_provider_max_attempts() -> u32 {
    3
}

const fn default_provider_initial_backoff_ms() -> u64 {
    200
}

fn default_environment() -> String {
    String::from("dev")
}

impl DeployDescriptor {
    /// Returns the fully qualified project name.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns all stack names in declaration order.
    #[must_use]
    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.name.as_str()).collect()
    }

    /// Looks up a stack by name.
    #[must_use]
    pub fn stack(&self, name: &str) -> Option<&StackSpec> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// Builds the resource model of every stack.
    ///
    /// # Errors
    ///
    /// Returns the first declaration error.
    pub fn build_stacks(&self) -> Result<Vec<Stack>> {
        self.stacks.iter().map(StackSpec::build).collect()
    }
}

impl StackSpec {
    /// Builds the resource model of this stack.
    ///
    /// # Errors
    ///
    /// Duplicate logical ids, explicit dependencies of undeclared nodes,
    /// hooks on non-custom kinds, and duplicate outputs.
    pub fn build(&self) -> Result<Stack> {
        let mut stack = Stack::new(&self.name);
        if let Some(description) = &self.description {
            stack = stack.with_description(description);
        }
        for upstream in &self.depends_on {
            stack.depend_on_stack(upstream);
        }

        for resource in &self.resources {
            stack.declare(
                &resource.kind,
                &resource.id,
                resource.properties.clone(),
                resource.removal_policy,
            )?;
        }

        // Edges and hooks once every id is declared, so order in the file does not matter.
        for resource in &self.resources {
            for dependency in &resource.depends_on {
                stack.add_dependency(&resource.id, dependency)?;
            }
            if let Some(hook) = &resource.hook {
                stack.attach_hook(&resource.id, hook.clone())?;
            }
        }

        for (name, value) in &self.outputs {
            stack.add_output(name, value.clone())?;
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeployError, ModelError};
    use crate::model::{OutputRef, Reference};

    const DATA_STACK: &str = r#"
name: DataStack
resources:
  - id: SampleBucket
    kind: storage.bucket
  - id: Upload
    kind: storage.upload
    properties:
      bucket: { $ref: SampleBucket.name }
  - id: CrawlerTrigger
    kind: custom-resource
    depends_on: [Upload]
    hook:
      handler: { type: static, outputs: { started: true } }
  - id: Workgroup
    kind: analytics.workgroup
    removal_policy: retain_until_explicit_delete
outputs:
  bucketName: { $ref: SampleBucket.name }
"#;

    #[test]
    fn test_stack_spec_build() {
        let spec: StackSpec = serde_yaml::from_str(DATA_STACK).unwrap();
        let stack = spec.build().unwrap();

        assert_eq!(stack.name(), "DataStack");
        assert_eq!(stack.len(), 4);
        let upload = stack.node("Upload").unwrap();
        assert_eq!(
            upload.properties["bucket"],
            PropertyValue::Ref(Reference::new("SampleBucket", "name"))
        );
        let trigger = stack.node("CrawlerTrigger").unwrap();
        assert!(trigger.is_hook());
        assert_eq!(trigger.depends_on, vec!["Upload".to_string()]);
        assert_eq!(
            stack.node("Workgroup").unwrap().removal_policy,
            RemovalPolicy::RetainUntilExplicitDelete
        );
        assert!(stack.outputs().contains_key("bucketName"));
    }

    #[test]
    fn test_hook_on_plain_kind_is_rejected() {
        let spec: StackSpec = serde_yaml::from_str(
            r"
name: AuthStack
resources:
  - id: UserPool
    kind: identity.user-pool
    hook:
      handler: { type: static }
",
        )
        .unwrap();
        let err = spec.build().unwrap_err();
        assert!(matches!(err, DeployError::Model(ModelError::InvalidHookKind { .. })));
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor: DeployDescriptor = serde_yaml::from_str(
            r"
project:
  name: nlq
stacks:
  - name: APIStack
    resources:
      - id: Handler
        kind: compute.function
        properties:
          userPoolId: { $import: AuthStack.userPoolId }
",
        )
        .unwrap();

        assert_eq!(descriptor.project.environment, "dev");
        assert_eq!(descriptor.state.backend, StateBackend::Local);
        assert_eq!(descriptor.execution, ExecutionConfig::default());
        assert_eq!(descriptor.qualified_name(), "nlq-dev");

        let stacks = descriptor.build_stacks().unwrap();
        let imports = stacks[0].node("Handler").unwrap().imports();
        assert_eq!(imports, vec![&OutputRef::new("AuthStack", "userPoolId")]);
    }

    #[test]
    fn test_retry_config_from_execution() {
        let execution = ExecutionConfig {
            provider_max_attempts: 5,
            provider_initial_backoff_ms: 50,
            ..ExecutionConfig::default()
        };
        let retry = execution.retry_config();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
    }
}
