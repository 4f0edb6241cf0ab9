//! Descriptor validation.
//!
//! Checks names, hook placement and settings, removal-policy guards and
//! execution ranges, then builds the model and both dependency graphs so
//! cycles and unknown stacks are reported before any plan runs.

use std::collections::HashSet;

use tracing::debug;
use validator::Validate;

use super::spec::{DeployDescriptor, ProjectConfig, ResourceSpec, StackSpec, StateBackend, StateConfig};
use crate::error::{ConfigError, DeployError, Result};
use crate::graph::build_graph;
use crate::hooks::HookOperation;
use crate::model::{CUSTOM_RESOURCE_KIND, RemovalPolicy};
use crate::planner::order_stacks;

/// Validator for deployment descriptors.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a descriptor.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings never fail validation.
    pub fn validate(&self, descriptor: &DeployDescriptor) -> Result<ValidationResult> {
        let result = self.check(descriptor);

        if result.errors.is_empty() {
            debug!(warnings = result.warnings.len(), "Descriptor validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(DeployError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, descriptor: &DeployDescriptor) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&descriptor.project, &mut result);
        Self::validate_state(&descriptor.state, &mut result);
        if let Err(e) = descriptor.execution.validate() {
            result.errors.push(ValidationError {
                field: String::from("execution"),
                message: e.to_string(),
            });
        }
        Self::validate_stacks(&descriptor.stacks, &mut result);

        // Graph checks need a well-formed model.
        if result.errors.is_empty() {
            Self::validate_graphs(descriptor, &mut result);
        }
        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {}
        }
    }

    /// Validates all stacks.
    fn validate_stacks(stacks: &[StackSpec], result: &mut ValidationResult) {
        if stacks.is_empty() {
            result.warnings.push(String::from("No stacks defined in descriptor"));
            return;
        }

        let mut seen_names = HashSet::new();
        for (i, stack) in stacks.iter().enumerate() {
            let prefix = format!("stacks[{i}]");

            if !seen_names.insert(&stack.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate stack name: {}", stack.name),
                });
            }

            if !is_valid_identifier(&stack.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Stack name '{}' is invalid. Must start with a letter and use letters, digits, '-' or '_'.",
                        stack.name
                    ),
                });
            }

            Self::validate_resources(stack, &prefix, result);
        }
    }

    /// Validates the resources of one stack.
    fn validate_resources(stack: &StackSpec, prefix: &str, result: &mut ValidationResult) {
        let mut seen_ids = HashSet::new();

        for (i, resource) in stack.resources.iter().enumerate() {
            let field = format!("{prefix}.resources[{i}]");

            if !seen_ids.insert(&resource.id) {
                result.errors.push(ValidationError {
                    field: format!("{field}.id"),
                    message: format!("Duplicate logical id '{}' in stack {}", resource.id, stack.name),
                });
            }

            if !is_valid_identifier(&resource.id) {
                result.errors.push(ValidationError {
                    field: format!("{field}.id"),
                    message: format!(
                        "Logical id '{}' is invalid. Must start with a letter and use letters, digits, '-' or '_'.",
                        resource.id
                    ),
                });
            }

            if resource.kind.is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{field}.kind"),
                    message: format!("Resource '{}' has no kind", resource.id),
                });
            }

            Self::validate_hook(resource, &field, result);
            Self::validate_removal_policy(stack, resource, &field, result);
        }
    }

    /// Validates hook placement and settings.
    fn validate_hook(resource: &ResourceSpec, field: &str, result: &mut ValidationResult) {
        let Some(hook) = &resource.hook else {
            return;
        };

        if resource.kind != CUSTOM_RESOURCE_KIND {
            result.errors.push(ValidationError {
                field: format!("{field}.hook"),
                message: format!(
                    "Resource '{}' of kind '{}' cannot carry a hook; only '{CUSTOM_RESOURCE_KIND}' can",
                    resource.id, resource.kind
                ),
            });
        }

        for operation in [HookOperation::Create, HookOperation::Update, HookOperation::Delete] {
            if hook.handler_for(operation).is_none() {
                result.errors.push(ValidationError {
                    field: format!("{field}.hook"),
                    message: format!("Hook of '{}' has no handler for {operation}", resource.id),
                });
            }
        }

        if let Err(e) = hook.validate() {
            result.errors.push(ValidationError {
                field: format!("{field}.hook"),
                message: e.to_string(),
            });
        }

        if hook.max_attempts == 1 {
            result.warnings.push(format!(
                "{field}.hook: '{}' allows a single attempt, transient failures will not be retried",
                resource.id
            ));
        }
    }

    /// Checks that guarded removal policies have a cleanup hook.
    fn validate_removal_policy(
        stack: &StackSpec,
        resource: &ResourceSpec,
        field: &str,
        result: &mut ValidationResult,
    ) {
        let guarded = resource.depends_on.iter().any(|dep| {
            stack
                .resources
                .iter()
                .any(|r| &r.id == dep && r.hook.is_some())
        });

        match resource.removal_policy {
            RemovalPolicy::RetainUntilExplicitDelete if !guarded => {
                result.errors.push(ValidationError {
                    field: format!("{field}.removal_policy"),
                    message: format!(
                        "'{}' is retain_until_explicit_delete but depends on no cleanup hook",
                        resource.id
                    ),
                });
            }
            RemovalPolicy::Retain if !guarded => {
                result.warnings.push(format!(
                    "{field}.removal_policy: '{}' is retained without a cleanup hook and will outlive destroy",
                    resource.id
                ));
            }
            _ => {}
        }
    }

    /// Builds the model and graphs, reporting cycles and unknown stacks.
    fn validate_graphs(descriptor: &DeployDescriptor, result: &mut ValidationResult) {
        let stacks = match descriptor.build_stacks() {
            Ok(stacks) => stacks,
            Err(e) => {
                result.errors.push(ValidationError {
                    field: String::from("stacks"),
                    message: e.to_string(),
                });
                return;
            }
        };

        for (i, stack) in stacks.iter().enumerate() {
            if let Err(e) = build_graph(stack) {
                result.errors.push(ValidationError {
                    field: format!("stacks[{i}]"),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = order_stacks(&stacks) {
            result.errors.push(ValidationError {
                field: String::from("stacks"),
                message: e.to_string(),
            });
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Stack names and logical ids: a letter, then letters, digits, `-` or `_`.
/// Dots are reserved for `Node.attribute` and `Stack.output`.
fn is_valid_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> DeployDescriptor {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("nlq-chat"));
        assert!(is_valid_name("nlq-demo-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("NLQ-Chat")); // uppercase
        assert!(!is_valid_name("2-nlq")); // starts with number
        assert!(!is_valid_name("nlq_chat")); // underscore
        assert!(!is_valid_name("nlq-")); // ends with hyphen
        assert!(!is_valid_name("nlq--chat")); // consecutive hyphens
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("FrontendWebAclStack"));
        assert!(is_valid_identifier("Workgroup_Cleanup-1"));
        assert!(!is_valid_identifier("Sample.Bucket"));
        assert!(!is_valid_identifier("1Bucket"));
    }

    #[test]
    fn test_guarded_retention() {
        let descriptor = parse(
            r"
project:
  name: nlq-chat
stacks:
  - name: DataStack
    resources:
      - id: WorkgroupCleanup
        kind: custom-resource
        hook:
          handler: { type: static }
      - id: Workgroup
        kind: analytics.workgroup
        removal_policy: retain_until_explicit_delete
        depends_on: [WorkgroupCleanup]
",
        );
        let result = ConfigValidator::new().validate(&descriptor).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_unguarded_retention() {
        let descriptor = parse(
            r"
project:
  name: nlq-chat
stacks:
  - name: DataStack
    resources:
      - id: Workgroup
        kind: analytics.workgroup
        removal_policy: retain_until_explicit_delete
  - name: RedshiftStack
    resources:
      - id: Namespace
        kind: warehouse.namespace
        removal_policy: retain
",
        );
        let result = ConfigValidator::new().check(&descriptor);
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "stacks[0].resources[0].removal_policy");
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("Namespace"));
    }

    #[test]
    fn test_hook_rules() {
        let descriptor = parse(
            r"
project:
  name: nlq-chat
stacks:
  - name: DataStack
    resources:
      - id: Table
        kind: database.table
        hook:
          handler: { type: static }
      - id: CrawlerTrigger
        kind: custom-resource
        hook:
          on_create: { type: static }
          max_attempts: 1
",
        );
        let result = ConfigValidator::new().check(&descriptor);
        // Kind of Table, then update and delete handlers of CrawlerTrigger.
        assert_eq!(result.error_count(), 3);
        assert!(result.errors[0].message.contains("cannot carry a hook"));
        assert!(result.warnings.iter().any(|w| w.contains("single attempt")));
    }

    #[test]
    fn test_duplicate_stack_and_cycle() {
        let duplicate = parse(
            r"
project:
  name: nlq-chat
stacks:
  - name: AuthStack
  - name: AuthStack
",
        );
        let err = ConfigValidator::new().validate(&duplicate).unwrap_err();
        assert!(err.to_string().contains("Duplicate stack name"));

        let cyclic = parse(
            r"
project:
  name: nlq-chat
stacks:
  - name: APIStack
    resources:
      - id: A
        kind: generic
        depends_on: [B]
      - id: B
        kind: generic
        depends_on: [A]
",
        );
        let result = ConfigValidator::new().check(&cyclic);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("Cycle detected"));
    }

    #[test]
    fn test_execution_ranges() {
        let descriptor = parse(
            r"
project:
  name: nlq-chat
execution:
  max_parallelism: 0
stacks: []
",
        );
        let result = ConfigValidator::new().check(&descriptor);
        assert_eq!(result.errors[0].field, "execution");
        assert_eq!(result.warnings, vec![String::from("No stacks defined in descriptor")]);
    }

    #[test]
    fn test_bundled_template() {
        let descriptor = parse(include_str!("../../templates/nlq.deploy.yaml"));
        let result = ConfigValidator::new().check(&descriptor);

        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(descriptor.stacks.len(), 6);
        // The Redshift namespace outlives destroy on purpose.
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("Namespace"));

        let order = crate::planner::order_stacks(&descriptor.build_stacks().unwrap()).unwrap();
        assert_eq!(order.waves[0], vec!["AuthStack", "DataStack", "FrontendWebAclStack"]);
        assert_eq!(order.waves[1], vec!["RedshiftStack"]);
        assert_eq!(order.waves[2], vec!["APIStack"]);
        assert_eq!(order.waves[3], vec!["FrontendStack"]);
    }
}
