//! Hook definitions and the handler wire format.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::model::ResolvedProperties;

const fn default_timeout_secs() -> u64 {
    300
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Lifecycle hook attached to a custom resource.
///
/// `handler` applies to every operation unless `on_create`, `on_update` or
/// `on_delete` overrides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LifecycleHook {
    /// Handler for operations without a specific one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerSpec>,
    /// Create handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_create: Option<HandlerSpec>,
    /// Update handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<HandlerSpec>,
    /// Delete handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<HandlerSpec>,
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: u64,
    /// Total handler calls allowed, first one included.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// First backoff delay.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl LifecycleHook {
    /// Hook using one handler for every operation.
    #[must_use]
    pub fn new(handler: HandlerSpec) -> Self {
        Self {
            handler: Some(handler),
            on_create: None,
            on_update: None,
            on_delete: None,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    /// Hook that succeeds without doing anything.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(HandlerSpec::Static {
            outputs: BTreeMap::new(),
        })
    }

    /// Handler selected for an operation.
    #[must_use]
    pub fn handler_for(&self, operation: HookOperation) -> Option<&HandlerSpec> {
        let specific = match operation {
            HookOperation::Create => self.on_create.as_ref(),
            HookOperation::Update => self.on_update.as_ref(),
            HookOperation::Delete => self.on_delete.as_ref(),
        };
        specific.or(self.handler.as_ref())
    }
}

/// How a hook handler is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerSpec {
    /// Local process: request JSON on stdin, response JSON on stdout.
    Command {
        /// Program to run.
        program: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Webhook receiving the request JSON as a POST body.
    Http {
        /// Endpoint URL.
        url: String,
        /// Extra headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Fixed outputs, no side effect.
    Static {
        /// Outputs returned on every call.
        #[serde(default)]
        outputs: BTreeMap<String, Value>,
    },
}

impl HandlerSpec {
    /// Short type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Http { .. } => "http",
            Self::Static { .. } => "static",
        }
    }
}

/// Operation a hook handler is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookOperation {
    /// Node is created.
    Create,
    /// Node is updated.
    Update,
    /// Node is deleted.
    Delete,
}

impl fmt::Display for HookOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "Create"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
        }
    }
}

/// Everything a handler gets besides the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPayload {
    /// Hook-bearing node.
    pub logical_id: String,
    /// Owning stack.
    pub stack: String,
    /// Resolved properties.
    pub properties: ResolvedProperties,
    /// Properties of the previous apply, on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_properties: Option<ResolvedProperties>,
}

/// Request sent to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    /// Requested operation.
    pub operation: HookOperation,
    /// Payload, identical across retries.
    #[serde(flatten)]
    pub payload: HookPayload,
}

/// Handler verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStatus {
    /// Operation done.
    Success,
    /// Operation failed.
    Failure,
}

/// Why a handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No answer in time.
    Timeout,
    /// Rate limited.
    Throttling,
    /// Input rejected.
    Validation,
    /// Not allowed.
    PermissionDenied,
    /// Anything else.
    Internal,
}

impl FailureKind {
    /// Transient kinds are retried.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Throttling)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Timeout => "timeout",
            Self::Throttling => "throttling",
            Self::Validation => "validation",
            Self::PermissionDenied => "permission_denied",
            Self::Internal => "internal",
        };
        write!(f, "{kind}")
    }
}

/// Response returned by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    /// Verdict.
    pub status: HookStatus,
    /// Outputs merged into the node's outputs.
    #[serde(default)]
    pub outputs: ResolvedProperties,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Failure kind; a failure without one is permanent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl HookResponse {
    /// Successful response.
    #[must_use]
    pub const fn success(outputs: ResolvedProperties) -> Self {
        Self {
            status: HookStatus::Success,
            outputs,
            error_message: None,
            failure_kind: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: HookStatus::Failure,
            outputs: ResolvedProperties::new(),
            error_message: Some(message.into()),
            failure_kind: Some(kind),
        }
    }
}

/// State of one hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookState {
    /// Waiting to be called.
    Pending,
    /// Handler call in flight.
    Running,
    /// Handler reported success.
    Succeeded,
    /// Retryable failure.
    FailedTransient,
    /// Terminal failure.
    FailedPermanent,
}

impl fmt::Display for HookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedTransient => "failed(transient)",
            Self::FailedPermanent => "failed(permanent)",
        };
        write!(f, "{state}")
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookTransition {
    /// New state.
    pub state: HookState,
    /// Attempt number (1-based).
    pub attempt: u32,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Failure detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of a successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    /// Hook-bearing node.
    pub logical_id: String,
    /// Operation performed.
    pub operation: HookOperation,
    /// Final state.
    pub state: HookState,
    /// Outputs returned by the handler.
    pub outputs: ResolvedProperties,
    /// Handler calls made.
    pub attempts: u32,
    /// Every state change, in order.
    pub transitions: Vec<HookTransition>,
}

impl HookResult {
    /// True if the hook succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == HookState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use validator::Validate;

    #[test]
    fn test_request_wire_format() {
        let request = HookRequest {
            operation: HookOperation::Update,
            payload: HookPayload {
                logical_id: "CrawlerTrigger".into(),
                stack: "DataStack".into(),
                properties: ResolvedProperties::from([("crawler".to_string(), json!("nlq-crawler"))]),
                previous_properties: Some(ResolvedProperties::new()),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["operation"], "Update");
        assert_eq!(value["logicalId"], "CrawlerTrigger");
        assert_eq!(value["properties"]["crawler"], "nlq-crawler");
        assert!(value.get("previousProperties").is_some());
    }

    #[test]
    fn test_response_parsing() {
        let ok: HookResponse =
            serde_json::from_value(json!({"status": "success", "outputs": {"rows": 10}})).unwrap();
        assert_eq!(ok.status, HookStatus::Success);
        assert_eq!(ok.outputs["rows"], 10);

        let failed: HookResponse = serde_json::from_value(json!({
            "status": "failure",
            "errorMessage": "slow down",
            "failureKind": "throttling"
        }))
        .unwrap();
        assert_eq!(failed.failure_kind, Some(FailureKind::Throttling));
        assert!(FailureKind::Throttling.is_transient());
        assert!(!FailureKind::PermissionDenied.is_transient());
    }

    #[test]
    fn test_handler_selection() {
        let mut hook = LifecycleHook::noop();
        hook.on_delete = Some(HandlerSpec::Command {
            program: "cleanup".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        });
        assert_eq!(hook.handler_for(HookOperation::Create).map(HandlerSpec::type_name), Some("static"));
        assert_eq!(hook.handler_for(HookOperation::Delete).map(HandlerSpec::type_name), Some("command"));

        hook.handler = None;
        assert!(hook.handler_for(HookOperation::Update).is_none());
    }

    #[test]
    fn test_hook_yaml_defaults_and_ranges() {
        let hook: LifecycleHook = serde_yaml::from_str(
            "handler:\n  type: http\n  url: https://hooks.internal/crawl\nmax_attempts: 5\n",
        )
        .unwrap();
        assert_eq!(hook.timeout_secs, 300);
        assert_eq!(hook.max_attempts, 5);
        assert!(hook.validate().is_ok());

        let mut bad = hook;
        bad.max_attempts = 0;
        bad.timeout_secs = 0;
        let errors = bad.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("max_attempts"));
        assert!(errors.field_errors().contains_key("timeout_secs"));
    }
}
