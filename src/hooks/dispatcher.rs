//! Lifecycle hook dispatcher.
//!
//! Each invocation runs the state machine
//! `Pending -> Running -> {Succeeded, FailedTransient, FailedPermanent}`.
//! A transient failure loops back to `Pending` until the attempt budget is
//! spent. The request is built once and reused on every attempt, so
//! handlers see an identical payload when retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::handler::{HandlerRegistry, HookHandler};
use super::types::{
    FailureKind, HookOperation, HookPayload, HookRequest, HookResponse, HookResult, HookState,
    HookStatus, HookTransition, LifecycleHook,
};
use crate::error::HookError;
use crate::retry::{jittered, next_delay};

/// Retry budget and timing of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total handler calls allowed.
    pub max_attempts: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl From<&LifecycleHook> for RetryPolicy {
    fn from(hook: &LifecycleHook) -> Self {
        Self {
            max_attempts: hook.max_attempts.max(1),
            timeout: Duration::from_secs(hook.timeout_secs),
            initial_backoff: Duration::from_millis(hook.initial_backoff_ms),
            max_backoff: Duration::from_millis(hook.max_backoff_ms),
        }
    }
}

fn record(
    transitions: &mut Vec<HookTransition>,
    logical_id: &str,
    state: HookState,
    attempt: u32,
    message: Option<String>,
) {
    debug!(logical_id, %state, attempt, "Hook transition");
    transitions.push(HookTransition {
        state,
        attempt,
        at: Utc::now(),
        message,
    });
}

/// Invokes lifecycle hooks with timeout and retry.
#[derive(Debug, Clone, Default)]
pub struct HookDispatcher {
    registry: HandlerRegistry,
}

impl HookDispatcher {
    /// Creates a dispatcher over a handler registry.
    #[must_use]
    pub const fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Invokes the handler `hook` declares for `operation`.
    ///
    /// # Errors
    ///
    /// `HookError::Timeout` or `HookError::Transient` when the retry budget
    /// runs out, `HookError::Permanent` on a permanent failure, and
    /// `HookError::MissingHandler` if no handler covers `operation`.
    pub async fn invoke(
        &self,
        hook: &LifecycleHook,
        operation: HookOperation,
        payload: &HookPayload,
    ) -> Result<HookResult, HookError> {
        let spec = hook
            .handler_for(operation)
            .ok_or_else(|| HookError::MissingHandler {
                logical_id: payload.logical_id.clone(),
                operation: operation.to_string(),
            })?;
        let handler = self.registry.resolve(&payload.logical_id, spec)?;
        let request = HookRequest {
            operation,
            payload: payload.clone(),
        };
        self.invoke_with(handler, RetryPolicy::from(hook), &request).await
    }

    /// Runs the state machine against a given handler.
    ///
    /// # Errors
    ///
    /// See [`HookDispatcher::invoke`].
    pub async fn invoke_with(
        &self,
        handler: Arc<dyn HookHandler>,
        policy: RetryPolicy,
        request: &HookRequest,
    ) -> Result<HookResult, HookError> {
        let logical_id = request.payload.logical_id.as_str();
        let max_attempts = policy.max_attempts.max(1);
        let mut transitions: Vec<HookTransition> = Vec::new();

        let mut backoff = policy.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            record(&mut transitions, logical_id, HookState::Pending, attempt, None);
            record(&mut transitions, logical_id, HookState::Running, attempt, None);

            let response = match tokio::time::timeout(policy.timeout, handler.handle(request)).await {
                Ok(response) => response,
                Err(_) => HookResponse::failure(
                    FailureKind::Timeout,
                    format!("no response within {}s", policy.timeout.as_secs_f64()),
                ),
            };

            if response.status == HookStatus::Success {
                record(&mut transitions, logical_id, HookState::Succeeded, attempt, None);
                info!(
                    logical_id,
                    operation = %request.operation,
                    handler = handler.name(),
                    attempts = attempt,
                    "Hook succeeded"
                );
                return Ok(HookResult {
                    logical_id: logical_id.to_string(),
                    operation: request.operation,
                    state: HookState::Succeeded,
                    outputs: response.outputs,
                    attempts: attempt,
                    transitions,
                });
            }

            let kind = response.failure_kind.unwrap_or(FailureKind::Internal);
            let message = response
                .error_message
                .unwrap_or_else(|| "handler reported failure".to_string());

            if !kind.is_transient() {
                record(&mut transitions, logical_id, HookState::FailedPermanent, attempt, Some(message.clone()));
                warn!(logical_id, %kind, attempt, error = %message, "Hook failed permanently");
                return Err(HookError::Permanent {
                    logical_id: logical_id.to_string(),
                    attempts: attempt,
                    kind: kind.to_string(),
                    message,
                });
            }

            record(&mut transitions, logical_id, HookState::FailedTransient, attempt, Some(message.clone()));

            if attempt >= max_attempts {
                record(&mut transitions, logical_id, HookState::FailedPermanent, attempt, Some(message.clone()));
                warn!(logical_id, %kind, attempt, error = %message, "Hook retry budget exhausted");
                return Err(if kind == FailureKind::Timeout {
                    HookError::Timeout {
                        logical_id: logical_id.to_string(),
                        attempts: attempt,
                        message,
                    }
                } else {
                    HookError::Transient {
                        logical_id: logical_id.to_string(),
                        attempts: attempt,
                        message,
                    }
                });
            }

            let delay = jittered(backoff);
            warn!(
                logical_id,
                %kind,
                attempt,
                delay_ms = delay.as_millis(),
                error = %message,
                "Hook failed transiently, retrying"
            );
            tokio::time::sleep(delay).await;
            backoff = next_delay(backoff, 2.0, policy.max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::handler::StaticHandler;
    use crate::hooks::types::HandlerSpec;
    use crate::model::ResolvedProperties;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Replays scripted responses and records every request it sees.
    #[derive(Debug)]
    struct ScriptedHandler {
        script: Mutex<Vec<HookResponse>>,
        seen: Mutex<Vec<HookRequest>>,
        delay: Duration,
    }

    impl ScriptedHandler {
        fn new(script: Vec<HookResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> Vec<HookRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HookHandler for ScriptedHandler {
        async fn handle(&self, request: &HookRequest) -> HookResponse {
            self.seen.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                HookResponse::success(ResolvedProperties::new())
            } else {
                script.remove(0)
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn request() -> HookRequest {
        HookRequest {
            operation: HookOperation::Create,
            payload: HookPayload {
                logical_id: "DataLoader".into(),
                stack: "RedshiftStack".into(),
                properties: ResolvedProperties::from([("bucket".to_string(), json!("sample-data"))]),
                previous_properties: None,
            },
        }
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_success() {
        let handler = ScriptedHandler::new(vec![
            HookResponse::failure(FailureKind::Throttling, "slow down"),
            HookResponse::failure(FailureKind::Timeout, "busy"),
            HookResponse::success(ResolvedProperties::from([("rows".to_string(), json!(1000))])),
        ]);
        let dispatcher = HookDispatcher::default();

        let result = dispatcher
            .invoke_with(handler.clone(), policy(3), &request())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.outputs["rows"], json!(1000));

        let calls = handler.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| *c == request()));

        let states: Vec<_> = result.transitions.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                HookState::Pending,
                HookState::Running,
                HookState::FailedTransient,
                HookState::Pending,
                HookState::Running,
                HookState::FailedTransient,
                HookState::Pending,
                HookState::Running,
                HookState::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let handler = ScriptedHandler::new(vec![HookResponse::failure(
            FailureKind::PermissionDenied,
            "AccessDenied",
        )]);
        let err = HookDispatcher::default()
            .invoke_with(handler.clone(), policy(5), &request())
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Permanent { attempts: 1, .. }));
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_without_kind_is_permanent() {
        let mut response = HookResponse::failure(FailureKind::Internal, "x");
        response.failure_kind = None;
        let handler = ScriptedHandler::new(vec![response]);

        let err = HookDispatcher::default()
            .invoke_with(handler, policy(3), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Permanent { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_throttling_is_transient_error() {
        let handler = ScriptedHandler::new(vec![
            HookResponse::failure(FailureKind::Throttling, "1"),
            HookResponse::failure(FailureKind::Throttling, "2"),
        ]);
        let err = HookDispatcher::default()
            .invoke_with(handler.clone(), policy(2), &request())
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Transient { attempts: 2, .. }));
        assert_eq!(handler.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_enforced_and_reported() {
        let handler = Arc::new(ScriptedHandler {
            script: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
            delay: Duration::from_millis(200),
        });
        let mut policy = policy(2);
        policy.timeout = Duration::from_millis(20);

        let err = HookDispatcher::default()
            .invoke_with(handler.clone(), policy, &request())
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Timeout { attempts: 2, .. }));
        assert_eq!(handler.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_invoke_selects_operation_handler() {
        let mut hook = LifecycleHook::new(HandlerSpec::Static {
            outputs: BTreeMap::from([("phase".to_string(), json!("any"))]),
        });
        hook.on_delete = Some(HandlerSpec::Static {
            outputs: BTreeMap::from([("phase".to_string(), json!("cleanup"))]),
        });
        let dispatcher = HookDispatcher::default();
        let payload = request().payload;

        let created = dispatcher.invoke(&hook, HookOperation::Create, &payload).await.unwrap();
        assert_eq!(created.outputs["phase"], json!("any"));
        let deleted = dispatcher.invoke(&hook, HookOperation::Delete, &payload).await.unwrap();
        assert_eq!(deleted.outputs["phase"], json!("cleanup"));
        assert_eq!(deleted.operation, HookOperation::Delete);
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let mut hook = LifecycleHook::noop();
        hook.handler = None;
        let err = HookDispatcher::default()
            .invoke(&hook, HookOperation::Update, &request().payload)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::MissingHandler { .. }));
    }

    #[tokio::test]
    async fn test_registry_override_is_used() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "DataLoader",
            Arc::new(StaticHandler::new(BTreeMap::from([("loaded".to_string(), json!(true))]))),
        );
        let dispatcher = HookDispatcher::new(registry);
        let result = dispatcher
            .invoke(&LifecycleHook::noop(), HookOperation::Create, &request().payload)
            .await
            .unwrap();
        assert_eq!(result.outputs["loaded"], json!(true));
    }
}
