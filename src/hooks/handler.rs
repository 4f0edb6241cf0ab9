//! Hook handler implementations.
//!
//! Handlers never return errors: transport problems are mapped onto a
//! failure kind so the dispatcher can decide whether to retry.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::types::{FailureKind, HandlerSpec, HookRequest, HookResponse};
use crate::error::HookError;

/// External hook handler boundary.
#[async_trait]
pub trait HookHandler: Send + Sync + std::fmt::Debug {
    /// Performs one call.
    async fn handle(&self, request: &HookRequest) -> HookResponse;

    /// Handler type, for logs.
    fn name(&self) -> &'static str;
}

/// Runs a local program with the request on stdin.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandHandler {
    /// Creates a command handler.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            program: program.into(),
            args,
            env,
            working_dir: None,
        }
    }

    /// Runs the program from `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl HookHandler for CommandHandler {
    async fn handle(&self, request: &HookRequest) -> HookResponse {
        let payload = match serde_json::to_vec(request) {
            Ok(p) => p,
            Err(e) => return HookResponse::failure(FailureKind::Internal, format!("cannot encode request: {e}")),
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return HookResponse::failure(
                    FailureKind::Internal,
                    format!("failed to spawn '{}': {e}", self.program),
                );
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // a handler may exit without reading its input
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(program = %self.program, error = %e, "Hook stdin closed early");
            }
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => return HookResponse::failure(FailureKind::Internal, format!("wait failed: {e}")),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if let Ok(response) = serde_json::from_str::<HookResponse>(stdout) {
            return response;
        }

        if output.status.success() && stdout.is_empty() {
            return HookResponse::success(BTreeMap::new());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if output.status.success() {
            format!("unparsable response: {stdout}")
        } else {
            format!("exited with {}: {}", output.status, stderr.trim())
        };
        HookResponse::failure(FailureKind::Internal, detail)
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// POSTs the request to a webhook.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl HttpHandler {
    /// Creates an HTTP handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nlq-deploy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            headers,
        })
    }

    fn classify(status: StatusCode) -> FailureKind {
        match status {
            StatusCode::TOO_MANY_REQUESTS => FailureKind::Throttling,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::PermissionDenied,
            s if s.is_server_error() => FailureKind::Timeout,
            _ => FailureKind::Validation,
        }
    }
}

#[async_trait]
impl HookHandler for HttpHandler {
    async fn handle(&self, request: &HookRequest) -> HookResponse {
        let mut builder = self.client.post(&self.url).json(request);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return HookResponse::failure(FailureKind::Timeout, format!("transport error: {e}")),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            if body.trim().is_empty() {
                return HookResponse::success(BTreeMap::new());
            }
            return serde_json::from_str(&body).unwrap_or_else(|e| {
                HookResponse::failure(FailureKind::Internal, format!("unparsable response: {e}"))
            });
        }

        HookResponse::failure(Self::classify(status), format!("HTTP {status}: {}", body.trim()))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Returns fixed outputs.
#[derive(Debug, Clone, Default)]
pub struct StaticHandler {
    outputs: BTreeMap<String, Value>,
}

impl StaticHandler {
    /// Creates a static handler.
    #[must_use]
    pub const fn new(outputs: BTreeMap<String, Value>) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl HookHandler for StaticHandler {
    async fn handle(&self, _request: &HookRequest) -> HookResponse {
        HookResponse::success(self.outputs.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Builds handlers from specs, with optional per-node overrides.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    overrides: HashMap<String, Arc<dyn HookHandler>>,
    working_dir: Option<PathBuf>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Command handlers run from `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Uses `handler` for `logical_id` regardless of its spec.
    pub fn register(&mut self, logical_id: impl Into<String>, handler: Arc<dyn HookHandler>) {
        self.overrides.insert(logical_id.into(), handler);
    }

    /// Handler for a node and spec.
    ///
    /// # Errors
    ///
    /// Returns `HookError::Permanent` if an HTTP client cannot be built.
    pub fn resolve(&self, logical_id: &str, spec: &HandlerSpec) -> Result<Arc<dyn HookHandler>, HookError> {
        if let Some(handler) = self.overrides.get(logical_id) {
            return Ok(Arc::clone(handler));
        }

        Ok(match spec {
            HandlerSpec::Command { program, args, env } => {
                let mut handler = CommandHandler::new(program.clone(), args.clone(), env.clone());
                if let Some(dir) = &self.working_dir {
                    handler = handler.with_working_dir(dir.clone());
                }
                Arc::new(handler)
            }
            HandlerSpec::Http { url, headers } => {
                let handler = HttpHandler::new(url.clone(), headers.clone()).map_err(|e| HookError::Permanent {
                    logical_id: logical_id.to_string(),
                    attempts: 0,
                    kind: FailureKind::Internal.to_string(),
                    message: format!("cannot build HTTP client: {e}"),
                })?;
                Arc::new(handler)
            }
            HandlerSpec::Static { outputs } => Arc::new(StaticHandler::new(outputs.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::{HookOperation, HookPayload, HookStatus};
    use crate::model::ResolvedProperties;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> HookRequest {
        HookRequest {
            operation: HookOperation::Create,
            payload: HookPayload {
                logical_id: "CrawlerTrigger".into(),
                stack: "DataStack".into(),
                properties: ResolvedProperties::from([("crawler".to_string(), json!("nlq-crawler"))]),
                previous_properties: None,
            },
        }
    }

    async fn respond_with(status: u16) -> HookResponse {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;
        let handler = HttpHandler::new(format!("{}/hook", server.uri()), BTreeMap::new()).unwrap();
        handler.handle(&request()).await
    }

    #[tokio::test]
    async fn test_http_success_returns_outputs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({"operation": "Create", "logicalId": "CrawlerTrigger"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "success", "outputs": {"started": true}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let handler = HttpHandler::new(format!("{}/hook", server.uri()), BTreeMap::new()).unwrap();
        let response = handler.handle(&request()).await;

        assert_eq!(response.status, HookStatus::Success);
        assert_eq!(response.outputs["started"], json!(true));
    }

    #[tokio::test]
    async fn test_http_429_is_throttling() {
        let response = respond_with(429).await;
        assert_eq!(response.failure_kind, Some(FailureKind::Throttling));
        assert!(response.failure_kind.is_some_and(FailureKind::is_transient));
    }

    #[tokio::test]
    async fn test_http_403_is_permission_denied() {
        let response = respond_with(403).await;
        assert_eq!(response.failure_kind, Some(FailureKind::PermissionDenied));
        assert!(!response.failure_kind.is_some_and(FailureKind::is_transient));
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        assert_eq!(respond_with(503).await.failure_kind, Some(FailureKind::Timeout));
        assert_eq!(respond_with(400).await.failure_kind, Some(FailureKind::Validation));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_round_trip() {
        let handler = CommandHandler::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat >/dev/null; echo '{"status":"success","outputs":{"loaded":42}}'"#.into(),
            ],
            BTreeMap::new(),
        );
        let response = handler.handle(&request()).await;
        assert_eq!(response.status, HookStatus::Success);
        assert_eq!(response.outputs["loaded"], json!(42));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_sees_request_on_stdin() {
        let handler = CommandHandler::new(
            "sh",
            vec![
                "-c".into(),
                r#"grep -q CrawlerTrigger && echo '{"status":"success"}' || echo '{"status":"failure","failureKind":"validation"}'"#
                    .into(),
            ],
            BTreeMap::new(),
        );
        assert_eq!(handler.handle(&request()).await.status, HookStatus::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_nonzero_exit_is_permanent() {
        let handler = CommandHandler::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()], BTreeMap::new());
        let response = handler.handle(&request()).await;
        assert_eq!(response.status, HookStatus::Failure);
        assert_eq!(response.failure_kind, Some(FailureKind::Internal));
        assert!(response.error_message.unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn test_registry_prefers_override() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "ParamReader",
            Arc::new(StaticHandler::new(BTreeMap::from([("arn".to_string(), json!("override"))]))),
        );
        let spec = HandlerSpec::Static {
            outputs: BTreeMap::from([("arn".to_string(), json!("spec"))]),
        };

        let handler = registry.resolve("ParamReader", &spec).unwrap();
        assert_eq!(handler.handle(&request()).await.outputs["arn"], json!("override"));

        let handler = registry.resolve("Other", &spec).unwrap();
        assert_eq!(handler.name(), "static");
        assert_eq!(handler.handle(&request()).await.outputs["arn"], json!("spec"));
    }
}
