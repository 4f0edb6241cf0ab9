//! Error types for the NLQ deployment engine.
//!
//! Errors are layered per concern: descriptor configuration, the resource
//! model, the dependency graph, lifecycle hooks, the cross-stack broker,
//! resource providers, state persistence and plan execution. Everything
//! converts into [`DeployError`].

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the deployment engine.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource model errors.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Lifecycle hook errors.
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    /// Cross-stack value broker errors.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Resource provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Plan execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The descriptor file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The descriptor could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate definition.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Kind of definition (stack, output, ...).
        resource_type: String,
        /// The duplicated name.
        name: String,
    },

    /// A `$ref`, `$import` or `$join` value is malformed.
    #[error("Invalid reference '{value}': {reason}")]
    InvalidReference {
        /// The offending raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Resource model errors raised while declaring stacks.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A logical id was declared twice in the same stack.
    #[error("Duplicate logical id '{logical_id}' in stack '{stack}'")]
    DuplicateId {
        /// Stack being declared.
        stack: String,
        /// The reused logical id.
        logical_id: String,
    },

    /// An operation referred to a node the stack does not declare.
    #[error("Unknown node '{logical_id}' in stack '{stack}'")]
    UnknownNode {
        /// Stack being declared.
        stack: String,
        /// The missing logical id.
        logical_id: String,
    },

    /// A lifecycle hook was attached to a node that is not a custom resource.
    #[error("Node '{logical_id}' of kind '{kind}' cannot carry a lifecycle hook")]
    InvalidHookKind {
        /// Node the hook was attached to.
        logical_id: String,
        /// Kind of that node.
        kind: String,
    },
}

/// Dependency graph errors. These are raised before any side effect.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph is not acyclic.
    #[error("Cycle detected in '{stack}': {}", cycle.join(" -> "))]
    CycleDetected {
        /// Stack (or `<stacks>` for the stack-level graph).
        stack: String,
        /// Full cycle path, first element repeated at the end.
        cycle: Vec<String>,
    },

    /// A node depends on something absent from both desired and previous state.
    #[error("Node '{logical_id}' in '{stack}' depends on unreachable '{missing}'")]
    UnreachableNode {
        /// Stack owning the dependent node.
        stack: String,
        /// The dependent node.
        logical_id: String,
        /// The missing dependency.
        missing: String,
    },
}

/// Lifecycle hook invocation errors.
#[derive(Debug, Error)]
pub enum HookError {
    /// The retry budget ran out and the last attempt timed out.
    #[error("Hook '{logical_id}' timed out after {attempts} attempt(s): {message}")]
    Timeout {
        /// Hook-bearing node.
        logical_id: String,
        /// Number of handler calls made.
        attempts: u32,
        /// Last failure message.
        message: String,
    },

    /// The retry budget ran out on a transient handler failure.
    #[error("Hook '{logical_id}' failed transiently after {attempts} attempt(s): {message}")]
    Transient {
        /// Hook-bearing node.
        logical_id: String,
        /// Number of handler calls made.
        attempts: u32,
        /// Last failure message.
        message: String,
    },

    /// The handler reported a permanent failure.
    #[error("Hook '{logical_id}' failed permanently ({kind}) after {attempts} attempt(s): {message}")]
    Permanent {
        /// Hook-bearing node.
        logical_id: String,
        /// Number of handler calls made.
        attempts: u32,
        /// Failure kind reported by the handler.
        kind: String,
        /// Failure message.
        message: String,
    },

    /// The hook declares no handler for the requested operation.
    #[error("Hook '{logical_id}' has no handler for {operation}")]
    MissingHandler {
        /// Hook-bearing node.
        logical_id: String,
        /// Operation that was requested.
        operation: String,
    },
}

/// Cross-stack value broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The owning stack has not completed its deployment yet.
    #[error("Output '{output}' of stack '{stack}' is not available yet")]
    OutputNotYetAvailable {
        /// Owning stack.
        stack: String,
        /// Requested output.
        output: String,
    },

    /// The owning stack completed but never published that output.
    #[error("Stack '{stack}' has no output named '{output}'")]
    UnknownOutput {
        /// Owning stack.
        stack: String,
        /// Requested output.
        output: String,
    },
}

/// Resource provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The resource does not exist at the provider.
    #[error("Resource not found: {logical_id}")]
    NotFound {
        /// Logical id of the missing resource.
        logical_id: String,
    },

    /// The provider throttled the request.
    #[error("Provider throttled request for {logical_id}")]
    Throttled {
        /// Logical id of the throttled resource.
        logical_id: String,
    },

    /// The provider rejected the request.
    #[error("Provider rejected {logical_id}: {message}")]
    Rejected {
        /// Logical id of the rejected resource.
        logical_id: String,
        /// Rejection message.
        message: String,
    },

    /// Network failure talking to the provider.
    #[error("Network error talking to provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Plan execution errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The session was cancelled before the work completed.
    #[error("Deployment of '{stack}' was cancelled")]
    Cancelled {
        /// Stack being deployed when the cancel arrived.
        stack: String,
    },

    /// The session was aborted.
    #[error("Deployment aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Throttled { .. } | ProviderError::Network { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Throttled { .. }) => Some(1),
            Self::Provider(ProviderError::Network { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if this error was raised while building the plan,
    /// before any side effect.
    #[must_use]
    pub const fn is_plan_time(&self) -> bool {
        matches!(
            self,
            Self::Model(_) | Self::Graph(_) | Self::Broker(_) | Self::Config(_)
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an invalid reference error.
    #[must_use]
    pub fn invalid_reference(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(logical_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            logical_id: logical_id.into(),
            message: message.into(),
        }
    }
}

impl HookError {
    /// Logical id of the hook-bearing node.
    #[must_use]
    pub fn logical_id(&self) -> &str {
        match self {
            Self::Timeout { logical_id, .. }
            | Self::Transient { logical_id, .. }
            | Self::Permanent { logical_id, .. }
            | Self::MissingHandler { logical_id, .. } => logical_id,
        }
    }

    /// Number of handler calls made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Timeout { attempts, .. }
            | Self::Transient { attempts, .. }
            | Self::Permanent { attempts, .. } => *attempts,
            Self::MissingHandler { .. } => 0,
        }
    }
}
