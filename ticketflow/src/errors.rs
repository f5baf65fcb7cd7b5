//! Error types for the ticketflow orchestration core.
//!
//! Every failure that crosses a stage, workflow or recovery boundary is a
//! [`FlowError`]. Errors are `Clone` so they can be stored in batch ledgers
//! and recovery records, and each one renders a diagnostic mapping through
//! `to_dict`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type FlowResult<T> = Result<T, FlowError>;

/// The main error type for ticketflow operations.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// Malformed or missing required input.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A circuit breaker refused the call.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitBreakerOpenError),

    /// An operation exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A transport-level failure (connection refused, reset, DNS, ...).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credentials were rejected by an external service.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// An external dependency reported itself unavailable.
    #[error("Service '{service}' unavailable: {message}")]
    ServiceUnavailable {
        /// The service name.
        service: String,
        /// Details from the service.
        message: String,
    },

    /// The reasoning or code-completion service failed.
    #[error("Reasoning service error: {0}")]
    Llm(String),

    /// Output from a collaborator could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A file could not be read, written or listed.
    #[error("File system error: {0}")]
    FileSystem(String),

    /// Access to a resource was denied.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// A required key was absent from a state or payload.
    #[error("Missing key: {0}")]
    KeyAccess(String),

    /// A value had an unexpected shape.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// A stage failed for a reason not covered by a more specific variant.
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution {
        /// The failing stage.
        stage: String,
        /// The failure message.
        message: String,
    },

    /// The stage does not provide a `process` implementation.
    #[error("Stage '{stage}' does not implement process")]
    NotImplemented {
        /// The stage name.
        stage: String,
    },

    /// A workflow failed while executing.
    #[error("{0}")]
    Workflow(#[from] WorkflowError),

    /// A batch was rejected before execution.
    #[error("{0}")]
    Batch(#[from] BatchProcessingError),

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Coarse classification of a [`FlowError`].
///
/// The recovery engine classifies failures by kind, and the kind name is the
/// `type` recorded in mapping-form states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`FlowError::Validation`].
    Validation,
    /// See [`FlowError::CircuitOpen`].
    CircuitOpen,
    /// See [`FlowError::Timeout`].
    Timeout,
    /// See [`FlowError::Connection`].
    Connection,
    /// See [`FlowError::Authentication`].
    Authentication,
    /// See [`FlowError::ServiceUnavailable`].
    ServiceUnavailable,
    /// See [`FlowError::Llm`].
    Llm,
    /// See [`FlowError::Parse`].
    Parse,
    /// See [`FlowError::FileSystem`].
    FileSystem,
    /// See [`FlowError::Permission`].
    Permission,
    /// See [`FlowError::KeyAccess`].
    KeyAccess,
    /// See [`FlowError::TypeMismatch`].
    TypeMismatch,
    /// See [`FlowError::StageExecution`].
    StageExecution,
    /// See [`FlowError::NotImplemented`].
    NotImplemented,
    /// See [`FlowError::Workflow`].
    Workflow,
    /// See [`FlowError::Batch`].
    Batch,
    /// See [`FlowError::Cancelled`].
    Cancelled,
    /// See [`FlowError::Config`].
    Config,
    /// See [`FlowError::Serialization`].
    Serialization,
    /// See [`FlowError::Internal`].
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 20] = [
        Self::Validation,
        Self::CircuitOpen,
        Self::Timeout,
        Self::Connection,
        Self::Authentication,
        Self::ServiceUnavailable,
        Self::Llm,
        Self::Parse,
        Self::FileSystem,
        Self::Permission,
        Self::KeyAccess,
        Self::TypeMismatch,
        Self::StageExecution,
        Self::NotImplemented,
        Self::Workflow,
        Self::Batch,
        Self::Cancelled,
        Self::Config,
        Self::Serialization,
        Self::Internal,
    ];

    /// Returns the stable name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Llm => "llm",
            Self::Parse => "parse",
            Self::FileSystem => "file_system",
            Self::Permission => "permission",
            Self::KeyAccess => "key_access",
            Self::TypeMismatch => "type_mismatch",
            Self::StageExecution => "stage_execution",
            Self::NotImplemented => "not_implemented",
            Self::Workflow => "workflow",
            Self::Batch => "batch",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Serialization => "serialization",
            Self::Internal => "internal",
        }
    }

    /// Parses a kind name. `network` is accepted as a synonym for
    /// `connection`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase();
        if normalized == "network" {
            return Some(Self::Connection);
        }
        Self::ALL.into_iter().find(|kind| kind.as_str() == normalized)
    }

    /// Returns true for transport-class failures that may succeed on retry.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::ServiceUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FlowError {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Self::Llm(_) => ErrorKind::Llm,
            Self::Parse(_) => ErrorKind::Parse,
            Self::FileSystem(_) => ErrorKind::FileSystem,
            Self::Permission(_) => ErrorKind::Permission,
            Self::KeyAccess(_) => ErrorKind::KeyAccess,
            Self::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Self::StageExecution { .. } => ErrorKind::StageExecution,
            Self::NotImplemented { .. } => ErrorKind::NotImplemented,
            Self::Workflow(_) => ErrorKind::Workflow,
            Self::Batch(_) => ErrorKind::Batch,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Rebuilds an error from a recorded kind and message.
    ///
    /// Used when a failure travels through a mapping-form state and only its
    /// `{type, message}` record survives.
    #[must_use]
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => Self::Validation(ValidationError::new(message)),
            ErrorKind::CircuitOpen => Self::CircuitOpen(CircuitBreakerOpenError::new(message, None)),
            ErrorKind::Timeout => Self::Timeout(message),
            ErrorKind::Connection => Self::Connection(message),
            ErrorKind::Authentication => Self::Authentication(message),
            ErrorKind::ServiceUnavailable => Self::ServiceUnavailable {
                service: "unknown".to_string(),
                message,
            },
            ErrorKind::Llm => Self::Llm(message),
            ErrorKind::Parse => Self::Parse(message),
            ErrorKind::FileSystem => Self::FileSystem(message),
            ErrorKind::Permission => Self::Permission(message),
            ErrorKind::KeyAccess => Self::KeyAccess(message),
            ErrorKind::TypeMismatch => Self::TypeMismatch(message),
            ErrorKind::StageExecution => Self::StageExecution {
                stage: "unknown".to_string(),
                message,
            },
            ErrorKind::NotImplemented => Self::NotImplemented { stage: message },
            ErrorKind::Workflow => Self::Workflow(WorkflowError::new(message)),
            ErrorKind::Batch => Self::Batch(BatchProcessingError::new(message, Vec::new())),
            ErrorKind::Cancelled => Self::Cancelled(message),
            ErrorKind::Config => Self::Config(message),
            ErrorKind::Serialization => Self::Serialization(message),
            ErrorKind::Internal => Self::Internal(message),
        }
    }

    /// Creates a stage execution error.
    #[must_use]
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error is a candidate for retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("type".to_string(), json!(self.kind().as_str()));
        map.insert("message".to_string(), json!(self.to_string()));
        match self {
            Self::Validation(err) => {
                map.extend(err.to_dict());
            }
            Self::CircuitOpen(err) => {
                map.insert("breaker".to_string(), json!(err.name));
                if let Some(retry_at) = err.retry_at {
                    map.insert("retry_at".to_string(), json!(retry_at.to_rfc3339()));
                }
            }
            Self::ServiceUnavailable { service, .. } => {
                map.insert("service".to_string(), json!(service));
            }
            Self::StageExecution { stage, .. } | Self::NotImplemented { stage } => {
                map.insert("stage".to_string(), json!(stage));
            }
            Self::Workflow(err) => {
                map.extend(err.to_dict());
            }
            Self::Batch(err) => {
                map.insert("failed_items".to_string(), json!(err.failed_items));
            }
            _ => {}
        }
        map
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-001-MISSING_KEY").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("code".to_string(), json!(self.code));
        map.insert("summary".to_string(), json!(self.summary));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), json!(hint));
        }
        if !self.context.is_empty() {
            let mut entries: Vec<_> = self.context.iter().collect();
            entries.sort();
            let context: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            map.insert("context".to_string(), Value::Object(context));
        }
        map
    }
}

/// Error raised when input or configuration fails validation.
///
/// Validation errors are never retried.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The offending field, when one can be named.
    pub field: Option<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            error_info: None,
        }
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(ref field) = self.field {
            map.insert("field".to_string(), json!(field));
        }
        if let Some(ref info) = self.error_info {
            map.insert("error_info".to_string(), Value::Object(info.to_dict()));
        }
        map
    }
}

/// Raised when a call is refused because its circuit breaker is open.
#[derive(Debug, Clone, Error)]
#[error("Circuit breaker '{name}' is OPEN")]
pub struct CircuitBreakerOpenError {
    /// The breaker name.
    pub name: String,
    /// When the breaker will next admit a trial call.
    pub retry_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerOpenError {
    /// Creates a new open-circuit error.
    #[must_use]
    pub fn new(name: impl Into<String>, retry_at: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            retry_at,
        }
    }
}

/// A workflow execution failure wrapping its root cause.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkflowError {
    /// The error message.
    pub message: String,
    /// The workflow that failed, if known.
    pub workflow: Option<String>,
    /// The underlying cause.
    #[source]
    pub cause: Option<Box<FlowError>>,
}

impl WorkflowError {
    /// Creates a new workflow error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            workflow: None,
            cause: None,
        }
    }

    /// Sets the workflow name.
    #[must_use]
    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    /// Attaches the root cause.
    #[must_use]
    pub fn with_cause(mut self, cause: FlowError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the innermost cause, following nested workflow errors.
    #[must_use]
    pub fn root_cause(&self) -> Option<&FlowError> {
        let mut current = self.cause.as_deref()?;
        while let FlowError::Workflow(inner) = current {
            match inner.cause.as_deref() {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current)
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(ref workflow) = self.workflow {
            map.insert("workflow".to_string(), json!(workflow));
        }
        if let Some(ref cause) = self.cause {
            map.insert("cause".to_string(), Value::Object(cause.to_dict()));
        }
        map
    }
}

/// A batch rejected as a whole, carrying the identifiers that failed.
#[derive(Debug, Clone, Error)]
#[error("{message} (failed items: {})", .failed_items.join(", "))]
pub struct BatchProcessingError {
    /// The error message.
    pub message: String,
    /// Identifiers of the failed items.
    pub failed_items: Vec<String>,
}

impl BatchProcessingError {
    /// Creates a new batch error.
    #[must_use]
    pub fn new(message: impl Into<String>, failed_items: Vec<String>) -> Self {
        Self {
            message: message.into(),
            failed_items,
        }
    }
}
