//! Closed error taxonomy for the coordination core.
//!
//! Every failure the core can surface is one of the tagged variants below.
//! Validation and business errors are recoverable and returned to the caller
//! as a structured [`ErrorPayload`]; storage-transient errors are retried by
//! the transaction coordinator; corruption and migration failures are fatal.

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// A single structured issue produced by a validation rule.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationIssue {
    /// Issue kind, e.g. `field_too_long`, `unknown_status`, `bad_path`.
    pub kind: String,
    pub message: String,
    /// Entity path or field path the issue refers to.
    pub path: Option<String>,
    /// Offending value, echoed back for the caller.
    pub value: Option<serde_json::Value>,
    /// Name of the rule that produced the issue.
    pub rule: String,
    /// Structural issues fail the pipeline even in lenient mode.
    #[serde(skip)]
    pub structural: bool,
}

impl ValidationIssue {
    pub fn new(rule: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            path: None,
            value: None,
            rule: rule.to_string(),
            structural: false,
        }
    }

    pub fn structural(mut self) -> Self {
        self.structural = true;
        self
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed with {} issue(s)", .issues.len())]
    Validation { issues: Vec<ValidationIssue> },

    #[error("not found: {key}")]
    NotFound { key: String },

    #[error("duplicate name: {key}")]
    DuplicateName { key: String },

    #[error("invalid status transition: {from} -> {to}")]
    StatusTransition { from: String, to: String },

    #[error("dependency cycle detected: {cycle:?}")]
    DependencyCycle { cycle: Vec<String> },

    #[error("dependencies not met for {key}: {unmet:?}")]
    DependencyNotMet { key: String, unmet: Vec<String> },

    #[error("task {key} has children: {children:?}")]
    HasChildren { key: String, children: Vec<String> },

    #[error("task {key} has dependents: {dependents:?}")]
    HasDependents { key: String, dependents: Vec<String> },

    #[error("{what} limit exceeded: {actual} > {limit}")]
    LimitExceeded {
        what: &'static str,
        limit: usize,
        actual: usize,
    },

    #[error("transaction error: {message}")]
    Transaction { message: String },

    #[error("transaction not found: {id}")]
    TransactionNotFound { id: String },

    #[error("transaction timed out: {id}")]
    TransactionTimeout { id: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("too many in-flight operations")]
    Overload,

    #[error("storage error: {message}")]
    StorageIo { message: String, retryable: bool },

    #[error("storage corrupt: {message}")]
    StorageCorrupt { message: String },

    #[error("cache error: {message}")]
    Cache { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Discriminant used in caller-facing payloads and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Duplicate,
    StatusTransition,
    DependencyCycle,
    DependencyNotMet,
    HasChildren,
    HasDependents,
    LimitExceeded,
    Transaction,
    TransactionNotFound,
    TransactionTimeout,
    Conflict,
    Overload,
    StorageIo,
    StorageCorrupt,
    Cache,
    Internal,
}

/// Structured record suitable for translation into a caller's envelope.
///
/// Never contains stack traces or internal filesystem paths.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation { .. } => ErrorKind::Validation,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::DuplicateName { .. } => ErrorKind::Duplicate,
            CoreError::StatusTransition { .. } => ErrorKind::StatusTransition,
            CoreError::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            CoreError::DependencyNotMet { .. } => ErrorKind::DependencyNotMet,
            CoreError::HasChildren { .. } => ErrorKind::HasChildren,
            CoreError::HasDependents { .. } => ErrorKind::HasDependents,
            CoreError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            CoreError::Transaction { .. } => ErrorKind::Transaction,
            CoreError::TransactionNotFound { .. } => ErrorKind::TransactionNotFound,
            CoreError::TransactionTimeout { .. } => ErrorKind::TransactionTimeout,
            CoreError::Conflict { .. } => ErrorKind::Conflict,
            CoreError::Overload => ErrorKind::Overload,
            CoreError::StorageIo { .. } => ErrorKind::StorageIo,
            CoreError::StorageCorrupt { .. } => ErrorKind::StorageCorrupt,
            CoreError::Cache { .. } => ErrorKind::Cache,
            CoreError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the transaction coordinator may transparently retry the
    /// failed operation (busy/locked/deadlock class).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::StorageIo { retryable: true, .. })
    }

    /// Whether the process should shut down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::StorageCorrupt { .. })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::Internal { message: message.into() }
    }

    /// Renders the caller-facing payload. Internal messages are passed
    /// through as-is; rusqlite messages were already stripped of paths at
    /// conversion time.
    pub fn payload(&self, correlation_id: Option<&str>) -> ErrorPayload {
        let (path, rule, details) = match self {
            CoreError::Validation { issues } => {
                let first = issues.first();
                (
                    first.and_then(|i| i.path.clone()),
                    first.map(|i| i.rule.clone()),
                    Some(serde_json::json!({ "issues": issues })),
                )
            }
            CoreError::NotFound { key } | CoreError::DuplicateName { key } => (Some(key.clone()), None, None),
            CoreError::DependencyCycle { cycle } => (None, None, Some(serde_json::json!({ "cycle": cycle }))),
            CoreError::DependencyNotMet { key, unmet } => (Some(key.clone()), None, Some(serde_json::json!({ "unmet": unmet }))),
            CoreError::HasChildren { key, children } => (Some(key.clone()), None, Some(serde_json::json!({ "children": children }))),
            CoreError::HasDependents { key, dependents } => (Some(key.clone()), None, Some(serde_json::json!({ "dependents": dependents }))),
            CoreError::LimitExceeded { what, limit, actual } => {
                (None, None, Some(serde_json::json!({ "what": what, "limit": limit, "actual": actual })))
            }
            _ => (None, None, None),
        };

        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            path,
            rule,
            details,
            correlation_id: correlation_id.map(|id| id.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => CoreError::StorageIo {
                message: "database busy or locked".to_string(),
                retryable: true,
            },
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => CoreError::StorageCorrupt { message: err.to_string() },
            Some(ErrorCode::DiskFull) => CoreError::StorageIo {
                message: "disk full".to_string(),
                retryable: true,
            },
            _ => CoreError::StorageIo {
                message: err.to_string(),
                retryable: false,
            },
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::StorageIo {
            message: err.to_string(),
            retryable: matches!(err.kind(), std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal {
            message: format!("serialization failed: {err}"),
        }
    }
}
