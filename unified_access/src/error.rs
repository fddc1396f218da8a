//! Error types for the unified data access layer

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for data access operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the unified data access layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("{model} with id {id} not found")]
    NotFound { model: String, id: Uuid },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Conflict on {model} {id}: expected lsn {expected}, current lsn {actual}")]
    Conflict {
        model: String,
        id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("Duplicate value: {0}")]
    Duplicate(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service communication error accessing {url}{}: {message}", format_status(.status))]
    ServiceCommunication {
        message: String,
        status: Option<u16>,
        url: String,
    },

    #[error("Task {task_id} failed in worker: {source}")]
    RemoteTask {
        task_id: Uuid,
        #[source]
        source: Box<Error>,
    },

    #[error("Task {task_id} did not complete within {timeout:?}")]
    TaskTimeout { task_id: Uuid, timeout: Duration },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

/// Convert Serde JSON errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}

/// Convert TOML deserialization errors
impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::ConfigurationError(error.to_string())
    }
}

/// Stable classification of an [`Error`], shared by the HTTP surface, the
/// remote manager and the broker result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NotFound,
    PermissionDenied,
    Authentication,
    Conflict,
    Duplicate,
    Validation,
    ServiceCommunication,
    RemoteTask,
    TaskTimeout,
    Internal,
}

impl ErrorKind {
    /// HTTP status code used when this kind crosses the wire
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::Authentication => 401,
            ErrorKind::Conflict | ErrorKind::Duplicate => 409,
            ErrorKind::Validation => 422,
            ErrorKind::ServiceCommunication | ErrorKind::RemoteTask => 502,
            ErrorKind::TaskTimeout => 504,
            ErrorKind::Configuration | ErrorKind::Internal => 500,
        }
    }

    /// Wire name, as found in the `error` field of error bodies
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Validation => "validation",
            ErrorKind::ServiceCommunication => "service_communication",
            ErrorKind::RemoteTask => "remote_task",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigurationError(_) => ErrorKind::Configuration,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Duplicate(_) => ErrorKind::Duplicate,
            Error::Validation(_) => ErrorKind::Validation,
            Error::ServiceCommunication { .. } => ErrorKind::ServiceCommunication,
            Error::RemoteTask { .. } => ErrorKind::RemoteTask,
            Error::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            Error::Database(_) | Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP status for this error; an upstream failure without a response
    /// (timeout, refused connection) is reported as a gateway timeout.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ServiceCommunication { status: None, .. } => 504,
            other => other.kind().status_code(),
        }
    }

    /// Serializable snapshot of this error
    pub fn detail(&self) -> ErrorDetail {
        let message = match self {
            Error::ConfigurationError(m)
            | Error::PermissionDenied(m)
            | Error::Authentication(m)
            | Error::Duplicate(m)
            | Error::Validation(m)
            | Error::Serialization(m)
            | Error::Internal(m) => m.clone(),
            Error::ServiceCommunication { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let mut detail = ErrorDetail::new(self.kind(), message);
        match self {
            Error::NotFound { model, id } => {
                detail.model = Some(model.clone());
                detail.id = Some(*id);
            }
            Error::Conflict {
                model,
                id,
                expected,
                actual,
            } => {
                detail.model = Some(model.clone());
                detail.id = Some(*id);
                detail.expected_lsn = Some(*expected);
                detail.actual_lsn = Some(*actual);
            }
            Error::ServiceCommunication { status, url, .. } => {
                detail.status = *status;
                detail.url = Some(url.clone());
            }
            _ => {}
        }
        detail
    }
}

/// Error as carried over the wire: HTTP error bodies and broker results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "error")]
    pub kind: ErrorKind,
    #[serde(rename = "detail")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_lsn: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_lsn: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            model: None,
            id: None,
            expected_lsn: None,
            actual_lsn: None,
            status: None,
            url: None,
        }
    }

    /// Rebuild a typed error from its wire form.
    ///
    /// Kinds with structured payloads come back as the same variant; the
    /// message of the original error is kept for everything else.
    pub fn into_error(self) -> Error {
        let message = self.message;
        match self.kind {
            ErrorKind::NotFound => match (self.model, self.id) {
                (Some(model), Some(id)) => Error::NotFound { model, id },
                _ => Error::Internal(message),
            },
            ErrorKind::Conflict => match (self.model, self.id, self.expected_lsn, self.actual_lsn) {
                (Some(model), Some(id), Some(expected), Some(actual)) => Error::Conflict {
                    model,
                    id,
                    expected,
                    actual,
                },
                _ => Error::Internal(message),
            },
            ErrorKind::ServiceCommunication => Error::ServiceCommunication {
                message,
                status: self.status,
                url: self.url.unwrap_or_default(),
            },
            ErrorKind::Configuration => Error::ConfigurationError(message),
            ErrorKind::PermissionDenied => Error::PermissionDenied(message),
            ErrorKind::Authentication => Error::Authentication(message),
            ErrorKind::Duplicate => Error::Duplicate(message),
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::RemoteTask | ErrorKind::TaskTimeout | ErrorKind::Internal => {
                Error::Internal(message)
            }
        }
    }
}
