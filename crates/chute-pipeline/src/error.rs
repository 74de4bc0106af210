//! Pipeline error taxonomy.
//!
//! Every step and planner failure is one of these kinds. The executor uses
//! the kind only for logging; any do-step error triggers rollback, and any
//! planner error aborts the update.

use std::fmt;
use std::time::Duration;

use chute_core::{ChuteError, HostConfigError};
use thiserror::Error;

/// Kind of a pipeline failure, independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationRejection,
    StateConflict,
    IoFailure,
    ConfigReloadFailure,
    TimeoutFailure,
    InternalInvariant,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ValidationRejection => "validation",
            ErrorKind::StateConflict => "state-conflict",
            ErrorKind::IoFailure => "io",
            ErrorKind::ConfigReloadFailure => "config-reload",
            ErrorKind::TimeoutFailure => "timeout",
            ErrorKind::InternalInvariant => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("config reload failed: {0}")]
    ConfigReload(String),
    #[error("timed out after {after:?}: {what}")]
    Timeout { what: String, after: Duration },
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::ValidationRejection,
            PipelineError::StateConflict(_) => ErrorKind::StateConflict,
            PipelineError::Io(_) => ErrorKind::IoFailure,
            PipelineError::ConfigReload(_) => ErrorKind::ConfigReloadFailure,
            PipelineError::Timeout { .. } => ErrorKind::TimeoutFailure,
            PipelineError::Internal(_) => ErrorKind::InternalInvariant,
        }
    }

    /// I/O failure with the operation that hit it.
    pub fn io(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        PipelineError::Io(format!("{context}: {err}"))
    }

    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        PipelineError::Timeout {
            what: what.into(),
            after,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(e: serde_yaml::Error) -> Self {
        PipelineError::Io(format!("yaml: {e}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Io(format!("json: {e}"))
    }
}

impl From<ChuteError> for PipelineError {
    fn from(e: ChuteError) -> Self {
        PipelineError::Validation(e.to_string())
    }
}

impl From<HostConfigError> for PipelineError {
    fn from(e: HostConfigError) -> Self {
        match e {
            HostConfigError::Schema(_) => PipelineError::Validation(e.to_string()),
            other => PipelineError::Io(other.to_string()),
        }
    }
}

/// Run a client call under a deadline, mapping expiry to `TimeoutFailure`.
pub async fn with_deadline<T, F>(what: &str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::timeout(what, after)),
    }
}
