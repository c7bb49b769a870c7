use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable error tag surfaced to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    ResourceUnavailable,
    Timeout,
    PeerLost,
    ExecutorError,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ResourceUnavailable => "ResourceUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::PeerLost => "PeerLost",
            ErrorKind::ExecutorError => "ExecutorError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Everything a submitted task can end with, other than success.
///
/// None of these are retried by the scheduler; a caller that wants another
/// attempt submits a fresh task.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("no eligible worker or peer: {0}")]
    ResourceUnavailable(String),

    #[error("task exceeded its timeout of {}ms", .0.as_millis())]
    Timeout(#[serde(with = "crate::engine::serde_helpers::duration_ms")] Duration),

    #[error("peer {0} disconnected while the task was in flight")]
    PeerLost(String),

    #[error("executor failed: {0}")]
    Executor(String),

    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        TaskError::Validation(msg.into())
    }

    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        TaskError::ResourceUnavailable(msg.into())
    }

    pub fn executor<S: Into<String>>(msg: S) -> Self {
        TaskError::Executor(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Validation(_) => ErrorKind::ValidationError,
            TaskError::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            TaskError::Timeout(_) => ErrorKind::Timeout,
            TaskError::PeerLost(_) => ErrorKind::PeerLost,
            TaskError::Executor(_) => ErrorKind::ExecutorError,
            TaskError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Validation(format!("payload serialization failed: {}", err))
    }
}
