//! Backend error types.

use std::io::ErrorKind;

use thiserror::Error;

/// Errors raised by cache backends and object stores.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("backend operation `{op}` timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("object store request failed: {0}")]
    Transport(String),

    #[error("write of `{path}` failed: {message}")]
    Write { path: String, message: String },

    #[error("invalid continuation token: {0}")]
    InvalidCursor(String),

    #[error("backend task failed: {0}")]
    Task(String),
}

impl BackendError {
    /// Whether a read that failed this way may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(err) => !matches!(
                err.kind(),
                ErrorKind::NotFound
                    | ErrorKind::PermissionDenied
                    | ErrorKind::InvalidInput
                    | ErrorKind::InvalidData
            ),
            Self::Timeout { .. } | Self::Transport(_) | Self::Task(_) => true,
            Self::InvalidPath(_) | Self::Write { .. } | Self::InvalidCursor(_) => false,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
