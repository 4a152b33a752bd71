use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::ports::{SourceError, TransformError},
    cache::BackendError,
    infra::error::InfraError,
};

/// Diagnostic chain attached to error responses and logged by the response middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

/// Failure of one request through the cache pipeline.
///
/// Nothing is cached on any of these paths.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source `{0}` not found")]
    SourceNotFound(String),
    #[error("source could not be read")]
    Source(#[source] SourceError),
    #[error("transform failed")]
    Transform(#[from] TransformError),
    #[error("cache backend failed")]
    Backend(#[from] BackendError),
    #[error("artifact `{0}` is missing right after it was stored")]
    ArtifactVanished(String),
}

impl PipelineError {
    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceNotFound(_) => "source_not_found",
            Self::Source(_) => "source_unavailable",
            Self::Transform(_) => "transform_failed",
            Self::Backend(_) => "backend_failed",
            Self::ArtifactVanished(_) => "artifact_vanished",
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::NotFound(path) | SourceError::InvalidPath(path) => {
                Self::SourceNotFound(path)
            }
            other => Self::Source(other),
        }
    }
}

impl From<PipelineError> for HttpError {
    fn from(error: PipelineError) -> Self {
        const SOURCE: &str = "application::error::PipelineError";
        match &error {
            PipelineError::SourceNotFound(_) => {
                HttpError::from_error(SOURCE, StatusCode::NOT_FOUND, "Image not found", &error)
            }
            PipelineError::Transform(_) => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Image could not be processed",
                &error,
            ),
            PipelineError::Source(_)
            | PipelineError::Backend(_)
            | PipelineError::ArtifactVanished(_) => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &error,
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
