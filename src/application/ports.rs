//! Collaborators the orchestrator depends on.
//!
//! Source retrieval and image transformation live outside the cache; they are injected as
//! trait objects. Query normalization and post-processing are strategy hooks invoked at fixed
//! points of the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::cache::SourceMeta;

/// Canonical identifier of an original image, e.g. `/photos/a.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceDescriptor {
    path: String,
}

impl SourceDescriptor {
    /// Collapse repeated slashes and force a leading slash.
    pub fn new(path: &str) -> Self {
        let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
        Self {
            path: format!("/{}", segments.join("/")),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path without the leading slash, for joining onto a root.
    pub fn relative_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

/// Where a source lives, for callers that want to track invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DependencyHint {
    /// Backed by a file on this host.
    LocalFile(PathBuf),
    /// Fetched from a remote origin.
    Remote(Url),
    #[default]
    Unknown,
}

impl DependencyHint {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalFile(_))
    }
}

/// What a source service knows about a resource without downloading it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    pub meta: SourceMeta,
    pub dependency: DependencyHint,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source `{0}` does not exist")]
    NotFound(String),
    #[error("source path `{0}` is not allowed")]
    InvalidPath(String),
    #[error("source `{path}` is unavailable: {message}")]
    Unavailable { path: String, message: String },
}

impl SourceError {
    pub fn unavailable(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The resource definitively does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidPath(_))
    }
}

/// Retrieves original images.
#[async_trait]
pub trait SourceImageService: Send + Sync + 'static {
    async fn metadata(&self, source: &SourceDescriptor) -> Result<SourceMetadata, SourceError>;

    async fn fetch(&self, source: &SourceDescriptor) -> Result<Bytes, SourceError>;
}

/// Encoded output of a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unsupported transform instruction `{0}`")]
    Unsupported(String),
    #[error("source image could not be decoded: {0}")]
    Malformed(String),
    #[error("transform timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transform engine failed: {0}")]
    Engine(String),
}

/// Turns source bytes plus a canonical instruction into an encoded image.
///
/// Implementations must be callable concurrently with no shared mutable state.
#[async_trait]
pub trait TransformEngine: Send + Sync + 'static {
    async fn transform(
        &self,
        source: Bytes,
        instruction: &str,
        output_extension: &str,
    ) -> Result<TransformOutput, TransformError>;
}

/// Canonicalizes a raw query string into a transform instruction.
pub trait QueryNormalizer: Send + Sync + 'static {
    fn normalize(&self, raw_query: &str) -> String;
}

/// Sorts `key=value` pairs by key, lowercases keys and drops empty pairs so equivalent queries
/// fingerprint identically. A repeated key keeps its first occurrence.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortedQueryNormalizer;

impl QueryNormalizer for SortedQueryNormalizer {
    fn normalize(&self, raw_query: &str) -> String {
        let mut pairs: Vec<(String, &str)> = raw_query
            .split('&')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                let name = name.trim();
                (!name.is_empty()).then(|| (name.to_ascii_lowercase(), value.trim()))
            })
            .collect();
        // Stable, so repeated keys stay in request order for the dedup below.
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs.dedup_by(|later, earlier| later.0 == earlier.0);

        pairs
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name.clone()
                } else {
                    format!("{name}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Hook between a successful transform and the store.
pub trait PostProcessor: Send + Sync + 'static {
    fn process(
        &self,
        source: &SourceDescriptor,
        output: TransformOutput,
    ) -> Result<TransformOutput, TransformError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPostProcessor;

impl PostProcessor for NoopPostProcessor {
    fn process(
        &self,
        _source: &SourceDescriptor,
        output: TransformOutput,
    ) -> Result<TransformOutput, TransformError> {
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_collapses_slashes() {
        let source = SourceDescriptor::new("photos//2024/a.jpg");
        assert_eq!(source.path(), "/photos/2024/a.jpg");
        assert_eq!(source.relative_path(), "photos/2024/a.jpg");
    }

    #[test]
    fn normalizer_orders_and_trims_pairs() {
        let normalizer = SortedQueryNormalizer;
        assert_eq!(
            normalizer.normalize("width=200&Height=100&&format=webp"),
            "format=webp&height=100&width=200"
        );
        assert_eq!(normalizer.normalize(""), "");
        assert_eq!(normalizer.normalize("grayscale&width=10"), "grayscale&width=10");
    }

    #[test]
    fn equivalent_queries_normalize_identically() {
        let normalizer = SortedQueryNormalizer;
        assert_eq!(
            normalizer.normalize("width=200&format=webp"),
            normalizer.normalize("format=webp&width=200")
        );
    }

    #[test]
    fn repeated_keys_keep_first_occurrence() {
        let normalizer = SortedQueryNormalizer;
        assert_eq!(normalizer.normalize("width=300&width=200"), "width=300");
        assert_eq!(normalizer.normalize("width=10&width=9"), "width=10");
        assert_eq!(normalizer.normalize("width=9&width=10"), "width=9");
        assert_eq!(
            normalizer.normalize("format=webp&Width=5&width=7"),
            "format=webp&width=5"
        );
    }

    #[test]
    fn not_found_classification() {
        assert!(SourceError::NotFound("/a.jpg".into()).is_not_found());
        assert!(SourceError::InvalidPath("/../a.jpg".into()).is_not_found());
        assert!(!SourceError::unavailable("/a.jpg", "timeout").is_not_found());
    }
}
