//! Storage backends for cached artifacts.
//!
//! Every backend answers the same four questions: is an artifact fresh, store a new one, how
//! should the client receive it, and which old artifacts can go. The freshness state machine
//! and the trim walk are shared through [`BackendContext`]; backends only supply the I/O.

mod context;
mod error;
pub mod filesystem;
pub mod memory;
pub mod object_store;
pub mod retry;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use context::{BackendContext, TrimCandidate, TrimProgress};
pub use error::{BackendError, BackendResult};
pub use filesystem::FilesystemBackend;
pub use memory::MemoryObjectStore;
pub use object_store::{ListingPage, ObjectMeta, ObjectRead, ObjectStore, ObjectStoreBackend};

use super::index::CacheEntry;
use super::keys::StoragePath;

/// Streaming artifact body.
pub type ByteStream = Pin<Box<dyn Stream<Item = BackendResult<Bytes>> + Send>>;

/// What the source service reports about the original resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMeta {
    /// `None` when the source cannot say; freshness then rests on max-age alone.
    pub last_modified: Option<OffsetDateTime>,
}

impl SourceMeta {
    pub fn modified_at(last_modified: OffsetDateTime) -> Self {
        Self {
            last_modified: Some(last_modified),
        }
    }
}

/// Outcome of the per-request freshness state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh(CacheEntry),
    Stale(CacheEntry),
    Missing,
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Fresh(_) => "fresh",
            Self::Stale(_) => "stale",
            Self::Missing => "missing",
        }
    }
}

/// Conditional request headers forwarded from the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalRequest {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<OffsetDateTime>,
}

impl ConditionalRequest {
    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }

    /// Whether a representation with these validators satisfies the request as "not modified".
    ///
    /// `If-None-Match` takes precedence; `If-Modified-Since` is only consulted without it.
    pub fn is_not_modified(&self, etag: Option<&str>, last_modified: Option<OffsetDateTime>) -> bool {
        if let Some(candidates) = self.if_none_match.as_deref() {
            return etag.is_some_and(|etag| etag_list_matches(candidates, etag));
        }

        match (self.if_modified_since, last_modified) {
            (Some(since), Some(modified)) => truncate_to_second(modified) <= since,
            _ => false,
        }
    }
}

/// Weak comparison of an `If-None-Match` list against one entity tag.
fn etag_list_matches(candidates: &str, etag: &str) -> bool {
    let etag = strip_weak(etag.trim());
    candidates
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip_weak(candidate) == etag)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

fn truncate_to_second(value: OffsetDateTime) -> OffsetDateTime {
    value.replace_nanosecond(0).unwrap_or(value)
}

/// Validators and framing for a stored artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<OffsetDateTime>,
    pub content_length: Option<u64>,
}

/// How the response layer should deliver an artifact.
pub enum ServeInstruction {
    /// Send the client to the backend's public URL.
    Redirect { location: Url },
    /// Proxy the stored bytes.
    Stream { meta: ArtifactMeta, body: ByteStream },
    /// The client's copy is current; respond 304 with an empty body.
    NotModified { meta: ArtifactMeta },
    /// The backend no longer has the artifact.
    Missing,
}

impl ServeInstruction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Redirect { .. } => "redirect",
            Self::Stream { .. } => "stream",
            Self::NotModified { .. } => "not_modified",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Debug for ServeInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redirect { location } => f
                .debug_struct("Redirect")
                .field("location", &location.as_str())
                .finish(),
            Self::Stream { meta, .. } => f
                .debug_struct("Stream")
                .field("meta", meta)
                .finish_non_exhaustive(),
            Self::NotModified { meta } => f.debug_struct("NotModified").field("meta", meta).finish(),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

/// Counters from one trim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub pages: u64,
    pub examined: u64,
    pub deleted: u64,
    pub skipped_busy: u64,
    pub failed: u64,
    /// The sweep stopped early because the cancellation signal fired.
    pub cancelled: bool,
}

/// A storage medium for cached artifacts.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Short backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Classify the artifact at `path` against max-age and the source's last-modified time.
    async fn is_fresh_or_missing(
        &self,
        path: &StoragePath,
        source: &SourceMeta,
    ) -> BackendResult<Freshness>;

    /// Atomically replace the artifact at `path`. Never retried.
    async fn store(
        &self,
        path: &StoragePath,
        bytes: Bytes,
        content_type: &str,
    ) -> BackendResult<CacheEntry>;

    /// Decide how the artifact at `path` reaches the client.
    async fn serve_or_redirect(
        &self,
        path: &StoragePath,
        conditions: &ConditionalRequest,
    ) -> BackendResult<ServeInstruction>;

    /// Delete artifacts created before `horizon`, oldest first, until the first fresh one.
    async fn trim_older_than(
        &self,
        horizon: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> BackendResult<TrimReport>;

    /// Drop any in-process knowledge of `path` so the next check goes to the backend.
    fn invalidate(&self, path: &StoragePath);
}
