//! Durable object store backend.
//!
//! [`ObjectStore`] is the narrow surface a bucket-style store must offer; [`ObjectStoreBackend`]
//! layers the freshness state machine, redirect probing and paged trimming on top of it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use super::context::{BackendContext, TrimCandidate, TrimProgress};
use super::error::BackendResult;
use super::retry::{bounded, with_retry};
use super::{
    ArtifactMeta, ByteStream, CacheBackend, ConditionalRequest, Freshness, ServeInstruction,
    SourceMeta, TrimReport,
};
use crate::cache::config::DeliveryMode;
use crate::cache::index::CacheEntry;
use crate::cache::keys::StoragePath;

const SOURCE: &str = "cache::backend::object_store";

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: OffsetDateTime,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

impl From<&ObjectMeta> for ArtifactMeta {
    fn from(meta: &ObjectMeta) -> Self {
        Self {
            content_type: meta.content_type.clone(),
            etag: meta.etag.clone(),
            last_modified: Some(meta.last_modified),
            content_length: Some(meta.size),
        }
    }
}

/// Result of a conditional object read.
pub enum ObjectRead {
    Found { meta: ObjectMeta, body: ByteStream },
    NotModified(ObjectMeta),
    Missing,
}

/// One page of a listing, ordered oldest first.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub objects: Vec<(String, OffsetDateTime)>,
    /// Opaque continuation token; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Minimal bucket-style object store.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Metadata for `key`, or `None` if absent.
    async fn head(&self, key: &str) -> BackendResult<Option<ObjectMeta>>;

    /// Read `key`, evaluating the forwarded conditional headers against the stored validators.
    async fn get(&self, key: &str, conditions: &ConditionalRequest) -> BackendResult<ObjectRead>;

    /// Replace `key` in one step; readers never observe a partial object.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> BackendResult<ObjectMeta>;

    /// Remove `key`; removing an absent key succeeds.
    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// Up to `limit` objects after `cursor`.
    async fn list_page(&self, cursor: Option<&str>, limit: usize) -> BackendResult<ListingPage>;

    /// Public URL clients can fetch `key` from, if the store is publicly exposed.
    fn public_url(&self, key: &str) -> Option<Url>;
}

pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    context: BackendContext,
}

impl ObjectStoreBackend {
    /// `http` is used only for the existence check ahead of a redirect.
    pub fn new(store: Arc<dyn ObjectStore>, http: reqwest::Client, context: BackendContext) -> Self {
        Self {
            store,
            http,
            context,
        }
    }

    pub fn context(&self) -> &BackendContext {
        &self.context
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// HEAD the public URL; only a success status permits the redirect.
    async fn head_check(&self, location: &Url) -> bool {
        let timeout = self.context.config().head_check_timeout();
        let response = self.http.head(location.clone()).timeout(timeout).send().await;
        match response {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(
                    target = SOURCE,
                    op = "head_check",
                    url = %location,
                    status = response.status().as_u16(),
                    result = if response.status() == StatusCode::NOT_FOUND { "absent" } else { "unexpected_status" },
                    "Redirect existence check failed; streaming instead"
                );
                false
            }
            Err(err) => {
                debug!(
                    target = SOURCE,
                    op = "head_check",
                    url = %location,
                    result = "error",
                    error = %err,
                    "Redirect existence check failed; streaming instead"
                );
                false
            }
        }
    }
}

#[async_trait]
impl CacheBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    #[instrument(skip_all, fields(backend = "object_store", path = %path))]
    async fn is_fresh_or_missing(
        &self,
        path: &StoragePath,
        source: &SourceMeta,
    ) -> BackendResult<Freshness> {
        let timeout = self.context.config().backend_timeout();
        let policy = self.context.retry_policy();

        self.context
            .evaluate(path, source, || async {
                let meta = with_retry(&policy, "head", || {
                    bounded(timeout, "head", self.store.head(path.as_str()))
                })
                .await?;
                Ok(meta.map(|meta| meta.last_modified))
            })
            .await
    }

    #[instrument(skip_all, fields(backend = "object_store", path = %path, size = bytes.len()))]
    async fn store(
        &self,
        path: &StoragePath,
        bytes: Bytes,
        content_type: &str,
    ) -> BackendResult<CacheEntry> {
        let timeout = self.context.config().backend_timeout();
        let meta = bounded(
            timeout,
            "put",
            self.store.put(path.as_str(), bytes, content_type),
        )
        .await?;

        debug!(
            target = SOURCE,
            op = "store",
            path = %path,
            content_type,
            result = "ok",
            "Stored artifact"
        );
        Ok(self.context.record_stored(path, meta.last_modified))
    }

    #[instrument(skip_all, fields(backend = "object_store", path = %path))]
    async fn serve_or_redirect(
        &self,
        path: &StoragePath,
        conditions: &ConditionalRequest,
    ) -> BackendResult<ServeInstruction> {
        let config = self.context.config();

        if config.delivery_mode == DeliveryMode::Redirect
            && let Some(location) = self.store.public_url(path.as_str())
            && self.head_check(&location).await
        {
            return Ok(ServeInstruction::Redirect { location });
        }

        let timeout = config.backend_timeout();
        let policy = self.context.retry_policy();
        let read = with_retry(&policy, "get", || {
            bounded(timeout, "get", self.store.get(path.as_str(), conditions))
        })
        .await?;

        Ok(match read {
            ObjectRead::Found { meta, body } => ServeInstruction::Stream {
                meta: ArtifactMeta::from(&meta),
                body,
            },
            ObjectRead::NotModified(meta) => ServeInstruction::NotModified {
                meta: ArtifactMeta::from(&meta),
            },
            ObjectRead::Missing => ServeInstruction::Missing,
        })
    }

    async fn trim_older_than(
        &self,
        horizon: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> BackendResult<TrimReport> {
        let config = self.context.config();
        let timeout = config.backend_timeout();
        let page_size = config.trim_page_size_non_zero();
        let policy = self.context.retry_policy();

        let mut report = TrimReport::default();
        let mut cursor: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let page = with_retry(&policy, "list", || {
                bounded(timeout, "list", self.store.list_page(cursor.as_deref(), page_size))
            })
            .await?;
            report.pages += 1;

            let candidates = page
                .objects
                .into_iter()
                .map(|(key, modified)| TrimCandidate {
                    path: StoragePath::from_backend(key),
                    modified,
                })
                .collect();

            let progress = self
                .context
                .trim_candidates(candidates, horizon, cancel, &mut report, |path| async move {
                    bounded(timeout, "delete", self.store.delete(path.as_str())).await
                })
                .await;

            match progress {
                TrimProgress::Continue => {}
                TrimProgress::ReachedFresh => break,
                TrimProgress::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(report)
    }

    fn invalidate(&self, path: &StoragePath) {
        self.context.forget(path);
    }
}
