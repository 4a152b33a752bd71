//! In-process [`ObjectStore`].
//!
//! Used for single-instance deployments that do not need persistence and by the test suite.
//! Listing order is write order, which is also last-modified order.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use url::Url;

use super::error::{BackendError, BackendResult};
use super::object_store::{ListingPage, ObjectMeta, ObjectRead, ObjectStore};
use super::{ByteStream, ConditionalRequest};

struct StoredObject {
    data: Bytes,
    meta: ObjectMeta,
    seq: u64,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    next_seq: AtomicU64,
    public_base_url: Option<Url>,
    failing_reads: AtomicU32,
    head_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise objects under `base` so redirect delivery can be used.
    pub fn with_public_base_url(mut self, base: Url) -> Self {
        self.public_base_url = Some(base);
        self
    }

    /// Store `data` as if it had been written at `last_modified`.
    pub fn insert_at(&self, key: &str, data: Bytes, content_type: &str, last_modified: OffsetDateTime) {
        let meta = ObjectMeta {
            size: data.len() as u64,
            last_modified,
            etag: Some(content_etag(&data)),
            content_type: Some(content_type.to_string()),
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.objects.insert(key.to_string(), StoredObject { data, meta, seq });
    }

    /// Make the next `count` reads (head, get, list) fail with a transport error.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Number of `head` calls served so far.
    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn injected_failure(&self) -> BackendResult<()> {
        let remaining = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match remaining {
            Ok(_) => Err(BackendError::Transport("injected read failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn head(&self, key: &str) -> BackendResult<Option<ObjectMeta>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        Ok(self.objects.get(key).map(|object| object.meta.clone()))
    }

    async fn get(&self, key: &str, conditions: &ConditionalRequest) -> BackendResult<ObjectRead> {
        self.injected_failure()?;
        let Some((meta, data)) = self
            .objects
            .get(key)
            .map(|object| (object.meta.clone(), object.data.clone()))
        else {
            return Ok(ObjectRead::Missing);
        };

        if conditions.is_not_modified(meta.etag.as_deref(), Some(meta.last_modified)) {
            return Ok(ObjectRead::NotModified(meta));
        }

        let body: ByteStream = Box::pin(futures::stream::once(async move { Ok(data) }));
        Ok(ObjectRead::Found { meta, body })
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> BackendResult<ObjectMeta> {
        self.insert_at(key, data, content_type, OffsetDateTime::now_utc());
        self.objects
            .get(key)
            .map(|object| object.meta.clone())
            .ok_or_else(|| BackendError::Write {
                path: key.to_string(),
                message: "object vanished after write".to_string(),
            })
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list_page(&self, cursor: Option<&str>, limit: usize) -> BackendResult<ListingPage> {
        self.injected_failure()?;
        let after = match cursor {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| BackendError::InvalidCursor(raw.to_string()))?,
            ),
            None => None,
        };

        let mut listed: Vec<(u64, String, OffsetDateTime)> = self
            .objects
            .iter()
            .filter(|object| after.is_none_or(|after| object.seq > after))
            .map(|object| (object.seq, object.key().clone(), object.meta.last_modified))
            .collect();
        listed.sort_by_key(|(seq, _, _)| *seq);

        let has_more = listed.len() > limit;
        listed.truncate(limit);
        let next_cursor = has_more
            .then(|| listed.last().map(|(seq, _, _)| seq.to_string()))
            .flatten();

        Ok(ListingPage {
            objects: listed
                .into_iter()
                .map(|(_, key, modified)| (key, modified))
                .collect(),
            next_cursor,
        })
    }

    fn public_url(&self, key: &str) -> Option<Url> {
        self.public_base_url.as_ref().and_then(|base| base.join(key).ok())
    }
}

fn content_etag(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("\"{}\"", hex::encode(&digest[..16]))
}
