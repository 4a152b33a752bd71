//! In-process freshness index.
//!
//! Remembers when an artifact was created so hot keys skip the backend metadata round-trip.
//! Entries expire a fixed TTL after insertion and the map is capacity-bounded with LRU
//! eviction. The backend stays authoritative; an empty index is always correct.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tokio::time::Instant;

use super::keys::{CacheKey, StoragePath};
use super::lock::rw_write;

const SOURCE: &str = "cache::index";

/// Freshness metadata for one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: StoragePath,
    pub created_at: OffsetDateTime,
}

impl CacheEntry {
    pub fn new(path: StoragePath, created_at: OffsetDateTime) -> Self {
        Self {
            key: path.cache_key(),
            path,
            created_at,
        }
    }
}

struct Indexed {
    entry: CacheEntry,
    expires_at: Instant,
}

/// TTL-bounded map from storage path to [`CacheEntry`].
pub struct FreshnessIndex {
    entries: RwLock<LruCache<StoragePath, Indexed>>,
}

impl FreshnessIndex {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Look up a live entry; expired entries are dropped on the way out.
    pub fn get(&self, path: &StoragePath) -> Option<CacheEntry> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(path) {
            Some(indexed) if indexed.expires_at > Instant::now() => {
                counter!("imgcache_index_hit_total").increment(1);
                return Some(indexed.entry.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(path);
        }
        None
    }

    /// Insert or replace the entry for its path, live for `ttl` from now.
    pub fn put(&self, entry: CacheEntry, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + ttl;
        let path = entry.path.clone();
        rw_write(&self.entries, SOURCE, "put").put(path, Indexed { entry, expires_at });
    }

    pub fn remove(&self, path: &StoragePath) {
        rw_write(&self.entries, SOURCE, "remove").pop(path);
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Number of resident entries, including ones that expired but were not yet looked up.
    pub fn len(&self) -> usize {
        rw_write(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
