use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::BackendResult;
use super::retry::RetryPolicy;
use super::{Freshness, SourceMeta, TrimReport};
use crate::cache::config::CacheConfig;
use crate::cache::dedup::DedupLock;
use crate::cache::index::{CacheEntry, FreshnessIndex};
use crate::cache::keys::StoragePath;

const SOURCE: &str = "cache::backend";

/// One trimmable artifact as reported by a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimCandidate {
    pub path: StoragePath,
    pub modified: OffsetDateTime,
}

/// Whether a trim walk may continue to the next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimProgress {
    Continue,
    /// A non-expired entry was reached; later entries are newer still.
    ReachedFresh,
    Cancelled,
}

/// State shared by every backend: configuration, the freshness index and the per-key locks.
///
/// Constructed once at startup and handed to each backend; clones share the same index and
/// lock registry.
#[derive(Clone)]
pub struct BackendContext {
    config: Arc<CacheConfig>,
    index: Arc<FreshnessIndex>,
    locks: DedupLock,
}

impl BackendContext {
    pub fn new(config: Arc<CacheConfig>, index: Arc<FreshnessIndex>, locks: DedupLock) -> Self {
        Self {
            config,
            index,
            locks,
        }
    }

    /// Context with its own index and lock registry, sized from `config`.
    pub fn standalone(config: CacheConfig) -> Self {
        let index = FreshnessIndex::new(config.index_capacity_non_zero());
        Self::new(Arc::new(config), Arc::new(index), DedupLock::new())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<CacheConfig> {
        Arc::clone(&self.config)
    }

    pub fn index(&self) -> &Arc<FreshnessIndex> {
        &self.index
    }

    pub fn locks(&self) -> &DedupLock {
        &self.locks
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_attempts(self.config.read_attempts())
    }

    /// Fresh when inside max-age and the source has not changed since the artifact was made.
    pub fn classify(&self, entry: CacheEntry, source: &SourceMeta, now: OffsetDateTime) -> Freshness {
        let within_max_age = self.config.is_within_max_age(entry.created_at, now);
        let source_unchanged = source
            .last_modified
            .is_none_or(|modified| modified <= entry.created_at);

        if within_max_age && source_unchanged {
            Freshness::Fresh(entry)
        } else {
            Freshness::Stale(entry)
        }
    }

    /// Run the freshness state machine for `path`.
    ///
    /// A live index entry short-circuits the backend; otherwise `lookup` reports the stored
    /// artifact's creation time (or `None` when absent) and the answer re-populates the index.
    pub async fn evaluate<F, Fut>(
        &self,
        path: &StoragePath,
        source: &SourceMeta,
        lookup: F,
    ) -> BackendResult<Freshness>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<Option<OffsetDateTime>>>,
    {
        let entry = match self.index.get(path) {
            Some(entry) => entry,
            None => match lookup().await? {
                Some(created_at) => {
                    let entry = CacheEntry::new(path.clone(), created_at);
                    self.index.put(entry.clone(), self.config.index_ttl());
                    entry
                }
                None => {
                    self.index.remove(path);
                    return Ok(Freshness::Missing);
                }
            },
        };

        Ok(self.classify(entry, source, OffsetDateTime::now_utc()))
    }

    /// Remember a freshly stored artifact.
    pub fn record_stored(&self, path: &StoragePath, created_at: OffsetDateTime) -> CacheEntry {
        let entry = CacheEntry::new(path.clone(), created_at);
        self.index.put(entry.clone(), self.config.index_ttl());
        entry
    }

    pub fn forget(&self, path: &StoragePath) {
        self.index.remove(path);
    }

    /// Delete expired candidates in ascending `modified` order.
    ///
    /// Entries a request currently holds are skipped. A failed delete is logged and the walk
    /// moves on. Stops at the first entry at or after `horizon`.
    pub async fn trim_candidates<F, Fut>(
        &self,
        mut candidates: Vec<TrimCandidate>,
        horizon: OffsetDateTime,
        cancel: &CancellationToken,
        report: &mut TrimReport,
        mut delete: F,
    ) -> TrimProgress
    where
        F: FnMut(StoragePath) -> Fut,
        Fut: Future<Output = BackendResult<()>>,
    {
        candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

        for candidate in candidates {
            if cancel.is_cancelled() {
                return TrimProgress::Cancelled;
            }
            report.examined += 1;

            if candidate.modified >= horizon {
                return TrimProgress::ReachedFresh;
            }

            let Some(_guard) = self.locks.try_acquire(candidate.path.as_str()) else {
                report.skipped_busy += 1;
                debug!(
                    target = SOURCE,
                    op = "trim",
                    path = %candidate.path,
                    result = "busy",
                    "Skipping artifact held by a request"
                );
                continue;
            };

            match delete(candidate.path.clone()).await {
                Ok(()) => {
                    self.index.remove(&candidate.path);
                    report.deleted += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target = SOURCE,
                        op = "trim",
                        path = %candidate.path,
                        result = "error",
                        error = %err,
                        "Failed to delete expired artifact"
                    );
                }
            }
        }

        TrimProgress::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::backend::BackendError;

    fn context(max_age_days: u32) -> BackendContext {
        BackendContext::standalone(CacheConfig {
            max_age_days,
            ..Default::default()
        })
    }

    fn path(value: &str) -> StoragePath {
        StoragePath::from_backend(value)
    }

    #[test]
    fn classify_applies_max_age_and_source_time() {
        let context = context(1);
        let now = OffsetDateTime::now_utc();
        let unchanged = SourceMeta::modified_at(now - time::Duration::days(30));

        let recent = CacheEntry::new(path("a/k1.jpg"), now - time::Duration::hours(1));
        assert!(context.classify(recent.clone(), &unchanged, now).is_fresh());

        let old = CacheEntry::new(path("a/k1.jpg"), now - time::Duration::days(2));
        assert!(matches!(context.classify(old, &unchanged, now), Freshness::Stale(_)));

        let edited = SourceMeta::modified_at(now - time::Duration::minutes(5));
        assert!(matches!(context.classify(recent.clone(), &edited, now), Freshness::Stale(_)));

        assert!(context.classify(recent, &SourceMeta::default(), now).is_fresh());
    }

    #[tokio::test]
    async fn evaluate_queries_backend_once_then_uses_index() {
        let context = context(30);
        let target = path("a/k1.jpg");
        let created_at = OffsetDateTime::now_utc() - time::Duration::hours(1);

        let first = context
            .evaluate(&target, &SourceMeta::default(), || async { Ok(Some(created_at)) })
            .await
            .expect("evaluate");
        assert!(first.is_fresh());

        let second = context
            .evaluate(&target, &SourceMeta::default(), || async {
                Err(BackendError::Transport("must not be queried".into()))
            })
            .await
            .expect("index hit");
        assert!(second.is_fresh());
    }

    #[tokio::test]
    async fn index_entry_past_max_age_is_stale() {
        let context = context(1);
        let target = path("a/k1.jpg");
        context.index().put(
            CacheEntry::new(target.clone(), OffsetDateTime::now_utc() - time::Duration::days(2)),
            Duration::from_secs(600),
        );

        let freshness = context
            .evaluate(&target, &SourceMeta::default(), || async { Ok(None) })
            .await
            .expect("evaluate");
        assert!(matches!(freshness, Freshness::Stale(_)));
    }

    #[tokio::test]
    async fn absent_object_is_missing_and_not_indexed() {
        let context = context(1);
        let target = path("a/k1.jpg");

        let freshness = context
            .evaluate(&target, &SourceMeta::default(), || async { Ok(None) })
            .await
            .expect("evaluate");
        assert_eq!(freshness, Freshness::Missing);
        assert!(context.index().get(&target).is_none());
    }

    #[tokio::test]
    async fn trim_stops_at_first_fresh_and_skips_busy() {
        let context = context(1);
        let now = OffsetDateTime::now_utc();
        let horizon = context.config().expiry_horizon(now);
        let candidates = vec![
            TrimCandidate {
                path: path("c/new.jpg"),
                modified: now,
            },
            TrimCandidate {
                path: path("a/old.jpg"),
                modified: now - time::Duration::days(3),
            },
            TrimCandidate {
                path: path("b/busy.jpg"),
                modified: now - time::Duration::days(2),
            },
        ];
        let held = context.locks().try_acquire("b/busy.jpg").expect("free");

        let mut deleted = Vec::new();
        let mut report = TrimReport::default();
        let progress = context
            .trim_candidates(
                candidates,
                horizon,
                &CancellationToken::new(),
                &mut report,
                |path| {
                    deleted.push(path);
                    async { Ok(()) }
                },
            )
            .await;
        drop(held);

        assert_eq!(progress, TrimProgress::ReachedFresh);
        assert_eq!(deleted, vec![path("a/old.jpg")]);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.skipped_busy, 1);
        assert_eq!(report.examined, 3);
    }

    #[tokio::test]
    async fn trim_continues_past_failed_delete() {
        let context = context(1);
        let now = OffsetDateTime::now_utc();
        let candidates = vec![
            TrimCandidate {
                path: path("a/one.jpg"),
                modified: now - time::Duration::days(4),
            },
            TrimCandidate {
                path: path("b/two.jpg"),
                modified: now - time::Duration::days(3),
            },
        ];
        context.record_stored(&path("b/two.jpg"), now - time::Duration::days(3));

        let mut report = TrimReport::default();
        let progress = context
            .trim_candidates(
                candidates,
                context.config().expiry_horizon(now),
                &CancellationToken::new(),
                &mut report,
                |path| async move {
                    if path.as_str() == "a/one.jpg" {
                        Err(BackendError::Transport("refused".into()))
                    } else {
                        Ok(())
                    }
                },
            )
            .await;

        assert_eq!(progress, TrimProgress::Continue);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted, 1);
        assert!(context.index().get(&path("b/two.jpg")).is_none());
    }

    #[tokio::test]
    async fn trim_observes_cancellation() {
        let context = context(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut report = TrimReport::default();
        let progress = context
            .trim_candidates(
                vec![TrimCandidate {
                    path: path("a/one.jpg"),
                    modified: OffsetDateTime::UNIX_EPOCH,
                }],
                OffsetDateTime::now_utc(),
                &cancel,
                &mut report,
                |_| async { Ok(()) },
            )
            .await;

        assert_eq!(progress, TrimProgress::Cancelled);
        assert_eq!(report.deleted, 0);
    }
}
