//! Per-request cache pipeline.
//!
//! fingerprint → lock → freshness → (rebuild) → serve → release. Every value that changes
//! per request stays on the stack, so one orchestrator serves any number of concurrent
//! requests.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::error::PipelineError;
use crate::application::ports::{
    DependencyHint, NoopPostProcessor, PostProcessor, QueryNormalizer, SortedQueryNormalizer,
    SourceDescriptor, SourceImageService, SourceMetadata, TransformEngine, TransformError,
};
use crate::cache::{
    CacheBackend, CacheConfig, CacheKey, ConditionalRequest, DedupLock, Fingerprinter, Freshness,
    ServeInstruction, StoragePath, TrimTrigger, output_extension,
};

const SOURCE: &str = "application::orchestrator";

pub const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_secs(30);

/// An image request as received from the outer framework.
#[derive(Debug, Clone, Default)]
pub struct ImageRequest {
    /// Resource path, e.g. `/photos/a.jpg`.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    pub conditions: ConditionalRequest,
}

/// How the artifact was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    /// Built during this request; carries the state that triggered it.
    Rebuilt(&'static str),
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Rebuilt(_) => "miss",
        }
    }
}

/// Delivery instruction plus the metadata the response layer applies.
#[derive(Debug)]
pub struct ImageResponse {
    pub instruction: ServeInstruction,
    pub cache_control: String,
    pub dependency: DependencyHint,
    pub status: CacheStatus,
    pub key: CacheKey,
    pub storage_path: StoragePath,
}

/// Collaborators required to build a [`RequestOrchestrator`].
pub struct OrchestratorParts {
    pub backend: Arc<dyn CacheBackend>,
    pub locks: DedupLock,
    pub config: Arc<CacheConfig>,
    pub sources: Arc<dyn SourceImageService>,
    pub engine: Arc<dyn TransformEngine>,
}

pub struct RequestOrchestrator {
    backend: Arc<dyn CacheBackend>,
    locks: DedupLock,
    config: Arc<CacheConfig>,
    fingerprinter: Fingerprinter,
    sources: Arc<dyn SourceImageService>,
    engine: Arc<dyn TransformEngine>,
    normalizer: Arc<dyn QueryNormalizer>,
    post_processor: Arc<dyn PostProcessor>,
    transform_timeout: Duration,
    trim: Option<TrimTrigger>,
}

impl RequestOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let OrchestratorParts {
            backend,
            locks,
            config,
            sources,
            engine,
        } = parts;

        Self {
            fingerprinter: Fingerprinter::new(config.path_prefix_depth),
            backend,
            locks,
            config,
            sources,
            engine,
            normalizer: Arc::new(SortedQueryNormalizer),
            post_processor: Arc::new(NoopPostProcessor),
            transform_timeout: DEFAULT_TRANSFORM_TIMEOUT,
            trim: None,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn QueryNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = post_processor;
        self
    }

    pub fn with_transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout = timeout;
        self
    }

    /// Nudge the trim scheduler after every request.
    pub fn with_trim_trigger(mut self, trigger: TrimTrigger) -> Self {
        self.trim = Some(trigger);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn locks(&self) -> &DedupLock {
        &self.locks
    }

    /// Resolve one image request to a delivery instruction.
    pub async fn handle(&self, request: ImageRequest) -> Result<ImageResponse, PipelineError> {
        let started = Instant::now();
        let result = self.process(&request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => debug!(
                target = SOURCE,
                op = "handle",
                path = %request.path,
                key = %response.key,
                cache = response.status.as_str(),
                delivery = response.instruction.label(),
                result = "ok",
                elapsed_ms,
                "Image request served"
            ),
            Err(err) => warn!(
                target = SOURCE,
                op = "handle",
                path = %request.path,
                result = err.kind(),
                error = %err,
                elapsed_ms,
                "Image request failed"
            ),
        }

        if let Some(trim) = &self.trim {
            trim.request_completed();
        }
        result
    }

    async fn process(&self, request: &ImageRequest) -> Result<ImageResponse, PipelineError> {
        let source = SourceDescriptor::new(&request.path);
        let instruction = self.normalizer.normalize(&request.query);
        let key = self.fingerprinter.fingerprint(source.path(), &instruction);
        let extension = output_extension(source.path(), &instruction);
        let storage_path = self.fingerprinter.storage_path_for(&key, &extension);

        let metadata = self.source_metadata(&source).await?;

        let wait_started = Instant::now();
        let _guard = self.locks.acquire(storage_path.as_str()).await;
        histogram!("imgcache_lock_wait_ms").record(wait_started.elapsed().as_secs_f64() * 1000.0);

        let freshness = match self
            .backend
            .is_fresh_or_missing(&storage_path, &metadata.meta)
            .await
        {
            Ok(freshness) => freshness,
            Err(err) if err.is_transient() => {
                warn!(
                    target = SOURCE,
                    op = "freshness",
                    path = %storage_path,
                    result = "retries_exhausted",
                    error = %err,
                    "Freshness check failed; treating artifact as stale"
                );
                Freshness::Missing
            }
            Err(err) => return Err(err.into()),
        };

        let status = if freshness.is_fresh() {
            counter!("imgcache_hit_total").increment(1);
            CacheStatus::Hit
        } else {
            counter!("imgcache_miss_total").increment(1);
            self.rebuild(&source, &instruction, &extension, &storage_path)
                .await?;
            CacheStatus::Rebuilt(freshness.label())
        };

        let instruction = match self
            .backend
            .serve_or_redirect(&storage_path, &request.conditions)
            .await?
        {
            ServeInstruction::Missing if status == CacheStatus::Hit => {
                info!(
                    target = SOURCE,
                    op = "self_heal",
                    path = %storage_path,
                    result = "rebuild",
                    "Indexed artifact is missing from the backend; rebuilding"
                );
                self.backend.invalidate(&storage_path);
                self.rebuild(&source, &instruction, &extension, &storage_path)
                    .await?;
                match self
                    .backend
                    .serve_or_redirect(&storage_path, &request.conditions)
                    .await?
                {
                    ServeInstruction::Missing => {
                        return Err(PipelineError::ArtifactVanished(storage_path.to_string()));
                    }
                    other => other,
                }
            }
            ServeInstruction::Missing => {
                return Err(PipelineError::ArtifactVanished(storage_path.to_string()));
            }
            other => other,
        };

        Ok(ImageResponse {
            instruction,
            cache_control: self.config.cache_control(),
            dependency: metadata.dependency,
            status,
            key,
            storage_path,
        })
    }

    /// Source metadata; a transient failure degrades to "unknown" so max-age alone decides.
    async fn source_metadata(
        &self,
        source: &SourceDescriptor,
    ) -> Result<SourceMetadata, PipelineError> {
        match self.sources.metadata(source).await {
            Ok(metadata) => Ok(metadata),
            Err(err) if err.is_not_found() => Err(err.into()),
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "source_metadata",
                    source = source.path(),
                    result = "unavailable",
                    error = %err,
                    "Source metadata unavailable; relying on max-age"
                );
                Ok(SourceMetadata::default())
            }
        }
    }

    /// Fetch, transform, post-process and store. Caller holds the key's lock.
    async fn rebuild(
        &self,
        source: &SourceDescriptor,
        instruction: &str,
        extension: &str,
        storage_path: &StoragePath,
    ) -> Result<(), PipelineError> {
        counter!("imgcache_rebuild_total").increment(1);
        let result = self
            .rebuild_inner(source, instruction, extension, storage_path)
            .await;
        if let Err(err) = &result {
            counter!("imgcache_rebuild_failed_total", "kind" => err.kind()).increment(1);
        }
        result
    }

    async fn rebuild_inner(
        &self,
        source: &SourceDescriptor,
        instruction: &str,
        extension: &str,
        storage_path: &StoragePath,
    ) -> Result<(), PipelineError> {
        let bytes = self.sources.fetch(source).await?;

        let started = Instant::now();
        let output = tokio::time::timeout(
            self.transform_timeout,
            self.engine.transform(bytes, instruction, extension),
        )
        .await
        .map_err(|_| TransformError::TimedOut(self.transform_timeout))??;
        histogram!("imgcache_transform_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        let output = self.post_processor.process(source, output)?;
        self.backend
            .store(storage_path, output.bytes, &output.content_type)
            .await?;

        debug!(
            target = SOURCE,
            op = "rebuild",
            source = source.path(),
            path = %storage_path,
            content_type = %output.content_type,
            result = "stored",
            "Artifact rebuilt"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use time::OffsetDateTime;

    use super::*;
    use crate::application::ports::{SourceError, TransformOutput};
    use crate::cache::backend::{MemoryObjectStore, ObjectStore, ObjectStoreBackend};
    use crate::cache::{BackendContext, BackendError, SourceMeta};

    #[derive(Default)]
    struct StaticSource {
        images: Mutex<HashMap<String, (Bytes, Option<OffsetDateTime>)>>,
        fetches: AtomicUsize,
    }

    impl StaticSource {
        fn with_image(path: &str, bytes: &'static [u8]) -> Self {
            let source = Self::default();
            source.set(path, bytes, None);
            source
        }

        fn set(&self, path: &str, bytes: &'static [u8], modified: Option<OffsetDateTime>) {
            self.images
                .lock()
                .expect("images")
                .insert(path.to_string(), (Bytes::from_static(bytes), modified));
        }
    }

    #[async_trait]
    impl SourceImageService for StaticSource {
        async fn metadata(&self, source: &SourceDescriptor) -> Result<SourceMetadata, SourceError> {
            let images = self.images.lock().expect("images");
            let (_, modified) = images
                .get(source.path())
                .ok_or_else(|| SourceError::NotFound(source.path().to_string()))?;
            Ok(SourceMetadata {
                meta: SourceMeta {
                    last_modified: *modified,
                },
                dependency: DependencyHint::Unknown,
            })
        }

        async fn fetch(&self, source: &SourceDescriptor) -> Result<Bytes, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let images = self.images.lock().expect("images");
            images
                .get(source.path())
                .map(|(bytes, _)| bytes.clone())
                .ok_or_else(|| SourceError::NotFound(source.path().to_string()))
        }
    }

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl TransformEngine for CountingEngine {
        async fn transform(
            &self,
            source: Bytes,
            instruction: &str,
            _output_extension: &str,
        ) -> Result<TransformOutput, TransformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(TransformError::Malformed("not an image".into()));
            }
            let mut bytes = source.to_vec();
            bytes.extend_from_slice(format!("|{instruction}").as_bytes());
            Ok(TransformOutput {
                bytes: Bytes::from(bytes),
                content_type: "image/jpeg".into(),
            })
        }
    }

    struct Harness {
        orchestrator: Arc<RequestOrchestrator>,
        store: Arc<MemoryObjectStore>,
        engine: Arc<CountingEngine>,
        sources: Arc<StaticSource>,
        context: BackendContext,
    }

    fn harness(config: CacheConfig, sources: StaticSource, engine: CountingEngine) -> Harness {
        let context = BackendContext::standalone(config);
        let store = Arc::new(MemoryObjectStore::new());
        let backend = ObjectStoreBackend::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            reqwest::Client::new(),
            context.clone(),
        );
        let sources = Arc::new(sources);
        let engine = Arc::new(engine);
        let orchestrator = RequestOrchestrator::new(OrchestratorParts {
            backend: Arc::new(backend),
            locks: context.locks().clone(),
            config: context.shared_config(),
            sources: Arc::clone(&sources) as Arc<dyn SourceImageService>,
            engine: Arc::clone(&engine) as Arc<dyn TransformEngine>,
        });
        Harness {
            orchestrator: Arc::new(orchestrator),
            store,
            engine,
            sources,
            context,
        }
    }

    fn request(path: &str, query: &str) -> ImageRequest {
        ImageRequest {
            path: path.into(),
            query: query.into(),
            conditions: ConditionalRequest::default(),
        }
    }

    async fn body_of(response: ImageResponse) -> Vec<u8> {
        match response.instruction {
            ServeInstruction::Stream { body, .. } => body
                .try_fold(Vec::new(), |mut acc, chunk| async move {
                    acc.extend_from_slice(&chunk);
                    Ok(acc)
                })
                .await
                .expect("body"),
            other => panic!("expected stream, got {}", other.label()),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_for_one_key_transform_once() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/photos/a.jpg", b"raw"),
            CountingEngine {
                delay: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = Arc::clone(&h.orchestrator);
                tokio::spawn(async move {
                    orchestrator
                        .handle(request("/photos/a.jpg", "width=200"))
                        .await
                })
            })
            .collect();

        let mut paths = Vec::new();
        for task in tasks {
            let response = task.await.expect("join").expect("response");
            paths.push(response.storage_path.clone());
            assert_eq!(body_of(response).await, b"raw|width=200");
        }

        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(h.store.contains(paths[0].as_str()));
        assert!(h.orchestrator.locks().is_empty());
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine::default(),
        );

        let first = h.orchestrator.handle(request("/a.jpg", "width=10")).await.expect("first");
        assert_eq!(first.status, CacheStatus::Rebuilt("missing"));
        assert_eq!(first.cache_control, "public, max-age=31536000");

        let second = h.orchestrator.handle(request("/a.jpg", "width=10")).await.expect("second");
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sources.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_freshness_retries_rebuild_the_artifact() {
        let config = CacheConfig {
            read_retries: 2,
            ..Default::default()
        };
        let h = harness(
            config,
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine::default(),
        );
        h.orchestrator.handle(request("/a.jpg", "width=10")).await.expect("first");
        h.context.index().clear();

        h.store.fail_next_reads(2);
        let response = h
            .orchestrator
            .handle(request("/a.jpg", "width=10"))
            .await
            .expect("rebuilt despite failing reads");

        assert_eq!(response.status, CacheStatus::Rebuilt("missing"));
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(body_of(response).await, b"raw|width=10");
    }

    #[tokio::test]
    async fn exhausted_serve_retries_surface_as_server_error() {
        let config = CacheConfig {
            read_retries: 2,
            ..Default::default()
        };
        let h = harness(
            config,
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine::default(),
        );
        h.orchestrator.handle(request("/a.jpg", "width=10")).await.expect("first");

        h.store.fail_next_reads(2);
        let err = h
            .orchestrator
            .handle(request("/a.jpg", "width=10"))
            .await
            .expect_err("serve read keeps failing");

        assert!(matches!(err, PipelineError::Backend(BackendError::Transport(_))));
        assert_eq!(
            crate::application::error::HttpError::from(err).status(),
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 1);
        assert!(h.context.locks().is_empty());
    }

    #[tokio::test]
    async fn equivalent_queries_share_an_artifact() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine::default(),
        );

        let first = h
            .orchestrator
            .handle(request("/a.jpg", "width=10&format=webp"))
            .await
            .expect("first");
        let second = h
            .orchestrator
            .handle(request("//a.jpg", "format=webp&width=10"))
            .await
            .expect("second");

        assert_eq!(first.key, second.key);
        assert_eq!(first.storage_path.extension(), Some("webp"));
        assert_eq!(second.status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn missing_source_is_not_found_and_nothing_is_cached() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::default(),
            CountingEngine::default(),
        );

        let err = h
            .orchestrator
            .handle(request("/nope.jpg", ""))
            .await
            .expect_err("not found");

        assert!(matches!(err, PipelineError::SourceNotFound(_)));
        assert!(h.store.is_empty());
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
        assert!(h.orchestrator.locks().is_empty());
    }

    #[tokio::test]
    async fn transform_failure_is_not_cached_and_releases_the_lock() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine {
                fail: true,
                ..Default::default()
            },
        );

        let err = h
            .orchestrator
            .handle(request("/a.jpg", "width=10"))
            .await
            .expect_err("transform fails");

        assert!(matches!(err, PipelineError::Transform(TransformError::Malformed(_))));
        assert!(h.store.is_empty());
        assert!(h.orchestrator.locks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transform_times_out() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine {
                delay: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let orchestrator = Arc::into_inner(h.orchestrator)
            .expect("sole owner")
            .with_transform_timeout(Duration::from_secs(5));

        let err = orchestrator
            .handle(request("/a.jpg", "width=10"))
            .await
            .expect_err("timeout");

        assert!(matches!(err, PipelineError::Transform(TransformError::TimedOut(_))));
        assert!(h.store.is_empty());
        assert!(orchestrator.locks().is_empty());
    }

    #[tokio::test]
    async fn changed_source_triggers_rebuild() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"v1"),
            CountingEngine::default(),
        );
        h.orchestrator.handle(request("/a.jpg", "")).await.expect("first");

        h.sources.set(
            "/a.jpg",
            b"v2",
            Some(OffsetDateTime::now_utc() + time::Duration::minutes(1)),
        );
        let response = h.orchestrator.handle(request("/a.jpg", "")).await.expect("second");

        assert_eq!(response.status, CacheStatus::Rebuilt("stale"));
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(body_of(response).await, b"v2|");
    }

    #[tokio::test]
    async fn indexed_artifact_missing_from_backend_is_rebuilt() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine::default(),
        );
        let first = h.orchestrator.handle(request("/a.jpg", "width=5")).await.expect("first");
        let path = first.storage_path.clone();
        assert!(h.context.index().get(&path).is_some());

        h.store.delete(path.as_str()).await.expect("delete behind the index");

        let response = h.orchestrator.handle(request("/a.jpg", "width=5")).await.expect("healed");
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 2);
        assert!(h.store.contains(path.as_str()));
        assert_eq!(body_of(response).await, b"raw|width=5");
    }

    #[tokio::test]
    async fn post_processor_runs_before_store() {
        struct Watermark;

        impl PostProcessor for Watermark {
            fn process(
                &self,
                _source: &SourceDescriptor,
                mut output: TransformOutput,
            ) -> Result<TransformOutput, TransformError> {
                let mut bytes = output.bytes.to_vec();
                bytes.extend_from_slice(b"+wm");
                output.bytes = Bytes::from(bytes);
                Ok(output)
            }
        }

        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine::default(),
        );
        let orchestrator = Arc::into_inner(h.orchestrator)
            .expect("sole owner")
            .with_post_processor(Arc::new(Watermark));

        let response = orchestrator.handle(request("/a.jpg", "")).await.expect("response");
        assert_eq!(body_of(response).await, b"raw|+wm");
    }

    #[tokio::test]
    async fn conditional_request_yields_not_modified() {
        let h = harness(
            CacheConfig::default(),
            StaticSource::with_image("/a.jpg", b"raw"),
            CountingEngine::default(),
        );
        let first = h.orchestrator.handle(request("/a.jpg", "")).await.expect("first");
        let etag = match &first.instruction {
            ServeInstruction::Stream { meta, .. } => meta.etag.clone().expect("etag"),
            other => panic!("expected stream, got {}", other.label()),
        };

        let mut conditional = request("/a.jpg", "");
        conditional.conditions.if_none_match = Some(etag);
        let response = h.orchestrator.handle(conditional).await.expect("second");

        assert!(matches!(response.instruction, ServeInstruction::NotModified { .. }));
    }

    #[tokio::test]
    async fn completed_requests_nudge_trim() {
        let h = harness(
            CacheConfig {
                max_age_days: 1,
                ..Default::default()
            },
            StaticSource::default(),
            CountingEngine::default(),
        );
        h.store.insert_at(
            "a/old.jpg",
            Bytes::from_static(b"x"),
            "image/jpeg",
            OffsetDateTime::now_utc() - time::Duration::days(3),
        );
        let backend: Arc<dyn CacheBackend> = Arc::new(ObjectStoreBackend::new(
            Arc::clone(&h.store) as Arc<dyn ObjectStore>,
            reqwest::Client::new(),
            h.context.clone(),
        ));
        let scheduler = Arc::new(crate::cache::TrimScheduler::new(
            backend,
            h.context.shared_config(),
        ));
        let cancel = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

        let orchestrator = Arc::into_inner(h.orchestrator)
            .expect("sole owner")
            .with_trim_trigger(scheduler.trigger());
        let _ = orchestrator.handle(request("/missing.jpg", "")).await;

        for _ in 0..100 {
            if h.store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.store.is_empty());

        cancel.cancel();
        task.await.expect("scheduler task");
    }
}
