use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use imgcache::application::orchestrator::{ImageRequest, OrchestratorParts, RequestOrchestrator};
use imgcache::cache::backend::{MemoryObjectStore, ObjectStore, ObjectStoreBackend};
use imgcache::cache::{BackendContext, CacheBackend, CacheConfig, TrimScheduler};
use imgcache::infra::source::FilesystemSource;
use imgcache::infra::telemetry::describe_metrics;
use imgcache::infra::transform::PassthroughEngine;
use metrics_util::debugging::DebuggingRecorder;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn request_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    describe_metrics();

    let sources = TempDir::new().expect("sources dir");
    std::fs::write(sources.path().join("a.jpg"), b"jpeg-bytes").expect("source");
    std::fs::write(sources.path().join("empty.jpg"), b"").expect("empty source");

    let config = CacheConfig {
        max_age_days: 1,
        ..Default::default()
    };
    let context = BackendContext::standalone(config);
    let store = Arc::new(MemoryObjectStore::new());
    let backend: Arc<dyn CacheBackend> = Arc::new(ObjectStoreBackend::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        reqwest::Client::new(),
        context.clone(),
    ));
    let orchestrator = RequestOrchestrator::new(OrchestratorParts {
        backend: Arc::clone(&backend),
        locks: context.locks().clone(),
        config: context.shared_config(),
        sources: Arc::new(FilesystemSource::new(sources.path())),
        engine: Arc::new(PassthroughEngine),
    });

    // Miss, then hit served from the index.
    for _ in 0..2 {
        orchestrator
            .handle(ImageRequest {
                path: "/a.jpg".into(),
                query: "width=10".into(),
                ..Default::default()
            })
            .await
            .expect("served");
    }

    // Passthrough refuses empty input, so the rebuild fails.
    let failed = orchestrator
        .handle(ImageRequest {
            path: "/empty.jpg".into(),
            ..Default::default()
        })
        .await;
    assert!(failed.is_err());

    // Trim removes an artifact past max-age.
    store.insert_at(
        "z/expired.jpg",
        Bytes::from_static(b"old"),
        "image/jpeg",
        OffsetDateTime::now_utc() - time::Duration::days(3),
    );
    let scheduler = TrimScheduler::new(Arc::clone(&backend), context.shared_config());
    let report = scheduler
        .sweep(&CancellationToken::new())
        .await
        .expect("sweep");
    assert_eq!(report.deleted, 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "imgcache_hit_total",
        "imgcache_miss_total",
        "imgcache_rebuild_total",
        "imgcache_rebuild_failed_total",
        "imgcache_index_hit_total",
        "imgcache_trim_deleted_total",
        "imgcache_transform_ms",
        "imgcache_lock_wait_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
