use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{
        Request, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE,
            IF_NONE_MATCH, LAST_MODIFIED, LOCATION, ORIGIN, VARY,
        },
    },
    response::Response,
    routing::head,
};
use imgcache::application::orchestrator::{OrchestratorParts, RequestOrchestrator};
use imgcache::cache::backend::{
    FilesystemBackend, MemoryObjectStore, ObjectStore, ObjectStoreBackend,
};
use imgcache::cache::{BackendContext, CacheBackend, CacheConfig, DeliveryMode};
use imgcache::infra::http::{
    CACHE_STATUS_HEADER, CorsPolicy, HttpState, REQUEST_ID_HEADER, build_router,
};
use imgcache::infra::source::FilesystemSource;
use imgcache::infra::transform::PassthroughEngine;
use tempfile::TempDir;
use tower::ServiceExt;
use url::Url;

struct Fixture {
    router: Router,
    _sources: TempDir,
    _cache: TempDir,
}

fn write_source(dir: &TempDir, relative: &str, bytes: &[u8]) {
    let path = dir.path().join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("source dir");
    }
    std::fs::write(path, bytes).expect("write source");
}

fn router_for(
    backend: Arc<dyn CacheBackend>,
    context: &BackendContext,
    sources: &TempDir,
    cors: &[&str],
) -> Router {
    let orchestrator = RequestOrchestrator::new(OrchestratorParts {
        backend,
        locks: context.locks().clone(),
        config: context.shared_config(),
        sources: Arc::new(FilesystemSource::new(sources.path())),
        engine: Arc::new(PassthroughEngine),
    });
    build_router(HttpState {
        orchestrator: Arc::new(orchestrator),
        cors: Arc::new(CorsPolicy::new(cors.iter().copied())),
    })
}

async fn filesystem_fixture(config: CacheConfig, public_base: Option<&str>, cors: &[&str]) -> Fixture {
    let sources = TempDir::new().expect("sources dir");
    let cache = TempDir::new().expect("cache dir");
    write_source(&sources, "photos/a.jpg", b"jpeg-bytes");

    let context = BackendContext::standalone(config);
    let backend = FilesystemBackend::new(
        cache.path(),
        public_base.map(|base| Url::parse(base).expect("base url")),
        context.clone(),
    )
    .await
    .expect("backend");

    Fixture {
        router: router_for(Arc::new(backend), &context, &sources, cors),
        _sources: sources,
        _cache: cache,
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

#[tokio::test]
async fn stream_delivery_sets_cache_headers() {
    let fixture = filesystem_fixture(CacheConfig::default(), None, &[]).await;

    let response = send(&fixture.router, get("/photos/a.jpg?width=200")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[CACHE_CONTROL], "public, max-age=31536000");
    assert_eq!(headers[CONTENT_TYPE], "image/jpeg");
    assert_eq!(headers[CACHE_STATUS_HEADER], "miss");
    assert!(headers.contains_key(ETAG));
    assert!(headers.contains_key(LAST_MODIFIED));
    assert!(headers.contains_key(REQUEST_ID_HEADER));
    assert_eq!(body_bytes(response).await, b"jpeg-bytes");

    let again = send(&fixture.router, get("/photos/a.jpg?width=200")).await;
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(again.headers()[CACHE_STATUS_HEADER], "hit");
    assert_eq!(again.headers()[ETAG], headers[ETAG]);
}

#[tokio::test]
async fn matching_etag_yields_empty_304() {
    let fixture = filesystem_fixture(CacheConfig::default(), None, &[]).await;

    let first = send(&fixture.router, get("/photos/a.jpg")).await;
    let etag = first.headers()[ETAG].clone();

    let conditional = Request::builder()
        .uri("/photos/a.jpg")
        .header(IF_NONE_MATCH, etag.clone())
        .body(Body::empty())
        .expect("request should build");
    let response = send(&fixture.router, conditional).await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()[ETAG], etag);
    assert!(!response.headers().contains_key(CONTENT_TYPE));
    assert_eq!(response.headers()[CACHE_CONTROL], "public, max-age=31536000");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn if_modified_since_in_the_future_yields_304() {
    let fixture = filesystem_fixture(CacheConfig::default(), None, &[]).await;
    let first = send(&fixture.router, get("/photos/a.jpg")).await;
    assert_eq!(first.status(), StatusCode::OK);

    let conditional = Request::builder()
        .uri("/photos/a.jpg")
        .header(IF_MODIFIED_SINCE, "Fri, 01 Jan 2100 00:00:00 GMT")
        .body(Body::empty())
        .expect("request should build");
    let response = send(&fixture.router, conditional).await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn stale_etag_gets_full_body() {
    let fixture = filesystem_fixture(CacheConfig::default(), None, &[]).await;

    let conditional = Request::builder()
        .uri("/photos/a.jpg")
        .header(IF_NONE_MATCH, "\"not-the-tag\"")
        .body(Body::empty())
        .expect("request should build");
    let response = send(&fixture.router, conditional).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"jpeg-bytes");
}

#[tokio::test]
async fn missing_source_is_404() {
    let fixture = filesystem_fixture(CacheConfig::default(), None, &[]).await;

    let response = send(&fixture.router, get("/photos/nope.jpg?width=10")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(response).await, b"Image not found");
}

#[tokio::test]
async fn health_route_answers() {
    let fixture = filesystem_fixture(CacheConfig::default(), None, &[]).await;
    let response = send(&fixture.router, get("/_health")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cors_header_only_for_allowed_origins() {
    let fixture = filesystem_fixture(
        CacheConfig::default(),
        None,
        &["app.example.com", "*.cdn.example.net"],
    )
    .await;

    for (origin, allowed) in [
        ("https://app.example.com", true),
        ("https://edge-1.cdn.example.net", true),
        ("https://cdn.example.net", false),
        ("https://evil.example.org", false),
    ] {
        let request = Request::builder()
            .uri("/photos/a.jpg")
            .header(ORIGIN, origin)
            .body(Body::empty())
            .expect("request should build");
        let response = send(&fixture.router, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[VARY], "origin");
        match response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN) {
            Some(value) => {
                assert!(allowed, "{origin} should not be allowed");
                assert_eq!(value, origin);
            }
            None => assert!(!allowed, "{origin} should be allowed"),
        }
    }
}

#[tokio::test]
async fn wildcard_cors_allows_any_origin() {
    let fixture = filesystem_fixture(CacheConfig::default(), None, &["*"]).await;
    let request = Request::builder()
        .uri("/photos/a.jpg")
        .header(ORIGIN, "https://anywhere.test")
        .body(Body::empty())
        .expect("request should build");
    let response = send(&fixture.router, request).await;
    assert_eq!(
        response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://anywhere.test"
    );
}

#[tokio::test]
async fn filesystem_redirect_points_at_public_url() {
    let config = CacheConfig {
        delivery_mode: DeliveryMode::Redirect,
        path_prefix_depth: 2,
        ..Default::default()
    };
    let fixture =
        filesystem_fixture(config, Some("https://cdn.example.com/cache"), &[]).await;

    let response = send(&fixture.router, get("/photos/a.jpg?width=200")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[CACHE_CONTROL], "public, max-age=31536000");

    let location = response.headers()[LOCATION].to_str().expect("location");
    assert!(location.starts_with("https://cdn.example.com/cache/"));
    assert!(location.ends_with(".jpg"));
    let relative = location.trim_start_matches("https://cdn.example.com/cache/");
    assert_eq!(relative.split('/').count(), 3, "two shard levels then the file");
}

async fn spawn_head_target(status: StatusCode) -> Url {
    let app = Router::new().route("/cache/{*path}", head(move || async move { status }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind head target");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Url::parse(&format!("http://{addr}/cache/")).expect("head url")
}

fn object_store_router(public_base: Url, sources: &TempDir) -> Router {
    let config = CacheConfig {
        delivery_mode: DeliveryMode::Redirect,
        ..Default::default()
    };
    let context = BackendContext::standalone(config);
    let store: Arc<dyn ObjectStore> =
        Arc::new(MemoryObjectStore::new().with_public_base_url(public_base));
    let backend = ObjectStoreBackend::new(store, reqwest::Client::new(), context.clone());
    router_for(Arc::new(backend), &context, sources, &[])
}

#[tokio::test]
async fn object_store_redirects_after_successful_head_check() {
    let base = spawn_head_target(StatusCode::OK).await;
    let sources = TempDir::new().expect("sources dir");
    write_source(&sources, "photos/a.jpg", b"jpeg-bytes");
    let router = object_store_router(base.clone(), &sources);

    let response = send(&router, get("/photos/a.jpg?width=64")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[LOCATION].to_str().expect("location");
    assert!(location.starts_with(base.as_str()));
}

#[tokio::test]
async fn object_store_streams_when_head_check_misses() {
    let base = spawn_head_target(StatusCode::NOT_FOUND).await;
    let sources = TempDir::new().expect("sources dir");
    write_source(&sources, "photos/a.jpg", b"jpeg-bytes");
    let router = object_store_router(base, &sources);

    let response = send(&router, get("/photos/a.jpg?width=64")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"jpeg-bytes");
}
