use std::{process, sync::Arc};

use imgcache::{
    application::{
        error::AppError,
        orchestrator::{OrchestratorParts, RequestOrchestrator},
        ports::{SourceImageService, TransformEngine},
    },
    cache::{
        BackendContext, CacheBackend, CacheConfig, DedupLock, FreshnessIndex, TrimScheduler,
        backend::{FilesystemBackend, MemoryObjectStore, ObjectStore, ObjectStoreBackend},
    },
    config::{self, BackendKind, SourceSettings, TransformSettings},
    infra::{
        error::InfraError,
        http::{self, CorsPolicy, HttpState},
        source::{FilesystemSource, HttpSource},
        telemetry,
        transform::{CommandTransformEngine, PassthroughEngine},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const USER_AGENT: &str = concat!("imgcache/", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Trim(_) => run_trim(settings).await,
    }
}

/// Shared cache state, built once at startup.
struct CacheRuntime {
    config: Arc<CacheConfig>,
    locks: DedupLock,
    backend: Arc<dyn CacheBackend>,
}

async fn build_cache_runtime(
    settings: &config::Settings,
    http_client: &reqwest::Client,
) -> Result<CacheRuntime, AppError> {
    let config = Arc::new(settings.cache_config());
    let index = Arc::new(FreshnessIndex::new(config.index_capacity_non_zero()));
    let locks = DedupLock::new();
    let context = BackendContext::new(Arc::clone(&config), index, locks.clone());

    let public_base_url = settings.backend.public_base_url.clone();
    let backend: Arc<dyn CacheBackend> = match settings.backend.kind {
        BackendKind::Filesystem => Arc::new(
            FilesystemBackend::new(&settings.backend.root, public_base_url, context).await?,
        ),
        BackendKind::Memory => {
            let mut store = MemoryObjectStore::new();
            if let Some(base) = public_base_url {
                store = store.with_public_base_url(base);
            }
            let store: Arc<dyn ObjectStore> = Arc::new(store);
            Arc::new(ObjectStoreBackend::new(store, http_client.clone(), context))
        }
    };

    info!(
        target = "imgcache::bootstrap",
        backend = backend.name(),
        delivery_mode = ?config.delivery_mode,
        max_age_days = config.max_age_days,
        path_prefix_depth = config.path_prefix_depth,
        "Cache backend ready"
    );

    Ok(CacheRuntime {
        config,
        locks,
        backend,
    })
}

fn build_http_client() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| AppError::from(InfraError::http_client(err.to_string())))
}

fn build_source(
    settings: &SourceSettings,
    http_client: &reqwest::Client,
) -> Arc<dyn SourceImageService> {
    match settings {
        SourceSettings::Filesystem { root } => Arc::new(FilesystemSource::new(root.clone())),
        SourceSettings::Http { base_url, timeout } => Arc::new(HttpSource::new(
            http_client.clone(),
            base_url.clone(),
            *timeout,
        )),
    }
}

fn build_engine(settings: &TransformSettings) -> Arc<dyn TransformEngine> {
    match settings {
        TransformSettings::Passthrough { .. } => Arc::new(PassthroughEngine),
        TransformSettings::Command { program, args, .. } => {
            Arc::new(CommandTransformEngine::new(program.clone(), args.clone()))
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let http_client = build_http_client()?;
    let runtime = build_cache_runtime(&settings, &http_client).await?;

    let scheduler = Arc::new(TrimScheduler::new(
        Arc::clone(&runtime.backend),
        Arc::clone(&runtime.config),
    ));

    let orchestrator = RequestOrchestrator::new(OrchestratorParts {
        backend: Arc::clone(&runtime.backend),
        locks: runtime.locks.clone(),
        config: Arc::clone(&runtime.config),
        sources: build_source(&settings.source, &http_client),
        engine: build_engine(&settings.transform),
    })
    .with_transform_timeout(settings.transform.timeout())
    .with_trim_trigger(scheduler.trigger());

    let state = HttpState {
        orchestrator: Arc::new(orchestrator),
        cors: Arc::new(CorsPolicy::new(&settings.cors.allow_origins)),
    };

    let cancel = CancellationToken::new();
    let trim_handle = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

    let result = serve_http(&settings, state, cancel.clone()).await;

    cancel.cancel();
    if tokio::time::timeout(settings.server.graceful_shutdown, trim_handle)
        .await
        .is_err()
    {
        warn!(
            target = "imgcache::shutdown",
            timeout_secs = settings.server.graceful_shutdown.as_secs(),
            "Trim sweep did not stop within the graceful shutdown window"
        );
    }

    result
}

async fn serve_http(
    settings: &config::Settings,
    state: HttpState,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "imgcache::bootstrap",
        addr = %settings.server.addr,
        "Listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(target = "imgcache::shutdown", "Shutdown requested");
            cancel.cancel();
        })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn run_trim(settings: config::Settings) -> Result<(), AppError> {
    if settings.backend.kind == BackendKind::Memory {
        return Err(AppError::from(InfraError::configuration(
            "the memory backend holds nothing to trim outside a running server",
        )));
    }

    let http_client = build_http_client()?;
    let runtime = build_cache_runtime(&settings, &http_client).await?;
    let scheduler = TrimScheduler::new(runtime.backend, runtime.config);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let report = scheduler.sweep(&cancel).await;
    signal_task.abort();
    let report = report?;

    info!(
        target = "imgcache::trim",
        deleted = report.deleted,
        examined = report.examined,
        cancelled = report.cancelled,
        "Trim finished"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "imgcache::shutdown", error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "imgcache::shutdown", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
