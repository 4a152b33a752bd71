use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "imgcache_hit_total",
            Unit::Count,
            "Requests answered from a fresh cached artifact."
        );
        describe_counter!(
            "imgcache_miss_total",
            Unit::Count,
            "Requests whose artifact was stale or missing."
        );
        describe_counter!(
            "imgcache_rebuild_total",
            Unit::Count,
            "Artifact rebuilds started, including self-healing rebuilds."
        );
        describe_counter!(
            "imgcache_rebuild_failed_total",
            Unit::Count,
            "Artifact rebuilds that failed, labelled by failure kind."
        );
        describe_counter!(
            "imgcache_index_hit_total",
            Unit::Count,
            "Freshness checks answered by the in-process index."
        );
        describe_counter!(
            "imgcache_trim_deleted_total",
            Unit::Count,
            "Expired artifacts deleted by trim sweeps."
        );
        describe_histogram!(
            "imgcache_transform_ms",
            Unit::Milliseconds,
            "Transform engine latency in milliseconds."
        );
        describe_histogram!(
            "imgcache_lock_wait_ms",
            Unit::Milliseconds,
            "Time spent waiting for the per-artifact dedup lock."
        );
    });
}
