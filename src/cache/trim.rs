//! Background trimming of expired artifacts.
//!
//! Sweeps run on their own task, started by a timer or by a nudge sent when a request
//! finishes. Never inline with a request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{BackendResult, CacheBackend, TrimReport};
use super::config::CacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::trim";

/// Cheap handle request handlers use to signal that a sweep may be due.
#[derive(Clone)]
pub struct TrimTrigger {
    notify: Arc<Notify>,
}

impl TrimTrigger {
    /// Record that a request finished. Coalesces with pending signals.
    pub fn request_completed(&self) {
        self.notify.notify_one();
    }
}

pub struct TrimScheduler {
    backend: Arc<dyn CacheBackend>,
    config: Arc<CacheConfig>,
    notify: Arc<Notify>,
    last_sweep: Mutex<Option<Instant>>,
}

impl TrimScheduler {
    pub fn new(backend: Arc<dyn CacheBackend>, config: Arc<CacheConfig>) -> Self {
        Self {
            backend,
            config,
            notify: Arc::new(Notify::new()),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn trigger(&self) -> TrimTrigger {
        TrimTrigger {
            notify: Arc::clone(&self.notify),
        }
    }

    /// Whether enough time passed since the previous sweep started.
    pub fn is_due(&self) -> bool {
        let spacing = self.config.trim_interval();
        mutex_lock(&self.last_sweep, SOURCE, "is_due")
            .is_none_or(|started| started.elapsed() >= spacing)
    }

    /// Run one sweep now, deleting everything older than the max-age horizon.
    pub async fn sweep(&self, cancel: &CancellationToken) -> BackendResult<TrimReport> {
        *mutex_lock(&self.last_sweep, SOURCE, "sweep") = Some(Instant::now());

        let started = Instant::now();
        let horizon = self.config.expiry_horizon(OffsetDateTime::now_utc());
        let result = self.backend.trim_older_than(horizon, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(report) => {
                counter!("imgcache_trim_deleted_total").increment(report.deleted);
                info!(
                    target = SOURCE,
                    op = "sweep",
                    backend = self.backend.name(),
                    result = if report.cancelled { "cancelled" } else { "ok" },
                    pages = report.pages,
                    examined = report.examined,
                    deleted = report.deleted,
                    skipped_busy = report.skipped_busy,
                    failed = report.failed,
                    elapsed_ms,
                    "Trim sweep finished"
                );
            }
            Err(err) => warn!(
                target = SOURCE,
                op = "sweep",
                backend = self.backend.name(),
                result = "error",
                error = %err,
                elapsed_ms,
                "Trim sweep failed"
            ),
        }

        result
    }

    /// Sweep on every interval tick and on request nudges that arrive when a sweep is due,
    /// until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.trim_enabled {
            debug!(target = SOURCE, op = "run", result = "disabled", "Trim scheduler disabled");
            return;
        }

        let period = self.config.trim_interval().max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.notify.notified() => {
                    if !self.is_due() {
                        continue;
                    }
                }
            }

            // Errors are logged inside `sweep`; the next tick retries.
            let _ = self.sweep(&cancel).await;
        }

        debug!(target = SOURCE, op = "run", result = "stopped", "Trim scheduler stopped");
    }
}
