//! Cache configuration.
//!
//! Built once at startup from the `[cache]` settings section and shared immutably.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;
use time::{OffsetDateTime, PrimitiveDateTime};

const SECONDS_PER_DAY: u64 = 86_400;

const DEFAULT_MAX_AGE_DAYS: u32 = 365;
const DEFAULT_PATH_PREFIX_DEPTH: usize = 6;
const DEFAULT_HEAD_CHECK_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_INDEX_TTL_SECS: u64 = 60;
const DEFAULT_INDEX_CAPACITY: usize = 10_000;
const DEFAULT_TRIM_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_TRIM_PAGE_SIZE: usize = 500;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_READ_RETRIES: u32 = 3;

/// How a cached artifact reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Send the client to the backend's public URL.
    Redirect,
    /// Proxy the stored bytes through the current response.
    Stream,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redirect" => Ok(Self::Redirect),
            "stream" => Ok(Self::Stream),
            other => Err(format!("unknown delivery mode `{other}`")),
        }
    }
}

/// Typed cache options.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Freshness horizon of a stored artifact, in days.
    pub max_age_days: u32,
    /// Run background trim sweeps.
    pub trim_enabled: bool,
    pub delivery_mode: DeliveryMode,
    /// Number of one-character directory shards in front of each key.
    pub path_prefix_depth: usize,
    /// Timeout of the existence check issued before a redirect.
    pub head_check_timeout_ms: u64,
    /// Lifetime of a freshness index entry.
    pub index_ttl_secs: u64,
    /// Maximum resident freshness index entries.
    pub index_capacity: usize,
    /// Minimum spacing between trim sweeps.
    pub trim_interval_secs: u64,
    /// Entries examined per trim page.
    pub trim_page_size: usize,
    /// Upper bound on any single backend call.
    pub backend_timeout_ms: u64,
    /// Attempts for backend read operations before giving up.
    pub read_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            trim_enabled: true,
            delivery_mode: DeliveryMode::Stream,
            path_prefix_depth: DEFAULT_PATH_PREFIX_DEPTH,
            head_check_timeout_ms: DEFAULT_HEAD_CHECK_TIMEOUT_MS,
            index_ttl_secs: DEFAULT_INDEX_TTL_SECS,
            index_capacity: DEFAULT_INDEX_CAPACITY,
            trim_interval_secs: DEFAULT_TRIM_INTERVAL_SECS,
            trim_page_size: DEFAULT_TRIM_PAGE_SIZE,
            backend_timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
            read_retries: DEFAULT_READ_RETRIES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_age_days: settings.max_age_days,
            trim_enabled: settings.trim_enabled,
            delivery_mode: settings.delivery_mode,
            path_prefix_depth: settings.path_prefix_depth,
            head_check_timeout_ms: settings.head_check_timeout_ms,
            index_ttl_secs: settings.index_ttl_secs,
            index_capacity: settings.index_capacity.get(),
            trim_interval_secs: settings.trim_interval_secs,
            trim_page_size: settings.trim_page_size.get(),
            backend_timeout_ms: settings.backend_timeout_ms,
            read_retries: settings.read_retries,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_age_days) * SECONDS_PER_DAY)
    }

    /// `Cache-Control` value advertised on every served artifact.
    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.max_age().as_secs())
    }

    /// Whether an artifact created at `created_at` is still inside the max-age window at `now`.
    pub fn is_within_max_age(&self, created_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        let window = time::Duration::days(i64::from(self.max_age_days));
        match created_at.checked_add(window) {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }

    /// Oldest creation time that is still fresh at `now`; anything older is trimmable.
    pub fn expiry_horizon(&self, now: OffsetDateTime) -> OffsetDateTime {
        let window = time::Duration::days(i64::from(self.max_age_days));
        now.checked_sub(window)
            .unwrap_or(PrimitiveDateTime::MIN.assume_utc())
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }

    pub fn head_check_timeout(&self) -> Duration {
        Duration::from_millis(self.head_check_timeout_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_secs)
    }

    /// Index capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn index_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.index_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Trim page size, never below 1.
    pub fn trim_page_size_non_zero(&self) -> usize {
        self.trim_page_size.max(1)
    }

    /// Read attempts, never below 1.
    pub fn read_attempts(&self) -> u32 {
        self.read_retries.max(1)
    }
}
