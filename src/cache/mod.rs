//! Artifact cache.
//!
//! - [`keys`]: fingerprints and sharded storage paths
//! - [`dedup`]: per-key mutual exclusion for rebuilds
//! - [`index`]: in-process freshness index in front of the backend
//! - [`backend`]: filesystem and object-store backends
//! - [`trim`]: background deletion of expired artifacts
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! max_age_days = 365
//! trim_enabled = true
//! delivery_mode = "stream"
//! path_prefix_depth = 6
//! head_check_timeout_ms = 1000
//! # ... see config.rs for all options
//! ```

pub mod backend;
mod config;
pub mod dedup;
pub mod index;
pub mod keys;
mod lock;
pub mod trim;

pub use backend::{
    BackendContext, BackendError, CacheBackend, ConditionalRequest, Freshness, ServeInstruction,
    SourceMeta, TrimReport,
};
pub use config::{CacheConfig, DeliveryMode};
pub use dedup::{DedupGuard, DedupLock};
pub use index::{CacheEntry, FreshnessIndex};
pub use keys::{CacheKey, Fingerprinter, StoragePath, output_extension};
pub use trim::{TrimScheduler, TrimTrigger};
