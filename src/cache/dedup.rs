//! Keyed, reference-counted mutual exclusion.
//!
//! The first caller for a key proceeds immediately; later callers for the same key queue on a
//! per-key async mutex and are granted access one at a time. Callers for different keys never
//! contend beyond the short registry critical section.
//!
//! The registry is a single `Mutex<HashMap>`; every reference-count change and every removal
//! happens under it, so a handle can never be observed with a zero count. I/O never happens
//! while the registry is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::dedup";

/// Per-key serialization point shared by request handling and trimming.
#[derive(Clone, Default)]
pub struct DedupLock {
    registry: Arc<Mutex<HashMap<String, LockHandle>>>,
}

/// Registry entry: the per-key gate plus the number of callers holding or awaiting it.
struct LockHandle {
    gate: Arc<AsyncMutex<()>>,
    ref_count: usize,
}

impl DedupLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait cooperatively until the caller holds `key`.
    ///
    /// Dropping the returned future while it waits releases the caller's registration without
    /// disturbing other waiters.
    pub async fn acquire(&self, key: &str) -> DedupGuard {
        let registration = self.register(key);
        let permit = Arc::clone(&registration.gate).lock_owned().await;
        DedupGuard {
            _permit: permit,
            registration,
        }
    }

    /// Block the current thread until the caller holds `key`.
    ///
    /// For synchronous hosts only; panics if called from within an async runtime context.
    pub fn acquire_blocking(&self, key: &str) -> DedupGuard {
        let registration = self.register(key);
        let permit = Arc::clone(&registration.gate).blocking_lock_owned();
        DedupGuard {
            _permit: permit,
            registration,
        }
    }

    /// Take `key` only if nobody currently holds it.
    pub fn try_acquire(&self, key: &str) -> Option<DedupGuard> {
        let registration = self.register(key);
        let permit = Arc::clone(&registration.gate).try_lock_owned().ok()?;
        Some(DedupGuard {
            _permit: permit,
            registration,
        })
    }

    /// Whether any caller currently holds or awaits `key`.
    pub fn contains(&self, key: &str) -> bool {
        mutex_lock(&self.registry, SOURCE, "contains").contains_key(key)
    }

    /// Number of keys with at least one holder or waiter.
    pub fn len(&self) -> usize {
        mutex_lock(&self.registry, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of holders plus waiters for `key`.
    pub fn ref_count(&self, key: &str) -> usize {
        mutex_lock(&self.registry, SOURCE, "ref_count")
            .get(key)
            .map_or(0, |handle| handle.ref_count)
    }

    fn register(&self, key: &str) -> Registration {
        let mut registry = mutex_lock(&self.registry, SOURCE, "register");
        let handle = registry
            .entry(key.to_string())
            .or_insert_with(|| LockHandle {
                gate: Arc::new(AsyncMutex::new(())),
                ref_count: 0,
            });
        handle.ref_count += 1;

        Registration {
            registry: Arc::clone(&self.registry),
            key: key.to_string(),
            gate: Arc::clone(&handle.gate),
        }
    }
}

impl fmt::Debug for DedupLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupLock")
            .field("keys", &self.len())
            .finish()
    }
}

/// One caller's claim on a registry entry. Dropping it is the only way to decrement.
struct Registration {
    registry: Arc<Mutex<HashMap<String, LockHandle>>>,
    key: String,
    gate: Arc<AsyncMutex<()>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut registry = mutex_lock(&self.registry, SOURCE, "release");
        if let Some(handle) = registry.get_mut(&self.key) {
            debug_assert!(handle.ref_count > 0, "dedup ref count underflow");
            handle.ref_count -= 1;
            if handle.ref_count == 0 {
                registry.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key; released on drop on every exit path.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct DedupGuard {
    // Field order matters: the gate is released before the registration is decremented.
    _permit: OwnedMutexGuard<()>,
    registration: Registration,
}

impl DedupGuard {
    pub fn key(&self) -> &str {
        &self.registration.key
    }
}

impl fmt::Debug for DedupGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupGuard")
            .field("key", &self.key())
            .finish()
    }
}
