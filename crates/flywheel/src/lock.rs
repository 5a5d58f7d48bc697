//! Named, short-TTL mutual exclusion.
//!
//! A coarse lock for critical sections requested by callers — the core
//! engines coordinate through row leases, not through this primitive.
//! The backend is an atomic add-if-absent with expiry: cluster-safe when
//! the backing store is shared (a cache or the database), process-local
//! with the in-memory backend.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::LockConfig;
use crate::{Error, Result};

/// Backend seam for the lock primitive.
pub trait LockStore: Send + Sync + Clone + 'static {
    /// Atomically take the key if absent or expired. Expired values are
    /// cleared as part of the attempt. Returns whether the key was taken.
    fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Drop the key unconditionally.
    fn release(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Per-acquisition overrides for the configured lock parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Lock TTL; clamped to 1–60 seconds.
    pub duration: Option<Duration>,
    /// Acquisition attempts; clamped to at most 20.
    pub retries: Option<u32>,
    /// Sleep between attempts; at least 125 ms.
    pub retry_interval: Option<Duration>,
}

/// Acquires and releases named locks with bounded retries.
#[derive(Clone)]
pub struct LockManager<S: LockStore> {
    store: S,
    config: LockConfig,
}

impl<S: LockStore> LockManager<S> {
    /// Create a manager with the given backend and defaults.
    pub fn new(store: S, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Acquire `prefix:name` with the configured parameters.
    ///
    /// Retries with a sleep between attempts; expiry is compared against
    /// wall-clock now on every attempt, so a holder that died is replaced
    /// as soon as its TTL elapses.
    pub async fn acquire(&self, prefix: &str, name: &str) -> Result<()> {
        self.acquire_with(prefix, name, LockOptions::default()).await
    }

    /// Acquire with per-call overrides.
    pub async fn acquire_with(
        &self,
        prefix: &str,
        name: &str,
        options: LockOptions,
    ) -> Result<()> {
        let key = lock_key(prefix, name);
        let ttl = options
            .duration
            .unwrap_or_else(|| Duration::from_secs(self.config.duration_seconds))
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        let retries = options.retries.unwrap_or(self.config.retries).min(20);
        let retry_interval = options
            .retry_interval
            .unwrap_or_else(|| Duration::from_millis(self.config.retry_interval_ms))
            .max(Duration::from_millis(125));

        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            if self.store.try_acquire(&key, ttl).await? {
                debug!(key = %key, attempt, "Lock acquired");
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(retry_interval).await;
            }
        }

        Err(Error::LockUnavailable { key, attempts })
    }

    /// Release `prefix:name`.
    pub async fn release(&self, prefix: &str, name: &str) -> Result<()> {
        self.store.release(&lock_key(prefix, name)).await
    }

    /// Run `f` under the lock, releasing on every exit path.
    pub async fn with_lock<F, Fut, T>(&self, prefix: &str, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(prefix, name).await?;
        let result = f().await;
        // Release even when the callback failed; a release failure only
        // surfaces if the callback itself succeeded.
        let released = self.release(prefix, name).await;
        match result {
            Ok(value) => {
                released?;
                Ok(value)
            }
            Err(error) => Err(error),
        }
    }
}

fn lock_key(prefix: &str, name: &str) -> String {
    format!("{prefix}:{name}")
}

/// Process-local lock backend over a shared map.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    entries: Arc<Mutex<HashMap<String, OffsetDateTime>>>,
}

impl MemoryLockStore {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(expires_at) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(key.to_owned(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
