//! Time-to-live memoisation of idempotent external calls, backed by `moka`.
//!
//! Entries are content-addressed by [`CacheKey`] (call kind, digest of the
//! normalised input, model id). Concurrent callers asking for the same
//! uncached key share one in-flight computation. Failed computations are
//! never stored.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

pub const GENERATION_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub const SEARCH_TTL: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;
/// Longest accepted time-to-live; longer values are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: String,
    pub input_digest: String,
    pub model: String,
}

impl CacheKey {
    /// Build a key; the input is whitespace-normalised before hashing.
    pub fn new(kind: impl Into<String>, input: &str, model: impl Into<String>) -> Self {
        let normalised = input.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut hasher = Sha256::new();
        hasher.update(normalised.as_bytes());
        Self {
            kind: kind.into(),
            input_digest: format!("{:x}", hasher.finalize()),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct ResponseCache<V> {
    ttl: Duration,
    inner: Cache<CacheKey, V>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> std::fmt::Debug for ResponseCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> ResponseCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: u64) -> Self {
        let ttl = ttl.min(MAX_TTL);
        let inner = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_entries)
            .build();
        Self {
            ttl,
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key`, or run `compute` once and store it.
    /// Callers racing on the same key wait for the first one's result.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let computed = AtomicBool::new(false);
        let init = async {
            computed.store(true, Ordering::Relaxed);
            compute().await
        };
        let result = self.inner.try_get_with(key.clone(), init).await;

        if computed.load(Ordering::Relaxed) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %key.kind, model = %key.model, ok = result.is_ok(), "cache miss");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %key.kind, model = %key.model, "cache hit");
        }
        result.map_err(|e| (*e).clone())
    }

    /// Number of live entries, after pending evictions are applied.
    pub async fn len(&self) -> u64 {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
