use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache and proxy counters.
///
/// Counters are observational only and never influence request handling.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Requests served from the store.
    pub hits: AtomicU64,
    /// Cacheable requests that went upstream.
    pub misses: AtomicU64,
    /// Responses written to the store.
    pub stores: AtomicU64,
    /// Store reads or writes that failed or timed out.
    pub store_errors: AtomicU64,
    /// Requests rejected by admission control.
    pub rate_limited: AtomicU64,
    /// Requests answered with 502 after the retry budget ran out.
    pub upstream_failures: AtomicU64,
}

/// Point-in-time copy of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// See [`CacheMetrics::hits`]
    pub hits: u64,
    /// See [`CacheMetrics::misses`]
    pub misses: u64,
    /// See [`CacheMetrics::stores`]
    pub stores: u64,
    /// See [`CacheMetrics::store_errors`]
    pub store_errors: u64,
    /// See [`CacheMetrics::rate_limited`]
    pub rate_limited: u64,
    /// See [`CacheMetrics::upstream_failures`]
    pub upstream_failures: u64,
    /// Hits over hits plus misses
    pub hit_rate: f64,
}

impl CacheMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate cache hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }

    fn counters(&self) -> [&AtomicU64; 6] {
        [
            &self.hits,
            &self.misses,
            &self.stores,
            &self.store_errors,
            &self.rate_limited,
            &self.upstream_failures,
        ]
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
