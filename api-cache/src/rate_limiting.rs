//! Per-path admission control.
//!
//! Every distinct request path gets its own token bucket, created the first
//! time the path is seen and kept for the life of the process.

use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

pub use governor::{DefaultDirectRateLimiter, Quota};

use crate::{config::RateLimitConfig, rules::RateLimitRule};

/// Rate and burst applied to paths without a matching rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDefaults {
    /// Token refill rate
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl From<&RateLimitConfig> for RateLimitDefaults {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_second: config.requests_per_second,
            burst: config.burst,
        }
    }
}

fn quota(requests_per_second: f64, burst: u32) -> Quota {
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    let period = Duration::try_from_secs_f64(1.0 / requests_per_second)
        .ok()
        .filter(|period| !period.is_zero())
        .unwrap_or(Duration::from_nanos(1));
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(burst)
}

/// Registry mapping each request path to its limiter.
///
/// Lookups take the read lock; a missing path upgrades to the write lock and
/// re-checks before inserting, so at most one limiter is ever observable for
/// a path. Entries are never evicted.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    defaults: RateLimitDefaults,
    limiters: RwLock<HashMap<String, Arc<DefaultDirectRateLimiter>>>,
}

impl RateLimiterRegistry {
    /// Create an empty registry using `defaults` for paths without a rule.
    pub fn new(defaults: RateLimitDefaults) -> Self {
        Self { defaults, limiters: RwLock::new(HashMap::new()) }
    }

    /// Returns the limiter for `path`, creating it from `rule` (or the
    /// defaults) on first sight. Later calls ignore `rule`.
    pub fn limiter(
        &self,
        path: &str,
        rule: Option<&RateLimitRule>,
    ) -> Arc<DefaultDirectRateLimiter> {
        if let Some(limiter) = self
            .limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Arc::clone(limiter);
        }

        let mut limiters =
            self.limiters.write().unwrap_or_else(PoisonError::into_inner);
        // another caller may have inserted between the two locks
        if let Some(limiter) = limiters.get(path) {
            return Arc::clone(limiter);
        }
        let (rps, burst) = match rule {
            Some(rule) => (rule.requests_per_second, rule.burst),
            None => (self.defaults.requests_per_second, self.defaults.burst),
        };
        let limiter = Arc::new(DefaultDirectRateLimiter::direct(quota(rps, burst)));
        limiters.insert(path.to_string(), Arc::clone(&limiter));
        limiter
    }

    /// Consumes one token for `path` if available. Never blocks.
    pub fn allow(&self, path: &str, rule: Option<&RateLimitRule>) -> bool {
        self.limiter(path, rule).check().is_ok()
    }

    /// Number of paths seen so far.
    pub fn len(&self) -> usize {
        self.limiters.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True before any path has been seen.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
