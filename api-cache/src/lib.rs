#![forbid(unsafe_code, future_incompatible)]
#![deny(
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_numeric_casts
)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! The core of a caching reverse proxy: it classifies each inbound request
//! against a table of endpoint rules, serves repeatable `GET` responses from a
//! shared key-value store, and forwards everything else to an upstream HTTP
//! service with bounded, exponentially backed-off retries.
//!
//! The pieces, leaves first:
//!
//! - [`RuleTable`]: immutable cache and rate-limit rules compiled from
//! configuration, with [`RuleTable::resolve_cache`] and
//! [`RuleTable::resolve_rate_limit`] implementing endpoint precedence.
//! - [`Keyer`] / [`DigestKeyer`]: deterministic SHA-256 cache keys built from
//! the method, path and the query parameters and headers a rule designates.
//! - [`RateLimiterRegistry`]: one token bucket per request path, created
//! lazily on first sight.
//! - [`Upstream`]: the retrying upstream client.
//! - [`ApiCache`]: the per-request orchestration tying all of the above to a
//! [`CacheManager`] store backend.
//!
//! ## Basic Usage
//!
//! ```rust
//! # #[cfg(feature = "manager-moka")]
//! # {
//! use api_cache::{ApiCache, Config, MokaManager};
//!
//! let config = Config::from_yaml_str(
//!     r#"
//! upstream:
//!   base_url: "https://api.example.com"
//! cache:
//!   default_ttl: 5m
//!   endpoints:
//!     - path: /query
//!       ttl: 1h
//!       cache_key_query_params: [function, symbol]
//! "#,
//! )
//! .unwrap();
//!
//! let cache = ApiCache::from_config(&config, MokaManager::default()).unwrap();
//! assert_eq!(cache.rules().cache_rules().len(), 1);
//! # }
//! ```
//!
//! ## Features
//!
//! - `manager-moka` (default): enable [moka](https://github.com/moka-rs/moka),
//! an in-memory store backend with per-entry expiry.
//! - `manager-redis` (default): enable a Redis/Valkey store backend via
//! [redis](https://github.com/redis-rs/redis-rs).
#[macro_use]
mod logging;

mod config;
mod error;
mod forward;
mod headers;
mod key;
mod managers;
mod metrics;
mod proxy;
mod rate_limiting;
mod resolver;
mod rules;

#[cfg(test)]
mod test;

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

pub use config::{
    CacheConfig, Config, EndpointCacheConfig, EndpointRateLimitConfig,
    LogFormat, LogOutput, LoggingConfig, RateLimitConfig, RetryConfig,
    ServerConfig, StoreBackend, StoreConfig, UpstreamConfig,
};
pub use error::{
    BoxError, ConfigError, Result, StoreError, UpstreamError,
};
pub use forward::{RetryPolicy, RetryState, Upstream};
pub use key::{DigestKeyer, Keyer, KEY_PREFIX};
pub use logging::Logger;
pub use managers::CacheManager;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use proxy::{ApiCache, ApiCacheOptions};
pub use rate_limiting::{RateLimitDefaults, RateLimiterRegistry};
pub use resolver::{MatchKind, MatchResult, QueryParams};
pub use rules::{CacheRule, PathMatch, RateLimitRule, RuleTable};

#[cfg(feature = "manager-moka")]
pub use managers::moka::MokaManager;

#[cfg(feature = "manager-redis")]
pub use managers::redis::RedisManager;

// Custom headers used to indicate cache status (hit or miss)
/// `x-cache` header: Value will be HIT if the response was served from cache, MISS if not
pub const XCACHE: &str = "x-cache";
/// `x-cache-time` header: RFC 3339 time the served entry was stored, only present on a HIT
pub const XCACHETIME: &str = "x-cache-time";
/// `x-request-id` header used to correlate log records for one request
pub const XREQUESTID: &str = "x-request-id";

/// Represents a basic cache status
/// Used in the custom header `x-cache`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HitOrMiss {
    /// Yes, there was a hit
    HIT,
    /// No, there was no hit
    MISS,
}

impl HitOrMiss {
    /// The `x-cache` header value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HIT => "HIT",
            Self::MISS => "MISS",
        }
    }
}

impl std::fmt::Display for HitOrMiss {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit written to the store: one successful upstream response.
///
/// Only ever created for statuses in `200..300`. Entries expire through the
/// store's own TTL and are never mutated, only overwritten by a later write
/// under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CachedEntry {
    /// Upstream status code
    pub status: u16,
    /// Upstream headers, lowercased names mapped to every raw value in order
    pub headers: BTreeMap<String, Vec<Vec<u8>>>,
    /// Upstream body, byte for byte
    pub body: Vec<u8>,
    /// When the entry was stored
    pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
    /// Captures a response, stamping it with the current time.
    pub fn new(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let mut stored: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
        for (name, value) in headers {
            stored
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.as_bytes().to_vec());
        }
        Self {
            status: status.as_u16(),
            headers: stored,
            body: body.to_vec(),
            cached_at: Utc::now(),
        }
    }

    /// Returns the stored status, or `None` if it is not a valid status code.
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status).ok()
    }

    /// Rebuilds the stored headers, preserving multi-valued headers.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_bytes(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }

    /// The storage time formatted for the `x-cache-time` header.
    pub fn cached_at_rfc3339(&self) -> String {
        self.cached_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Serializes the entry for a store backend.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, StoreError> {
        postcard::to_allocvec(self).map_err(StoreError::Encode)
    }

    /// Deserializes an entry read from a store backend.
    pub fn from_slice(
        bytes: &[u8],
    ) -> std::result::Result<Self, StoreError> {
        postcard::from_bytes(bytes).map_err(StoreError::Malformed)
    }
}
