//! Per-request orchestration: admission, cache lookup, upstream call, cache
//! population and response assembly.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{
    header::{HeaderName, CONTENT_TYPE},
    request::Parts,
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
};

use crate::{
    config::{redact_query, Config},
    error::{ConfigError, StoreError, UpstreamError},
    forward::Upstream,
    headers::{copy_headers, forward_downstream},
    key::{DigestKeyer, Keyer},
    logging::Logger,
    managers::CacheManager,
    metrics::CacheMetrics,
    rate_limiting::{RateLimitDefaults, RateLimiterRegistry},
    resolver::QueryParams,
    rules::{CacheRule, RuleTable},
    CachedEntry, HitOrMiss, XCACHE, XCACHETIME, XREQUESTID,
};

const RATE_LIMITED_BODY: &str =
    r#"{"error":"rate limit exceeded","message":"too many requests"}"#;
const UPSTREAM_UNAVAILABLE: &str = "upstream service unavailable";
const UPSTREAM_READ_FAILED: &str = "failed to read upstream response";
const INTERNAL_ERROR: &str = "internal server error";

/// Process-wide knobs of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCacheOptions {
    /// TTL used when no rule matched or the rule's TTL is zero
    pub default_ttl: Duration,
    /// Bound on each store read and write, zero for none
    pub store_timeout: Duration,
    /// Query parameters whose values are redacted in log records
    pub redact_query_params: Vec<String>,
}

impl Default for ApiCacheOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ApiCacheOptions {
    fn from(config: &Config) -> Self {
        Self {
            default_ttl: config.cache.default_ttl,
            store_timeout: config.store.operation_timeout,
            redact_query_params: config.logging.redact_query_params.clone(),
        }
    }
}

/// The caching reverse proxy engine.
///
/// Cheap to clone; clones share the store, rule table, limiter registry and
/// metrics.
pub struct ApiCache<M: CacheManager, K: Keyer = DigestKeyer> {
    store: Arc<M>,
    keyer: K,
    rules: Arc<RuleTable>,
    upstream: Upstream,
    rate_limiter: Option<Arc<RateLimiterRegistry>>,
    options: ApiCacheOptions,
    metrics: Arc<CacheMetrics>,
    logger: Logger,
}

impl<M: CacheManager, K: Keyer> Clone for ApiCache<M, K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keyer: self.keyer.clone(),
            rules: Arc::clone(&self.rules),
            upstream: self.upstream.clone(),
            rate_limiter: self.rate_limiter.clone(),
            options: self.options.clone(),
            metrics: Arc::clone(&self.metrics),
            logger: self.logger.clone(),
        }
    }
}

impl<M: CacheManager, K: Keyer> fmt::Debug for ApiCache<M, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ApiCache")
            .field("rules", &self.rules)
            .field("upstream", &self.upstream)
            .field("rate_limited", &self.rate_limiter.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<M: CacheManager> ApiCache<M, DigestKeyer> {
    /// Create an engine without rate limiting, using default options.
    pub fn new(store: M, rules: RuleTable, upstream: Upstream) -> Self {
        Self {
            store: Arc::new(store),
            keyer: DigestKeyer,
            rules: Arc::new(rules),
            upstream,
            rate_limiter: None,
            options: ApiCacheOptions::default(),
            metrics: Arc::new(CacheMetrics::new()),
            logger: Logger::global(),
        }
    }

    /// Validates `config`, compiles its rules and builds the upstream client.
    pub fn from_config(config: &Config, store: M) -> Result<Self, ConfigError> {
        config.validate()?;
        let rules = RuleTable::from_config(config)?;
        let upstream = Upstream::from_config(config)?;
        let mut cache = Self::new(store, rules, upstream)
            .with_options(ApiCacheOptions::from(config));
        if config.rate_limit.enabled {
            cache = cache.with_rate_limiter(RateLimiterRegistry::new(
                RateLimitDefaults::from(&config.rate_limit),
            ));
        }
        Ok(cache)
    }
}

impl<M: CacheManager, K: Keyer> ApiCache<M, K> {
    /// Replaces the cache key generator.
    pub fn with_keyer<K2: Keyer>(self, keyer: K2) -> ApiCache<M, K2> {
        ApiCache {
            store: self.store,
            keyer,
            rules: self.rules,
            upstream: self.upstream,
            rate_limiter: self.rate_limiter,
            options: self.options,
            metrics: self.metrics,
            logger: self.logger,
        }
    }

    /// Replaces the engine options.
    pub fn with_options(mut self, options: ApiCacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables admission control through `registry`.
    pub fn with_rate_limiter(mut self, registry: RateLimiterRegistry) -> Self {
        self.rate_limiter = Some(Arc::new(registry));
        self
    }

    /// Replaces the logging handle of the engine and its upstream client.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.upstream = self.upstream.with_logger(logger.clone());
        self.logger = logger;
        self
    }

    /// The logging handle shared with the engine's wrappers.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Counters shared by every clone of this engine.
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// The compiled rule table.
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// The store backend.
    pub fn store(&self) -> &M {
        &self.store
    }

    /// Removes one entry from the store.
    pub async fn invalidate(&self, cache_key: &str) -> Result<(), StoreError> {
        self.store.delete(cache_key).await?;
        log_info!(self.logger, "cache entry invalidated cache_key={cache_key}");
        Ok(())
    }

    /// Removes every entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        self.store.delete_by_prefix(prefix).await?;
        log_info!(self.logger, "cache entries invalidated prefix={prefix}");
        Ok(())
    }

    /// The TTL for a response matched to `rule`: the rule's TTL when
    /// positive, otherwise the default.
    pub fn resolve_ttl(&self, rule: Option<&CacheRule>) -> Duration {
        rule.map(|rule| rule.ttl)
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.options.default_ttl)
    }

    /// Serves one request.
    ///
    /// Never fails: every fault maps to a fixed response. Dropping the
    /// returned future cancels any store or upstream call in flight.
    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        let started = Instant::now();
        let (parts, body) = request.into_parts();
        let request_id = parts
            .headers
            .get(XREQUESTID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let path = parts.uri.path();
        log_info!(
            self.logger,
            "request received request_id={request_id} method={} path={path} query={}",
            parts.method,
            redact_query(
                &self.options.redact_query_params,
                parts.uri.query().unwrap_or("")
            )
        );

        if let Some(limiter) = &self.rate_limiter {
            let rule = self.rules.resolve_rate_limit(path);
            if !limiter.allow(path, rule) {
                CacheMetrics::incr(&self.metrics.rate_limited);
                log_warn!(
                    self.logger,
                    "rate limit exceeded request_id={request_id} method={} path={path}",
                    parts.method
                );
                return rate_limited();
            }
        }

        if parts.method != Method::GET {
            log_debug!(
                self.logger,
                "non-GET request, bypassing cache request_id={request_id} method={} path={path}",
                parts.method
            );
            return self.forward(&parts, &body, &request_id, None, started).await;
        }

        let query = QueryParams::from_uri(&parts.uri);
        let matched = self.rules.resolve_cache(path, &parts.method, &query);
        let cache_key = self.keyer.cache_key(&parts, &query, matched.rule);
        let ttl = self.resolve_ttl(matched.rule);
        log_debug!(
            self.logger,
            "cache key generated request_id={request_id} cache_key={cache_key} path={path} match={} rule={} ttl_s={}",
            matched.kind,
            matched.rule.map(CacheRule::identifier).unwrap_or("-"),
            ttl.as_secs()
        );

        match self.with_store_timeout(self.store.get(&cache_key)).await {
            Ok(Some(entry)) => {
                if let Some(response) = self.serve_hit(
                    entry,
                    &request_id,
                    &cache_key,
                    started,
                ) {
                    return response;
                }
            }
            Ok(None) => {}
            Err(e) => {
                CacheMetrics::incr(&self.metrics.store_errors);
                log_error!(
                    self.logger,
                    "failed to get from cache request_id={request_id} cache_key={cache_key} error={e}"
                );
            }
        }

        CacheMetrics::incr(&self.metrics.misses);
        log_debug!(
            self.logger,
            "cache miss request_id={request_id} cache_key={cache_key}"
        );
        self.forward(&parts, &body, &request_id, Some((&cache_key, ttl)), started)
            .await
    }

    fn serve_hit(
        &self,
        entry: CachedEntry,
        request_id: &str,
        cache_key: &str,
        started: Instant,
    ) -> Option<Response<Bytes>> {
        let Some(status) = entry.status_code() else {
            CacheMetrics::incr(&self.metrics.store_errors);
            log_error!(
                self.logger,
                "cached entry has invalid status request_id={request_id} cache_key={cache_key} status={}",
                entry.status
            );
            return None;
        };
        CacheMetrics::incr(&self.metrics.hits);

        let mut headers = HeaderMap::new();
        copy_headers(&entry.header_map(), &mut headers, forward_downstream);
        headers.insert(
            HeaderName::from_static(XCACHE),
            HeaderValue::from_static(HitOrMiss::HIT.as_str()),
        );
        if let Ok(cached_at) = HeaderValue::from_str(&entry.cached_at_rfc3339()) {
            headers.insert(HeaderName::from_static(XCACHETIME), cached_at);
        }

        log_info!(
            self.logger,
            "request served from cache request_id={request_id} cache_key={cache_key} status={} duration_ms={} body_size={} cached_at={}",
            status.as_u16(),
            started.elapsed().as_millis(),
            entry.body.len(),
            entry.cached_at_rfc3339()
        );
        Some(response(status, headers, Bytes::from(entry.body)))
    }

    async fn forward(
        &self,
        parts: &Parts,
        body: &Bytes,
        request_id: &str,
        cache_target: Option<(&str, Duration)>,
        started: Instant,
    ) -> Response<Bytes> {
        let cache_key = cache_target.map(|(key, _)| key).unwrap_or("-");
        let upstream = match self.upstream.send(parts, body, request_id).await {
            Ok(upstream) => upstream,
            Err(e) => {
                CacheMetrics::incr(&self.metrics.upstream_failures);
                log_error!(
                    self.logger,
                    "failed to forward request request_id={request_id} method={} path={} cache_key={cache_key} error={e}",
                    parts.method,
                    parts.uri.path()
                );
                return plain_text(
                    StatusCode::BAD_GATEWAY,
                    UPSTREAM_UNAVAILABLE,
                );
            }
        };

        let status = upstream.status();
        let mut headers = HeaderMap::new();
        copy_headers(upstream.headers(), &mut headers, forward_downstream);
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let e = UpstreamError::Body(e);
                log_error!(
                    self.logger,
                    "failed to read response body request_id={request_id} cache_key={cache_key} error={e}"
                );
                return plain_text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    UPSTREAM_READ_FAILED,
                );
            }
        };

        let mut cached = false;
        if let Some((cache_key, ttl)) = cache_target {
            if status.is_success() {
                let entry = CachedEntry::new(status, &headers, &body);
                match self
                    .with_store_timeout(self.store.set(cache_key, &entry, ttl))
                    .await
                {
                    Ok(()) => {
                        cached = true;
                        CacheMetrics::incr(&self.metrics.stores);
                        log_debug!(
                            self.logger,
                            "response cached request_id={request_id} cache_key={cache_key} ttl_s={} body_size={}",
                            ttl.as_secs(),
                            body.len()
                        );
                    }
                    Err(StoreError::Encode(e)) => {
                        log_error!(
                            self.logger,
                            "failed to encode cache entry request_id={request_id} cache_key={cache_key} error={e}"
                        );
                        return plain_text(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            INTERNAL_ERROR,
                        );
                    }
                    Err(e) => {
                        CacheMetrics::incr(&self.metrics.store_errors);
                        log_error!(
                            self.logger,
                            "failed to cache response request_id={request_id} cache_key={cache_key} error={e}"
                        );
                    }
                }
            } else {
                log_debug!(
                    self.logger,
                    "response not cached (non-2xx status) request_id={request_id} cache_key={cache_key} status={}",
                    status.as_u16()
                );
            }
            headers.insert(
                HeaderName::from_static(XCACHE),
                HeaderValue::from_static(HitOrMiss::MISS.as_str()),
            );
        }

        log_info!(
            self.logger,
            "request forwarded to upstream request_id={request_id} method={} path={} cache_key={cache_key} status={} duration_ms={} body_size={} cached={cached}",
            parts.method,
            parts.uri.path(),
            status.as_u16(),
            started.elapsed().as_millis(),
            body.len()
        );
        response(status, headers, body)
    }

    async fn with_store_timeout<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.options.store_timeout;
        if limit.is_zero() {
            return operation.await;
        }
        tokio::time::timeout(limit, operation)
            .await
            .unwrap_or(Err(StoreError::Timeout(limit)))
    }
}

fn response(
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn rate_limited() -> Response<Bytes> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response(
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        Bytes::from_static(RATE_LIMITED_BODY.as_bytes()),
    )
}

fn plain_text(status: StatusCode, message: &'static str) -> Response<Bytes> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response(status, headers, Bytes::from_static(message.as_bytes()))
}
