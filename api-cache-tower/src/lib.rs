//! Tower integration for the [`api_cache`] forwarding engine.
//!
//! [`ApiCacheService`] is a terminal [`tower::Service`]: it buffers the
//! request body, hands the request to [`ApiCache::handle`] and returns the
//! engine's response. It never fails, so it can be mounted directly as an
//! axum fallback service.
//!
//! ```rust
//! # #[cfg(feature = "manager-moka")]
//! # {
//! use api_cache::{ApiCache, Config, MokaManager};
//! use api_cache_tower::ApiCacheService;
//!
//! let config = Config::from_yaml_str(
//!     "upstream:\n  base_url: \"https://api.example.com\"\n",
//! )
//! .unwrap();
//! let cache = ApiCache::from_config(&config, MokaManager::default()).unwrap();
//! let service = ApiCacheService::new(cache);
//! # let _ = service;
//! # }
//! ```
//!
//! [`health`] and [`metrics`] build the responses for the two fixed
//! operational endpoints.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::{
    convert::Infallible,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use api_cache::{ApiCache, BoxError, CacheManager, CacheMetrics, DigestKeyer, Keyer};
use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderValue, Request, Response, StatusCode};
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Full};
use tower::Service;

/// Body of every `GET /health` response.
pub const HEALTH_BODY: &str = r#"{"status":"healthy","service":"api-cache"}"#;

/// Tower service that serves requests through an [`ApiCache`].
pub struct ApiCacheService<M, K = DigestKeyer>
where
    M: CacheManager,
    K: Keyer,
{
    cache: ApiCache<M, K>,
}

impl<M: CacheManager, K: Keyer> Clone for ApiCacheService<M, K> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone() }
    }
}

impl<M: CacheManager, K: Keyer> fmt::Debug for ApiCacheService<M, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ApiCacheService").field("cache", &self.cache).finish()
    }
}

impl<M: CacheManager, K: Keyer> ApiCacheService<M, K> {
    /// Wrap an engine.
    pub fn new(cache: ApiCache<M, K>) -> Self {
        Self { cache }
    }

    /// The wrapped engine.
    pub fn cache(&self) -> &ApiCache<M, K> {
        &self.cache
    }
}

impl<M, K, ReqBody> Service<Request<ReqBody>> for ApiCacheService<M, K>
where
    M: CacheManager,
    K: Keyer,
    ReqBody: HttpBody + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
{
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<
        Box<
            dyn Future<Output = Result<Self::Response, Self::Error>> + Send,
        >,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let cache = self.cache.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    let e: BoxError = e.into();
                    cache.logger().log(
                        log::Level::Warn,
                        format_args!(
                            "failed to read request body method={} path={} error={e}",
                            parts.method,
                            parts.uri.path()
                        ),
                    );
                    return Ok(text(
                        StatusCode::BAD_REQUEST,
                        "failed to read request body",
                    ));
                }
            };
            let response = cache.handle(Request::from_parts(parts, body)).await;
            Ok(response.map(Full::new))
        })
    }
}

/// The fixed liveness response.
pub fn health() -> Response<Full<Bytes>> {
    json(StatusCode::OK, Bytes::from_static(HEALTH_BODY.as_bytes()))
}

/// A JSON snapshot of the engine counters.
pub fn metrics(metrics: &CacheMetrics) -> Response<Full<Bytes>> {
    match serde_json::to_vec(&metrics.snapshot()) {
        Ok(body) => json(StatusCode::OK, Bytes::from(body)),
        Err(_) => text(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"),
    }
}

fn json(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
