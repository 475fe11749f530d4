#![cfg(feature = "manager-moka")]

use api_cache::{ApiCache, Config, Logger, MokaManager};
use api_cache_tower::{health, metrics, ApiCacheService, HEALTH_BODY};
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt, Full};
use log::{Level, Log, Metadata, Record};
use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tower::ServiceExt;
use wiremock::{
    matchers::{body_string, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn service(base_url: &str) -> ApiCacheService<MokaManager> {
    ApiCacheService::new(engine(base_url))
}

fn engine(base_url: &str) -> ApiCache<MokaManager> {
    let config = Config::from_yaml_str(&format!(
        r#"
upstream:
  base_url: "{base_url}"
cache:
  endpoints:
    - path: /prices
      ttl: 10m
      cache_key_query_params: [symbol]
"#
    ))
    .unwrap();
    ApiCache::from_config(&config, MokaManager::default()).unwrap()
}

#[derive(Default)]
struct Capture(Mutex<Vec<(Level, String)>>);

impl Log for Capture {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.0
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

async fn body_bytes<B>(body: B) -> Bytes
where
    B: http_body::Body,
    B::Error: std::fmt::Debug,
{
    body.collect().await.unwrap().to_bytes()
}

// Body that fails on first poll
struct BrokenBody;

impl http_body::Body for BrokenBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(Some(Err(std::io::Error::other("client went away"))))
    }
}

#[tokio::test]
async fn test_cache_hit_and_miss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_string("42.0"))
        .expect(1)
        .mount(&server)
        .await;

    let svc = service(&server.uri());

    let req = Request::get("/prices?symbol=IBM")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = svc.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(body_bytes(res.into_body()).await, Bytes::from("42.0"));

    let req = Request::get("/prices?symbol=IBM&nonce=7")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = svc.clone().oneshot(req).await.unwrap();
    assert_eq!(res.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(body_bytes(res.into_body()).await, Bytes::from("42.0"));

    let snapshot = svc.cache().metrics().snapshot();
    assert_eq!((snapshot.hits, snapshot.misses), (1, 1));
}

#[tokio::test]
async fn test_different_key_params_miss_separately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_string("p"))
        .expect(2)
        .mount(&server)
        .await;

    let svc = service(&server.uri());
    for symbol in ["IBM", "MSFT"] {
        let req = Request::get(format!("/prices?symbol={symbol}"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = svc.clone().oneshot(req).await.unwrap();
        assert_eq!(res.headers().get("x-cache").unwrap(), "MISS");
    }
}

#[tokio::test]
async fn test_request_body_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/orders/1"))
        .and(body_string("{\"qty\":5}"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let svc = service(&server.uri());
    let req = Request::put("/orders/1")
        .body(Full::new(Bytes::from_static(b"{\"qty\":5}")))
        .unwrap();
    let res = svc.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(res.headers().get("x-cache").is_none());
}

#[tokio::test]
async fn test_unreadable_request_body_is_bad_request() {
    let server = MockServer::start().await;
    let capture = Arc::new(Capture::default());
    let svc = ApiCacheService::new(
        engine(&server.uri()).with_logger(Logger::new(capture.clone())),
    );

    let req = Request::post("/orders").body(BrokenBody).unwrap();
    let res = svc.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(server.received_requests().await.unwrap().is_empty());
    let records = capture.0.lock().unwrap();
    assert!(records.iter().any(|(level, msg)| *level == Level::Warn
        && msg.starts_with("failed to read request body method=POST path=/orders")));
}

#[tokio::test]
async fn test_health_and_metrics_responses() {
    let res = health();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_bytes(res.into_body()).await, Bytes::from(HEALTH_BODY));

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let svc = service(&server.uri());
    let req = Request::get("/prices?symbol=IBM")
        .body(Full::new(Bytes::new()))
        .unwrap();
    svc.clone().oneshot(req).await.unwrap();

    let res = metrics(svc.cache().metrics());
    let json: serde_json::Value =
        serde_json::from_slice(&body_bytes(res.into_body()).await).unwrap();
    assert_eq!(json["misses"], 1);
    assert_eq!(json["stores"], 1);
    assert_eq!(json["hits"], 0);
}
