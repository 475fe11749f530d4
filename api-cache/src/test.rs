use crate::{
    error::ConfigError, CachedEntry, Config, DigestKeyer, HitOrMiss, Keyer,
    Logger, MatchKind, QueryParams, RateLimitDefaults, RateLimiterRegistry,
    RetryPolicy, RetryState, RuleTable, StoreBackend, KEY_PREFIX,
};
use http::{
    header::CONTENT_TYPE, request::Parts, HeaderMap, HeaderValue, Method,
    Request, StatusCode,
};
use log::{Level, Log, Metadata, Record};

use std::{
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

const BASE: &str = "upstream:\n  base_url: \"https://upstream.example.com\"\n";

fn config(extra: &str) -> Config {
    Config::from_yaml_str(&format!("{BASE}{extra}")).unwrap()
}

fn table(extra: &str) -> RuleTable {
    RuleTable::from_config(&config(extra)).unwrap()
}

fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
    let mut builder = Request::get(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap().into_parts().0
}

fn ttl_for(table: &RuleTable, uri: &str) -> Option<Duration> {
    let parts = parts(uri, &[]);
    let query = QueryParams::from_uri(&parts.uri);
    table
        .resolve_cache(parts.uri.path(), &Method::GET, &query)
        .rule
        .map(|rule| rule.ttl)
}

#[derive(Default)]
struct Capture(Mutex<Vec<(Level, String)>>);

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.0.lock().unwrap().push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

const QUERY_RULES: &str = r#"
cache:
  endpoints:
    - path: /query
      ttl: 1h
      cache_key_query_params: [function, symbol]
    - path: /query
      ttl: 24h
      cache_key_query_params: [function, symbol]
      match_query_params:
        function: [EOD, WEEKLY, MONTHLY]
    - path: /query
      ttl: 5m
      cache_key_query_params: [function, symbol, interval]
      match_query_params:
        function: [INTRADAY]
"#;

#[test]
fn hit_miss() {
    let hit = HitOrMiss::HIT;
    assert_eq!(format!("{hit:?}"), "HIT");
    assert_eq!(hit.to_string(), "HIT");
    assert_eq!(HitOrMiss::MISS.as_str(), "MISS");
}

#[test]
fn discriminated_rules_outrank_earlier_fallback() {
    let table = table(QUERY_RULES);
    let hour = Duration::from_secs(3600);

    assert_eq!(
        ttl_for(&table, "/query?function=EOD&symbol=IBM"),
        Some(hour * 24)
    );
    assert_eq!(
        ttl_for(&table, "/query?function=INTRADAY&symbol=IBM"),
        Some(Duration::from_secs(300))
    );
    assert_eq!(ttl_for(&table, "/query?function=UNKNOWN"), Some(hour));
    assert_eq!(ttl_for(&table, "/query?symbol=IBM"), Some(hour));
    assert_eq!(ttl_for(&table, "/query?function="), Some(hour));
    assert_eq!(ttl_for(&RuleTable::default(), "/query?function=EOD"), None);
}

#[test]
fn match_kinds_report_provenance() {
    let table = table(QUERY_RULES);
    let resolve = |uri: &str| {
        let parts = parts(uri, &[]);
        let query = QueryParams::from_uri(&parts.uri);
        table.resolve_cache(parts.uri.path(), &Method::GET, &query).kind
    };
    assert_eq!(resolve("/query?function=EOD"), MatchKind::QueryDiscriminated);
    assert_eq!(resolve("/query?function=X"), MatchKind::FallbackExact);
    assert_eq!(resolve("/other"), MatchKind::Default);
    assert_eq!(MatchKind::FallbackPattern.to_string(), "fallback_regex");
}

#[test]
fn only_first_query_value_counts() {
    let table = table(QUERY_RULES);
    assert_eq!(
        ttl_for(&table, "/query?function=EOD&function=INTRADAY"),
        Some(Duration::from_secs(86_400))
    );
    assert_eq!(
        ttl_for(&table, "/query?function=INTRADAY&function=EOD"),
        Some(Duration::from_secs(300))
    );
}

#[test]
fn first_fallback_in_configured_order_wins() {
    let exact_first = table(
        "cache:\n  endpoints:\n    - path: /api/users\n      ttl: 2m\n    - path_regex: \"^/api/.*\"\n      ttl: 10m\n",
    );
    assert_eq!(
        ttl_for(&exact_first, "/api/users"),
        Some(Duration::from_secs(120))
    );
    assert_eq!(
        ttl_for(&exact_first, "/api/orders"),
        Some(Duration::from_secs(600))
    );

    let pattern_first = table(
        "cache:\n  endpoints:\n    - path_regex: \"^/api/.*\"\n      ttl: 10m\n    - path: /api/users\n      ttl: 2m\n",
    );
    assert_eq!(
        ttl_for(&pattern_first, "/api/users"),
        Some(Duration::from_secs(600))
    );
    let query = QueryParams::default();
    assert_eq!(
        pattern_first.resolve_cache("/api/users", &Method::GET, &query).kind,
        MatchKind::Pattern
    );
}

#[test]
fn pattern_query_constraints() {
    let table = table(
        r#"
cache:
  endpoints:
    - path_regex: "^/series/[a-z]+$"
      ttl: 30s
      match_query_params_regex:
        range: ["^[0-9]+d$", "^max$"]
    - path_regex: "^/series/[a-z]+$"
      ttl: 10s
"#,
    );
    assert_eq!(ttl_for(&table, "/series/abc?range=7d"), Some(Duration::from_secs(30)));
    assert_eq!(ttl_for(&table, "/series/abc?range=max"), Some(Duration::from_secs(30)));
    assert_eq!(ttl_for(&table, "/series/abc?range=7w"), Some(Duration::from_secs(10)));
    assert_eq!(ttl_for(&table, "/series/ABC?range=7d"), None);
}

#[test]
fn methods_filter_rules() {
    let table = table(
        "cache:\n  endpoints:\n    - path: /items\n      ttl: 1m\n    - path: /search\n      methods: [post]\n      ttl: 2m\n",
    );
    let empty = QueryParams::default();
    assert!(table.resolve_cache("/items", &Method::GET, &empty).rule.is_some());
    assert!(table.resolve_cache("/items", &Method::POST, &empty).rule.is_none());
    let search = table.resolve_cache("/search", &Method::POST, &empty);
    assert_eq!(search.rule.map(|r| r.ttl), Some(Duration::from_secs(120)));
    assert!(table.resolve_cache("/search", &Method::GET, &empty).rule.is_none());
}

#[test]
fn rate_limit_resolution_prefers_exact() {
    let table = table(
        r#"
rate_limit:
  endpoints:
    - path_regex: "^/api/"
      requests_per_second: 5
      burst: 10
    - path: /api/hot
      requests_per_second: 1
      burst: 2
"#,
    );
    assert_eq!(table.resolve_rate_limit("/api/hot").map(|r| r.burst), Some(2));
    assert_eq!(table.resolve_rate_limit("/api/cold").map(|r| r.burst), Some(10));
    assert!(table.resolve_rate_limit("/health").is_none());
}

#[test]
fn invalid_patterns_fail_fast() {
    let bad_path = config(
        "cache:\n  endpoints:\n    - path_regex: \"([unclosed\"\n      ttl: 1m\n",
    );
    let err = RuleTable::from_config(&bad_path).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    assert!(err.to_string().contains("cache.endpoints[0].path_regex"));

    let bad_query = config(
        "cache:\n  endpoints:\n    - path: /q\n      match_query_params_regex:\n        f: [\"(\"]\n",
    );
    assert!(matches!(
        RuleTable::from_config(&bad_query),
        Err(ConfigError::InvalidPattern { .. })
    ));
}

#[test]
fn key_is_deterministic_and_matches_known_digest() {
    let table = table(QUERY_RULES);
    let parts = parts("/query?symbol=IBM&function=EOD&page=3", &[]);
    let query = QueryParams::from_uri(&parts.uri);
    let rule = table.resolve_cache("/query", &Method::GET, &query).rule;

    let key = DigestKeyer.cache_key(&parts, &query, rule);
    assert_eq!(
        key,
        "cache:233bec5f49c3a6195d020dfd84b15aa028f417cc6b226e64e3d06219ae1837e6"
    );
    assert_eq!(key, DigestKeyer.cache_key(&parts, &query, rule));
    assert!(key.starts_with(KEY_PREFIX));
    assert_eq!(key.len(), KEY_PREFIX.len() + 64);
}

#[test]
fn key_ignores_unconfigured_inputs() {
    let table = table(
        "cache:\n  endpoints:\n    - path: /quote\n      cache_key_query_params: [symbol]\n      cache_key_headers: [x-tenant]\n",
    );
    let key = |uri: &str, headers: &[(&str, &str)]| {
        let parts = parts(uri, headers);
        let query = QueryParams::from_uri(&parts.uri);
        let rule = table.resolve_cache("/quote", &Method::GET, &query).rule;
        DigestKeyer.cache_key(&parts, &query, rule)
    };

    let base = key("/quote?symbol=IBM", &[("x-tenant", "a")]);
    assert_eq!(
        base,
        key("/quote?page=2&symbol=IBM&ts=1", &[("x-tenant", "a"), ("x-trace", "z")])
    );
    assert_ne!(base, key("/quote?symbol=MSFT", &[("x-tenant", "a")]));
    assert_ne!(base, key("/quote?symbol=IBM", &[("x-tenant", "b")]));
    assert_ne!(base, key("/quote?symbol=IBM", &[]));
    assert_eq!(key("/quote?symbol=", &[]), key("/quote", &[]));
}

#[test]
fn key_depends_on_method_and_path() {
    let query = QueryParams::default();
    let get = parts("/a", &[]);
    let mut post = parts("/a", &[]);
    post.method = Method::POST;
    let other = parts("/b", &[]);
    let keys = [
        DigestKeyer.cache_key(&get, &query, None),
        DigestKeyer.cache_key(&post, &query, None),
        DigestKeyer.cache_key(&other, &query, None),
    ];
    assert_ne!(keys[0], keys[1]);
    assert_ne!(keys[0], keys[2]);
}

#[test]
fn config_defaults() {
    let config = config("");
    assert_eq!(config.server.bind_address(), "0.0.0.0:8080");
    assert_eq!(config.store.backend, StoreBackend::Redis);
    assert_eq!(config.store.redis_url(), "redis://localhost:6379/0");
    assert_eq!(config.store.operation_timeout, Duration::from_secs(2));
    assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
    assert!(!config.rate_limit.enabled);
    assert!(config.retry.enabled);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.retryable_status_codes, vec![502, 503, 504]);
    assert_eq!(config.upstream.timeout, Duration::from_secs(30));
    assert_eq!(config.logging.level, "info");
}

#[test]
fn config_reads_full_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
server:
  port: 9090
  shutdown_timeout: 10s
valkey:
  backend: memory
  host: cache.internal
  password: hunter2
  db: 2
  operation_timeout: 500ms
cache:
  default_ttl: 1h30m
  endpoints:
    - path: /query
      ttl: 24h
rate_limit:
  enabled: true
  requests_per_second: 2.5
  burst: 5
retry:
  initial_backoff: 50ms
  backoff_multiplier: 1.5
upstream:
  base_url: "http://localhost:3000/"
  timeout: 5
logging:
  format: json
  output: stderr
  redact_query_params: [apikey]
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.server.shutdown_timeout, Duration::from_secs(10));
    assert_eq!(config.store.backend, StoreBackend::Memory);
    assert_eq!(config.store.redis_url(), "redis://:hunter2@cache.internal:6379/2");
    assert_eq!(config.store.operation_timeout, Duration::from_millis(500));
    assert_eq!(config.cache.default_ttl, Duration::from_secs(5400));
    assert_eq!(config.cache.endpoints[0].methods, vec!["GET".to_string()]);
    assert_eq!(config.rate_limit.burst, 5);
    assert_eq!(config.retry.initial_backoff, Duration::from_millis(50));
    assert_eq!(config.upstream.timeout, Duration::from_secs(5));
    assert_eq!(config.logging.format, crate::LogFormat::Json);
    assert_eq!(config.logging.output, crate::LogOutput::Stderr);
}

#[test]
fn sample_config_compiles() {
    let config = Config::from_yaml_str(include_str!(
        "../../api-cache-server/config.example.yaml"
    ))
    .unwrap();
    let table = RuleTable::from_config(&config).unwrap();
    assert_eq!(table.cache_rules().len(), 4);
    assert_eq!(
        ttl_for(&table, "/query?function=TIME_SERIES_INTRADAY_EXTENDED&symbol=IBM"),
        Some(Duration::from_secs(60))
    );
    assert_eq!(
        ttl_for(&table, "/query?function=EOD&symbol=IBM"),
        Some(Duration::from_secs(86_400))
    );
    assert_eq!(
        ttl_for(&table, "/v1/users/42"),
        Some(Duration::from_secs(600))
    );
}

#[test]
fn config_validation() {
    let reject = |yaml: &str| {
        matches!(Config::from_yaml_str(yaml), Err(ConfigError::Invalid(_)))
    };
    assert!(reject("server:\n  port: 8080\n"));
    assert!(reject("upstream:\n  base_url: \"not a url\"\n"));
    assert!(reject("upstream:\n  base_url: \"ftp://host\"\n"));
    assert!(reject(&format!("{BASE}server:\n  port: 0\n")));
    assert!(reject(&format!("{BASE}retry:\n  max_attempts: 0\n")));
    assert!(reject(&format!("{BASE}retry:\n  backoff_multiplier: 0.5\n")));
    assert!(reject(&format!(
        "{BASE}rate_limit:\n  enabled: true\n  requests_per_second: 0\n"
    )));
    assert!(reject(&format!("{BASE}cache:\n  endpoints:\n    - ttl: 1m\n")));
    assert!(!reject(&format!(
        "{BASE}retry:\n  enabled: false\n  max_attempts: 0\n"
    )));

    assert!(matches!(
        Config::from_yaml_str(&format!("{BASE}cache:\n  default_ttl: soon\n")),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        Config::load("/nonexistent/config.yaml"),
        Err(ConfigError::Read { .. })
    ));
}

#[test]
fn redact_query_preserves_order() {
    let mut logging = config("").logging;
    assert_eq!(logging.redact_query("apikey=secret&symbol=IBM"), "apikey=secret&symbol=IBM");

    logging.redact_query_params = vec!["apikey".into(), "token".into()];
    assert_eq!(
        logging.redact_query("symbol=IBM&apikey=secret&function=EOD"),
        "symbol=IBM&apikey=%5BREDACTED%5D&function=EOD"
    );
    assert_eq!(logging.redact_query(""), "");
    assert_eq!(logging.redact_query("symbol=IBM"), "symbol=IBM");
}

#[test]
fn retry_backoff_grows_and_caps() {
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(300),
        multiplier: 2.0,
        ..RetryPolicy::default()
    };
    let mut state = RetryState::new(&policy);
    let sleeps: Vec<_> = (0..4).map(|_| state.next_backoff(&policy)).collect();
    assert_eq!(
        sleeps,
        [100, 200, 300, 300].map(Duration::from_millis).to_vec()
    );
}

#[test]
fn retry_budget() {
    let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
    let mut state = RetryState::new(&policy);
    assert_eq!(state.begin_attempt(), 1);
    assert!(state.can_retry(&policy));
    state.begin_attempt();
    assert!(state.can_retry(&policy));
    state.begin_attempt();
    assert!(!state.can_retry(&policy));

    let disabled = RetryPolicy::disabled();
    assert_eq!(disabled.attempts(), 1);
    assert!(policy.is_retryable(StatusCode::SERVICE_UNAVAILABLE));
    assert!(!policy.is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
}

#[test]
fn limiter_admits_exactly_burst() {
    let registry = RateLimiterRegistry::new(RateLimitDefaults {
        requests_per_second: 0.001,
        burst: 5,
    });
    for _ in 0..5 {
        assert!(registry.allow("/a", None));
    }
    assert!(!registry.allow("/a", None));
    // separate path, separate bucket
    assert!(registry.allow("/b", None));
    assert_eq!(registry.len(), 2);
}

#[test]
fn limiter_uses_rule_values() {
    let table = table(
        "rate_limit:\n  endpoints:\n    - path: /tight\n      requests_per_second: 0.001\n      burst: 2\n",
    );
    let registry = RateLimiterRegistry::new(RateLimitDefaults {
        requests_per_second: 0.001,
        burst: 50,
    });
    let rule = table.resolve_rate_limit("/tight");
    assert!(registry.allow("/tight", rule));
    assert!(registry.allow("/tight", rule));
    assert!(!registry.allow("/tight", rule));
    for _ in 0..50 {
        assert!(registry.allow("/loose", None));
    }
    assert!(!registry.allow("/loose", None));
}

#[test]
fn limiter_created_once_under_contention() {
    let registry = Arc::new(RateLimiterRegistry::new(RateLimitDefaults {
        requests_per_second: 1.0,
        burst: 1_000,
    }));
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.limiter("/shared", None))
        })
        .collect();
    let limiters: Vec<_> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(limiters.iter().all(|l| Arc::ptr_eq(l, &limiters[0])));
    assert_eq!(registry.len(), 1);
}

#[test]
fn cached_entry_round_trip() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.append("set-cookie", HeaderValue::from_static("a=1"));
    headers.append("set-cookie", HeaderValue::from_static("b=2"));
    let body = b"{\"price\":1}\x00\xff";
    let entry = CachedEntry::new(StatusCode::CREATED, &headers, body);

    let decoded = CachedEntry::from_slice(&entry.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, entry);
    assert_eq!(decoded.status_code(), Some(StatusCode::CREATED));
    assert_eq!(decoded.body, body.to_vec());
    assert_eq!(decoded.header_map(), headers);
    assert!(decoded.cached_at_rfc3339().ends_with('Z'));
    assert!(CachedEntry::from_slice(b"{}").is_err());
}

#[test]
fn cached_entry_keeps_opaque_header_bytes() {
    let mut headers = HeaderMap::new();
    headers.insert("x-name", HeaderValue::from_bytes(b"caf\xe9").unwrap());
    let entry = CachedEntry::new(StatusCode::OK, &headers, b"ok");

    let decoded = CachedEntry::from_slice(&entry.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded.header_map(), headers);
    assert_eq!(decoded.header_map()["x-name"].as_bytes(), b"caf\xe9");
}

#[test]
fn cached_entry_encoding_is_compact() {
    let body = vec![0xAB; 10_000];
    let entry = CachedEntry::new(StatusCode::OK, &HeaderMap::new(), &body);
    let encoded = entry.to_bytes().unwrap();
    assert!(encoded.len() < body.len() + 64, "encoded {} bytes", encoded.len());
}

#[test]
fn injected_logger_captures_records() {
    let capture = Arc::new(Capture::default());
    let logger = Logger::new(capture.clone());
    log_warn!(logger, "something happened key={}", 42);
    log_debug!(logger, "details");

    let records = capture.0.lock().unwrap();
    assert_eq!(records[0], (Level::Warn, "something happened key=42".into()));
    assert_eq!(records[1].0, Level::Debug);
    assert_eq!(format!("{:?}", Logger::global()), "Logger { global: true }");
}
