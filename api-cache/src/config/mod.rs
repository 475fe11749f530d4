//! Declarative YAML configuration, loaded once at startup.

pub(crate) mod duration;

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::Deserialize;
use url::{form_urlencoded, Url};

use crate::error::ConfigError;

const REDACTED: &str = "[REDACTED]";

/// Complete process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Key-value store connection
    #[serde(alias = "valkey")]
    pub store: StoreConfig,
    /// Cache rules and TTL defaults
    pub cache: CacheConfig,
    /// Rate limiting
    pub rate_limit: RateLimitConfig,
    /// Upstream retry policy
    pub retry: RetryConfig,
    /// Upstream service
    pub upstream: UpstreamConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind
    pub port: u16,
    /// Maximum time to read a request
    #[serde(deserialize_with = "duration::deserialize")]
    pub read_timeout: Duration,
    /// Maximum time to write a response
    #[serde(deserialize_with = "duration::deserialize")]
    pub write_timeout: Duration,
    /// Keep-alive idle time
    #[serde(deserialize_with = "duration::deserialize")]
    pub idle_timeout: Duration,
    /// How long in-flight requests get to finish after a shutdown signal
    #[serde(deserialize_with = "duration::deserialize")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// `host:port` for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which [`crate::CacheManager`] backs the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis or Valkey
    #[default]
    Redis,
    /// In-process moka cache
    Memory,
}

/// Key-value store connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection
    pub backend: StoreBackend,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Password, empty for none
    pub password: String,
    /// Logical database index
    pub db: u32,
    /// Upper bound on every get and set issued while serving a request
    #[serde(deserialize_with = "duration::deserialize")]
    pub operation_timeout: Duration,
    /// Entry limit for the memory backend
    pub max_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            host: "localhost".into(),
            port: 6379,
            password: String::new(),
            db: 0,
            operation_timeout: Duration::from_secs(2),
            max_capacity: 10_000,
        }
    }
}

impl StoreConfig {
    /// Connection URL in the form accepted by the `redis` crate.
    pub fn redis_url(&self) -> String {
        let auth = if self.password.is_empty() {
            String::new()
        } else {
            format!(":{}@", self.password)
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Cache TTLs and endpoint rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when no rule matches or a rule has no positive TTL
    #[serde(deserialize_with = "duration::deserialize")]
    pub default_ttl: Duration,
    /// Endpoint rules in precedence order
    pub endpoints: Vec<EndpointCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            endpoints: Vec::new(),
        }
    }
}

fn default_methods() -> Vec<String> {
    vec!["GET".into()]
}

/// One endpoint cache rule as written in the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointCacheConfig {
    /// Exact path
    #[serde(default)]
    pub path: Option<String>,
    /// Path pattern
    #[serde(default)]
    pub path_regex: Option<String>,
    /// Methods the rule applies to
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// Entry lifetime, zero to use the default
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
    /// Query parameters that take part in the cache key
    #[serde(default)]
    pub cache_key_query_params: Vec<String>,
    /// Headers that take part in the cache key
    #[serde(default)]
    pub cache_key_headers: Vec<String>,
    /// Parameter name to the literal values the rule accepts
    #[serde(default)]
    pub match_query_params: BTreeMap<String, Vec<String>>,
    /// Parameter name to the patterns the rule accepts
    #[serde(default)]
    pub match_query_params_regex: BTreeMap<String, Vec<String>>,
}

/// Global rate limiting and per-endpoint overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether admission control runs at all
    pub enabled: bool,
    /// Refill rate for paths without a rule
    pub requests_per_second: f64,
    /// Bucket size for paths without a rule
    pub burst: u32,
    /// Endpoint overrides in precedence order
    pub endpoints: Vec<EndpointRateLimitConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 100.0,
            burst: 200,
            endpoints: Vec::new(),
        }
    }
}

/// One endpoint rate limit rule as written in the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointRateLimitConfig {
    /// Exact path
    #[serde(default)]
    pub path: Option<String>,
    /// Path pattern
    #[serde(default)]
    pub path_regex: Option<String>,
    /// Refill rate
    pub requests_per_second: f64,
    /// Bucket size
    pub burst: u32,
}

/// Upstream retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// When false exactly one attempt is made
    pub enabled: bool,
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Sleep before the first retry
    #[serde(deserialize_with = "duration::deserialize")]
    pub initial_backoff: Duration,
    /// Cap on any single sleep
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_backoff: Duration,
    /// Growth factor applied after every retry
    pub backoff_multiplier: f64,
    /// Upstream statuses treated like transport failures
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            retryable_status_codes: vec![502, 503, 504],
        }
    }
}

/// The upstream service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Scheme and authority every request is rewritten to
    pub base_url: String,
    /// Per-attempt timeout, zero for none
    #[serde(deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    /// Idle pooled connections kept per upstream host
    pub max_idle_conns_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            max_idle_conns_per_host: 100,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output
    #[default]
    Stdout,
    /// Standard error
    Stderr,
    /// Append to `file_path`
    File,
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level, as understood by `log::LevelFilter`
    pub level: String,
    /// Line format
    pub format: LogFormat,
    /// Destination
    pub output: LogOutput,
    /// File used when `output` is `file`
    pub file_path: Option<String>,
    /// Query parameters whose values never appear in logs
    pub redact_query_params: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
            output: LogOutput::Stdout,
            file_path: None,
            redact_query_params: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Replaces the values of configured parameters with `[REDACTED]`.
    ///
    /// Parameter order is preserved. With nothing configured the query is
    /// returned as given.
    pub fn redact_query(&self, raw_query: &str) -> String {
        redact_query(&self.redact_query_params, raw_query)
    }
}

pub(crate) fn redact_query(params: &[String], raw_query: &str) -> String {
    if params.is_empty() || raw_query.is_empty() {
        return raw_query.to_string();
    }
    let mut out = form_urlencoded::Serializer::new(String::new());
    for (name, value) in form_urlencoded::parse(raw_query.as_bytes()) {
        if params.iter().any(|p| *p == name) {
            out.append_pair(&name, REDACTED);
        } else {
            out.append_pair(&name, &value);
        }
    }
    out.finish()
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read { path: path.to_path_buf(), source }
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates configuration text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value the engine relies on.
    ///
    /// Pattern compilation is left to [`crate::RuleTable::from_config`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(invalid(format!(
                "invalid server port: {}",
                self.server.port
            )));
        }
        if self.store.port == 0 {
            return Err(invalid(format!(
                "invalid store port: {}",
                self.store.port
            )));
        }
        if self.upstream.base_url.is_empty() {
            return Err(invalid("upstream base_url is required".into()));
        }
        match Url::parse(&self.upstream.base_url) {
            Ok(url)
                if matches!(url.scheme(), "http" | "https")
                    && url.has_host() => {}
            _ => {
                return Err(invalid(format!(
                    "upstream base_url {:?} is not an absolute http(s) URL",
                    self.upstream.base_url
                )))
            }
        }
        if self.retry.enabled {
            if self.retry.max_attempts < 1 {
                return Err(invalid("retry max_attempts must be >= 1".into()));
            }
            if self.retry.backoff_multiplier.is_nan()
                || self.retry.backoff_multiplier < 1.0
            {
                return Err(invalid(
                    "retry backoff_multiplier must be >= 1.0".into(),
                ));
            }
        }
        if self.rate_limit.enabled {
            check_rate(
                "rate_limit",
                self.rate_limit.requests_per_second,
                self.rate_limit.burst,
            )?;
        }
        for (i, ep) in self.rate_limit.endpoints.iter().enumerate() {
            let scope = format!("rate_limit.endpoints[{i}]");
            check_has_path(&scope, &ep.path, &ep.path_regex)?;
            check_rate(&scope, ep.requests_per_second, ep.burst)?;
        }
        for (i, ep) in self.cache.endpoints.iter().enumerate() {
            let scope = format!("cache.endpoints[{i}]");
            check_has_path(&scope, &ep.path, &ep.path_regex)?;
            if ep.methods.is_empty() {
                return Err(invalid(format!("{scope}: methods is empty")));
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

fn check_rate(scope: &str, rate: f64, burst: u32) -> Result<(), ConfigError> {
    if !(rate > 0.0 && rate.is_finite()) {
        return Err(invalid(format!(
            "{scope}: requests_per_second must be > 0, got {rate}"
        )));
    }
    if burst < 1 {
        return Err(invalid(format!("{scope}: burst must be >= 1")));
    }
    Ok(())
}

fn check_has_path(
    scope: &str,
    path: &Option<String>,
    path_regex: &Option<String>,
) -> Result<(), ConfigError> {
    let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
    if present(path) || present(path_regex) {
        Ok(())
    } else {
        Err(invalid(format!("{scope}: one of path or path_regex is required")))
    }
}
