//! The immutable endpoint rule table, compiled once from configuration.

use std::{collections::BTreeMap, time::Duration};

use http::Method;
use regex::Regex;

use crate::{
    config::{Config, EndpointCacheConfig, EndpointRateLimitConfig},
    error::ConfigError,
    resolver::QueryParams,
};

/// How a rule's path matched a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    /// Exact string equality
    Exact,
    /// The compiled path pattern matched
    Pattern,
}

/// One caching policy.
#[derive(Debug, Clone)]
pub struct CacheRule {
    /// Exact path
    pub path: Option<String>,
    /// Compiled path pattern
    pub pattern: Option<Regex>,
    /// Methods the rule applies to
    pub methods: Vec<Method>,
    /// Entry lifetime, zero to defer to the process default
    pub ttl: Duration,
    /// Query parameters contributing to the cache key, in configured order
    pub key_query_params: Vec<String>,
    /// Headers contributing to the cache key, in configured order
    pub key_headers: Vec<String>,
    /// Parameter name to accepted literal values
    pub allowed_query_values: BTreeMap<String, Vec<String>>,
    /// Parameter name to accepted value patterns
    pub query_patterns: BTreeMap<String, Vec<Regex>>,
}

impl CacheRule {
    /// Compiles one configured endpoint.
    pub fn from_config(
        index: usize,
        config: &EndpointCacheConfig,
    ) -> Result<Self, ConfigError> {
        let scope = format!("cache.endpoints[{index}]");
        let pattern = compile_path(&scope, config.path_regex.as_deref())?;

        let mut methods = Vec::with_capacity(config.methods.len());
        for method in &config.methods {
            let parsed = Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| {
                    ConfigError::Invalid(format!(
                        "{scope}: invalid method {method:?}"
                    ))
                })?;
            methods.push(parsed);
        }

        let mut query_patterns = BTreeMap::new();
        for (param, patterns) in &config.match_query_params_regex {
            let compiled = patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                        scope: format!(
                            "{scope}.match_query_params_regex.{param}"
                        ),
                        pattern: p.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            query_patterns.insert(param.clone(), compiled);
        }

        Ok(Self {
            path: non_empty(&config.path),
            pattern,
            methods,
            ttl: config.ttl,
            key_query_params: config.cache_key_query_params.clone(),
            key_headers: config.cache_key_headers.clone(),
            allowed_query_values: config.match_query_params.clone(),
            query_patterns,
        })
    }

    /// True when the rule only applies for particular query values.
    pub fn is_discriminating(&self) -> bool {
        !self.allowed_query_values.is_empty() || !self.query_patterns.is_empty()
    }

    /// Whether the rule applies to `method`.
    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Matches `path`, trying exact equality before the pattern.
    pub fn match_path(&self, path: &str) -> Option<PathMatch> {
        match_path(self.path.as_deref(), self.pattern.as_ref(), path)
    }

    /// True when every query constraint holds for `query`.
    ///
    /// Only the first value of a parameter is consulted; an absent or empty
    /// value fails any constraint naming it.
    pub fn query_constraints_hold(&self, query: &QueryParams) -> bool {
        let literals_hold =
            self.allowed_query_values.iter().all(|(param, allowed)| {
                query.first(param).is_some_and(|value| {
                    allowed.iter().any(|candidate| candidate == value)
                })
            });
        literals_hold
            && self.query_patterns.iter().all(|(param, patterns)| {
                query.first(param).is_some_and(|value| {
                    patterns.iter().any(|re| re.is_match(value))
                })
            })
    }

    /// Path or pattern text used to name the rule in logs.
    pub fn identifier(&self) -> &str {
        self.path
            .as_deref()
            .or_else(|| self.pattern.as_ref().map(Regex::as_str))
            .unwrap_or("")
    }
}

/// One rate limiting policy.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    /// Exact path
    pub path: Option<String>,
    /// Compiled path pattern
    pub pattern: Option<Regex>,
    /// Token refill rate
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl RateLimitRule {
    /// Compiles one configured endpoint.
    pub fn from_config(
        index: usize,
        config: &EndpointRateLimitConfig,
    ) -> Result<Self, ConfigError> {
        let scope = format!("rate_limit.endpoints[{index}]");
        Ok(Self {
            path: non_empty(&config.path),
            pattern: compile_path(&scope, config.path_regex.as_deref())?,
            requests_per_second: config.requests_per_second,
            burst: config.burst,
        })
    }
}

/// Cache and rate limit rules in configured order.
///
/// Built once and shared read-only; resolution lives in
/// [`RuleTable::resolve_cache`] and [`RuleTable::resolve_rate_limit`].
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    pub(crate) cache: Vec<CacheRule>,
    pub(crate) rate_limit: Vec<RateLimitRule>,
}

impl RuleTable {
    /// Builds a table from already compiled rules.
    pub fn new(cache: Vec<CacheRule>, rate_limit: Vec<RateLimitRule>) -> Self {
        Self { cache, rate_limit }
    }

    /// Compiles every endpoint in `config`, failing on the first bad pattern.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let cache = config
            .cache
            .endpoints
            .iter()
            .enumerate()
            .map(|(i, ep)| CacheRule::from_config(i, ep))
            .collect::<Result<Vec<_>, _>>()?;
        let rate_limit = config
            .rate_limit
            .endpoints
            .iter()
            .enumerate()
            .map(|(i, ep)| RateLimitRule::from_config(i, ep))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { cache, rate_limit })
    }

    /// Cache rules in precedence order.
    pub fn cache_rules(&self) -> &[CacheRule] {
        &self.cache
    }

    /// Rate limit rules in precedence order.
    pub fn rate_limit_rules(&self) -> &[RateLimitRule] {
        &self.rate_limit
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

fn compile_path(
    scope: &str,
    pattern: Option<&str>,
) -> Result<Option<Regex>, ConfigError> {
    match pattern {
        None | Some("") => Ok(None),
        Some(pattern) => Regex::new(pattern).map(Some).map_err(|source| {
            ConfigError::InvalidPattern {
                scope: format!("{scope}.path_regex"),
                pattern: pattern.to_string(),
                source,
            }
        }),
    }
}

fn match_path(
    exact: Option<&str>,
    pattern: Option<&Regex>,
    path: &str,
) -> Option<PathMatch> {
    if exact == Some(path) {
        return Some(PathMatch::Exact);
    }
    match pattern {
        Some(re) if re.is_match(path) => Some(PathMatch::Pattern),
        _ => None,
    }
}
