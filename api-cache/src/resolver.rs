//! Endpoint precedence: which cache rule and which rate limit rule apply.

use std::{collections::HashMap, fmt};

use http::{Method, Uri};
use url::form_urlencoded;

use crate::rules::{CacheRule, PathMatch, RateLimitRule, RuleTable};

/// Decoded query parameters, every value kept in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(HashMap<String, Vec<String>>);

impl QueryParams {
    /// Decodes a raw query string (without the leading `?`).
    pub fn parse(raw: &str) -> Self {
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in form_urlencoded::parse(raw.as_bytes()) {
            params.entry(name.into_owned()).or_default().push(value.into_owned());
        }
        Self(params)
    }

    /// Decodes the query component of `uri`.
    pub fn from_uri(uri: &Uri) -> Self {
        uri.query().map(Self::parse).unwrap_or_default()
    }

    /// The first non-empty value supplied for `name`.
    ///
    /// Repeated parameters are ignored past their first occurrence.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// True when no parameters were supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for QueryParams {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in iter {
            params.entry(name.to_string()).or_default().push(value.to_string());
        }
        Self(params)
    }
}

/// How a request was matched to a cache rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Exact path of a rule without query constraints, none competing
    Exact,
    /// Path pattern of a rule without query constraints, none competing
    Pattern,
    /// A rule whose query constraints all held
    QueryDiscriminated,
    /// Exact path rule chosen after query-constrained rules for the path failed
    FallbackExact,
    /// Pattern rule chosen after query-constrained rules for the path failed
    FallbackPattern,
    /// Nothing matched; the process default TTL applies
    Default,
}

impl MatchKind {
    /// Stable label used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Pattern => "regex",
            Self::QueryDiscriminated => "query_param",
            Self::FallbackExact => "fallback_exact",
            Self::FallbackPattern => "fallback_regex",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of cache rule resolution for one request.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult<'a> {
    /// The winning rule, if any
    pub rule: Option<&'a CacheRule>,
    /// Provenance of the match
    pub kind: MatchKind,
}

impl RuleTable {
    /// Finds the cache rule for a request.
    ///
    /// Walks the rules once in configured order. The first rule whose query
    /// constraints all hold wins on the spot. The first rule without
    /// constraints is remembered as the fallback and only wins once the walk
    /// is exhausted.
    pub fn resolve_cache(
        &self,
        path: &str,
        method: &Method,
        query: &QueryParams,
    ) -> MatchResult<'_> {
        let mut fallback: Option<(&CacheRule, PathMatch)> = None;
        let mut discriminated_seen = false;

        for rule in &self.cache {
            if !rule.allows_method(method) {
                continue;
            }
            let Some(matched) = rule.match_path(path) else {
                continue;
            };
            if !rule.is_discriminating() {
                if fallback.is_none() {
                    fallback = Some((rule, matched));
                }
                continue;
            }
            discriminated_seen = true;
            if rule.query_constraints_hold(query) {
                return MatchResult {
                    rule: Some(rule),
                    kind: MatchKind::QueryDiscriminated,
                };
            }
        }

        let Some((rule, matched)) = fallback else {
            return MatchResult { rule: None, kind: MatchKind::Default };
        };
        let kind = match (discriminated_seen, matched) {
            (false, PathMatch::Exact) => MatchKind::Exact,
            (false, PathMatch::Pattern) => MatchKind::Pattern,
            (true, PathMatch::Exact) => MatchKind::FallbackExact,
            (true, PathMatch::Pattern) => MatchKind::FallbackPattern,
        };
        MatchResult { rule: Some(rule), kind }
    }

    /// Finds the rate limit rule for `path`: the first exact hit, else the
    /// first pattern hit.
    pub fn resolve_rate_limit(&self, path: &str) -> Option<&RateLimitRule> {
        self.rate_limit
            .iter()
            .find(|rule| rule.path.as_deref() == Some(path))
            .or_else(|| {
                self.rate_limit.iter().find(|rule| {
                    rule.pattern.as_ref().is_some_and(|re| re.is_match(path))
                })
            })
    }
}
