//! Cache key derivation.

use http::request::Parts;
use sha2::{Digest, Sha256};

use crate::{resolver::QueryParams, rules::CacheRule};

/// Namespace prefix carried by every key [`DigestKeyer`] produces.
pub const KEY_PREFIX: &str = "cache:";

/// Trait for generating cache keys from a request and its matched rule.
///
/// Implementations must be deterministic: the same inputs always produce the
/// same key.
pub trait Keyer: Clone + Send + Sync + 'static {
    /// Generate a cache key for the given request.
    fn cache_key(
        &self,
        parts: &Parts,
        query: &QueryParams,
        rule: Option<&CacheRule>,
    ) -> String;
}

/// Default keyer hashing the method, path and the rule's key-relevant query
/// parameters and headers with SHA-256.
///
/// The hashed text is `METHOD:path[:a=1&b=2][:h1=x|h2=y]`, where the query
/// and header components list only designated names with non-empty values,
/// sorted. Anything the rule does not designate never affects the key.
///
/// ```
/// # use api_cache::{DigestKeyer, Keyer, QueryParams};
/// # use http::Request;
/// let (parts, ()) = Request::get("/health").body(()).unwrap().into_parts();
/// let key = DigestKeyer.cache_key(&parts, &QueryParams::default(), None);
/// assert_eq!(
///     key,
///     "cache:ce27093e6856b11c94f165ab0930efbad7bf1bc4ff70f4e345e7e7f029ebb37f"
/// );
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestKeyer;

impl Keyer for DigestKeyer {
    fn cache_key(
        &self,
        parts: &Parts,
        query: &QueryParams,
        rule: Option<&CacheRule>,
    ) -> String {
        let mut components =
            vec![parts.method.as_str().to_string(), parts.uri.path().to_string()];

        if let Some(rule) = rule {
            let mut pairs: Vec<String> = rule
                .key_query_params
                .iter()
                .filter_map(|name| {
                    query.first(name).map(|value| format!("{name}={value}"))
                })
                .collect();
            pairs.sort();
            if !pairs.is_empty() {
                components.push(pairs.join("&"));
            }

            let mut pairs: Vec<String> = rule
                .key_headers
                .iter()
                .filter_map(|name| {
                    parts
                        .headers
                        .get(name.as_str())
                        .and_then(|value| value.to_str().ok())
                        .filter(|value| !value.is_empty())
                        .map(|value| format!("{name}={value}"))
                })
                .collect();
            pairs.sort();
            if !pairs.is_empty() {
                components.push(pairs.join("|"));
            }
        }

        let digest = Sha256::digest(components.join(":").as_bytes());
        format!("{KEY_PREFIX}{}", hex::encode(digest))
    }
}
