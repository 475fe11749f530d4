use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Generic error type for errors crossing trait-object boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` typedef to use with the [`BoxError`] type
pub type Result<T> = std::result::Result<T, BoxError>;

/// Invalid configuration, reported before any request is served.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was being read
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },
    /// The configuration text is not valid YAML for [`crate::Config`]
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A value failed validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// A path or query-parameter pattern failed to compile
    #[error("invalid {scope} regex pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// Which rule list and field the pattern came from
        scope: String,
        /// The pattern as written
        pattern: String,
        /// Compilation failure
        #[source]
        source: regex::Error,
    },
    /// The upstream HTTP client could not be constructed
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Failure of a [`crate::CacheManager`] backend.
///
/// Reads that fail are treated as misses and writes that fail are logged;
/// neither reaches the client, except [`StoreError::Encode`] which is a local
/// fault of the request being served.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command
    #[error("cache backend error: {0}")]
    Backend(BoxError),
    /// A stored payload could not be decoded
    #[error("malformed cache entry: {0}")]
    Malformed(#[source] postcard::Error),
    /// An entry could not be encoded for storage
    #[error("failed to encode cache entry: {0}")]
    Encode(#[source] postcard::Error),
    /// The operation did not finish within the configured store timeout
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(feature = "manager-redis")]
impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        StoreError::Backend(Box::new(error))
    }
}

/// Failure talking to the upstream service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream request could not be constructed; never retried
    #[error("failed to create upstream request: {0}")]
    Request(#[source] reqwest::Error),
    /// Every permitted attempt failed at the transport level
    #[error("all {attempts} upstream attempts failed: {source}")]
    Exhausted {
        /// Attempts made before giving up
        attempts: u32,
        /// The last transport failure
        #[source]
        source: reqwest::Error,
    },
    /// The response body could not be read after a status line was received
    #[error("failed to read upstream response body: {0}")]
    Body(#[source] reqwest::Error),
}
