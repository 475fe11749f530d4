//! Upstream forwarding with bounded, exponentially backed-off retries.

use std::time::Duration;

use bytes::Bytes;
use http::{request::Parts, HeaderMap, StatusCode, Uri};
use reqwest::{redirect, Client, Response};

use crate::{
    config::{Config, RetryConfig},
    error::{ConfigError, UpstreamError},
    headers::{copy_headers, forward_upstream},
    logging::Logger,
};

/// When and how upstream calls are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// When false exactly one attempt is made
    pub enabled: bool,
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Sleep before the first retry
    pub initial_backoff: Duration,
    /// Cap on any single sleep
    pub max_backoff: Duration,
    /// Growth factor applied after every retry
    pub multiplier: f64,
    /// Upstream statuses treated like transport failures
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.backoff_multiplier,
            retryable_status_codes: config.retryable_status_codes.clone(),
        }
    }
}

impl RetryPolicy {
    /// A policy making a single attempt.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Attempts permitted per request, never less than one.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Whether `status` triggers a retry.
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }
}

/// Progress of one request through its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts started so far
    pub attempt: u32,
    /// Sleep before the next retry, before capping
    pub backoff: Duration,
    /// Why the previous attempt failed
    pub last_error: Option<String>,
}

impl RetryState {
    /// Fresh state for `policy`.
    pub fn new(policy: &RetryPolicy) -> Self {
        Self { attempt: 0, backoff: policy.initial_backoff, last_error: None }
    }

    /// Records the start of an attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// True while attempts remain after the current one.
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        self.attempt < policy.attempts()
    }

    /// Returns the sleep before the next retry and grows the backoff by the
    /// policy multiplier. Both are capped at `max_backoff`.
    pub fn next_backoff(&mut self, policy: &RetryPolicy) -> Duration {
        let current = self.backoff.min(policy.max_backoff);
        let grown = Duration::try_from_secs_f64(
            self.backoff.as_secs_f64() * policy.multiplier,
        )
        .unwrap_or(policy.max_backoff);
        self.backoff = grown.min(policy.max_backoff);
        current
    }
}

/// The upstream service and the client used to reach it.
///
/// Requests keep their method, path, query string, body and end-to-end
/// headers; only scheme and authority are rewritten to `base_url`.
/// Redirects are passed through to the caller rather than followed.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
    logger: Logger,
}

impl Upstream {
    /// Wraps an existing client.
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            policy,
            logger: Logger::global(),
        }
    }

    /// Builds a pooled client from the `upstream` and `retry` sections.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::build(
            &config.upstream.base_url,
            config.upstream.timeout,
            config.upstream.max_idle_conns_per_host,
            RetryPolicy::from(&config.retry),
        )
    }

    /// Builds a client with the given per-attempt timeout (zero for none).
    pub fn build(
        base_url: &str,
        timeout: Duration,
        max_idle_per_host: usize,
        policy: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .pool_max_idle_per_host(max_idle_per_host);
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        Ok(Self::new(builder.build()?, base_url, policy))
    }

    /// Replaces the logging handle.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// The retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The upstream URL for an inbound request URI.
    pub fn upstream_url(&self, uri: &Uri) -> String {
        let base = self.base_url.trim_end_matches('/');
        match uri.query() {
            Some(query) => format!("{base}{}?{query}", uri.path()),
            None => format!("{base}{}", uri.path()),
        }
    }

    /// Sends the request upstream, retrying per the policy.
    ///
    /// Transport failures and retryable statuses are retried while attempts
    /// remain, sleeping the current backoff first. At exhaustion a transport
    /// failure becomes [`UpstreamError::Exhausted`] and a retryable status is
    /// returned as the response it is. Dropping the future abandons the call
    /// along with any pending sleep.
    pub async fn send(
        &self,
        parts: &Parts,
        body: &Bytes,
        request_id: &str,
    ) -> Result<Response, UpstreamError> {
        let url = self.upstream_url(&parts.uri);
        let mut headers = HeaderMap::new();
        copy_headers(&parts.headers, &mut headers, forward_upstream);

        let mut state = RetryState::new(&self.policy);
        loop {
            let attempt = state.begin_attempt();
            let mut builder = self
                .client
                .request(parts.method.clone(), url.as_str())
                .headers(headers.clone());
            if !body.is_empty() {
                builder = builder.body(body.clone());
            }
            let request = builder.build().map_err(UpstreamError::Request)?;

            match self.client.execute(request).await {
                Ok(response) => {
                    let status = response.status();
                    if !(self.policy.is_retryable(status)
                        && state.can_retry(&self.policy))
                    {
                        return Ok(response);
                    }
                    log_warn!(
                        self.logger,
                        "upstream returned retryable status request_id={request_id} method={} path={} attempt={attempt} status={}",
                        parts.method,
                        parts.uri.path(),
                        status.as_u16()
                    );
                    state.last_error = Some(format!("status {status}"));
                }
                Err(e) => {
                    if !state.can_retry(&self.policy) {
                        return Err(UpstreamError::Exhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    log_warn!(
                        self.logger,
                        "upstream request failed request_id={request_id} method={} path={} attempt={attempt} error={e}",
                        parts.method,
                        parts.uri.path()
                    );
                    state.last_error = Some(e.to_string());
                }
            }

            let delay = state.next_backoff(&self.policy);
            log_debug!(
                self.logger,
                "retrying upstream request request_id={request_id} next_attempt={} backoff_ms={} last_error={}",
                attempt + 1,
                delay.as_millis(),
                state.last_error.as_deref().unwrap_or("-")
            );
            tokio::time::sleep(delay).await;
        }
    }
}
