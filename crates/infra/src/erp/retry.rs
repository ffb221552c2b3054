//! Retry of transient ERP failures.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use kardex_core::HeaderKey;
use kardex_inventory::{HeaderStatus, LegacyDetail, LegacyHeader};

use super::{ErpReader, ErpResult, HeaderCursor};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base` after every attempt.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Attempts and delays of one ERP read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per read, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(strategy: BackoffStrategy, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            strategy,
        }
    }

    /// Delay after failed attempt number `attempt` (1-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match (self.strategy, attempt) {
            (_, 0) => return Duration::ZERO,
            (BackoffStrategy::Fixed, _) => Some(self.base_delay),
            (BackoffStrategy::Linear, n) => self.base_delay.checked_mul(n),
            (BackoffStrategy::Exponential, n) => 2u32
                .checked_pow(n - 1)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
        };
        delay.map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Decorator retrying transient failures of the wrapped reader.
///
/// Fatal errors (decoding, configuration, query) are returned at once.
#[derive(Debug)]
pub struct RetryingErpReader<R> {
    inner: R,
    policy: RetryPolicy,
    alias: String,
}

impl<R: ErpReader> RetryingErpReader<R> {
    pub fn new(inner: R, policy: RetryPolicy, alias: impl Into<String>) -> Self {
        Self {
            inner,
            policy,
            alias: alias.into(),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn with_retry<T>(&self, operation: &str, f: impl Fn(&R) -> ErpResult<T>) -> ErpResult<T> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match f(&self.inner) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && self.policy.should_retry(attempts) => {
                    let delay = self.policy.delay_for_attempt(attempts);
                    warn!(
                        erp = %self.alias,
                        operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient erp failure, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<R: ErpReader> ErpReader for RetryingErpReader<R> {
    fn count_headers(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<u64> {
        self.with_retry("count_headers", |r| r.count_headers(since, doc_types))
    }

    fn fetch_headers(
        &self,
        since: DateTime<Utc>,
        doc_types: &[String],
        after: Option<&HeaderCursor>,
        limit: usize,
    ) -> ErpResult<Vec<LegacyHeader>> {
        self.with_retry("fetch_headers", |r| r.fetch_headers(since, doc_types, after, limit))
    }

    fn stream_details(&self, header: &HeaderKey) -> ErpResult<Vec<LegacyDetail>> {
        self.with_retry("stream_details", |r| r.stream_details(header))
    }

    fn details_for(&self, headers: &[HeaderKey]) -> ErpResult<BTreeMap<HeaderKey, Vec<LegacyDetail>>> {
        self.with_retry("details_for", |r| r.details_for(headers))
    }

    fn list_header_keys(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<Vec<HeaderStatus>> {
        self.with_retry("list_header_keys", |r| r.list_header_keys(since, doc_types))
    }
}
