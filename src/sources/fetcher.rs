//! Throttled, retrying source calls
//!
//! Each attempt acquires throttle capacity, runs under a per-attempt timeout
//! and is classified as retryable or not. Delays between attempts double up
//! to a cap. Cancellation interrupts throttle waits and backoff sleeps.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PoolSource;
use crate::config::AggregatorConfig;
use crate::error::{Error, Result};
use crate::throttle::Throttler;
use crate::types::PoolRecord;

/// Retry parameters for one source call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl From<&AggregatorConfig> for RetryPolicy {
    fn from(config: &AggregatorConfig) -> Self {
        Self {
            max_attempts: config.max_fetch_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            attempt_timeout: Duration::from_secs(config.fetch_timeout_secs),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// A source call that failed for this run
#[derive(Debug, Clone, thiserror::Error)]
#[error("{source_name} failed after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub source_name: String,
    pub attempts: u32,
    /// Last failure observed
    pub cause: Error,
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, Error::Cancelled)
    }
}

#[derive(Clone)]
pub struct SourceFetcher {
    throttle: Arc<Throttler>,
    policy: RetryPolicy,
}

impl SourceFetcher {
    pub fn new(throttle: Arc<Throttler>, policy: RetryPolicy) -> Self {
        Self { throttle, policy }
    }

    pub fn throttle(&self) -> &Arc<Throttler> {
        &self.throttle
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch a pool listing, stamping each record with the source's name and kind
    pub async fn fetch_pools(
        &self,
        source: &dyn PoolSource,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<PoolRecord>, FetchError> {
        let mut records = self
            .call(source.name(), source.token_cost(), cancel, || source.fetch())
            .await?;

        for record in &mut records {
            record.source = source.name().to_string();
            record.source_kind = source.kind();
        }
        info!(source = source.name(), count = records.len(), "Fetched pools");
        Ok(records)
    }

    /// Run `op` with throttling, per-attempt timeout and retries
    pub async fn call<T, F, Fut>(
        &self,
        label: &str,
        token_cost: u32,
        cancel: &CancellationToken,
        mut op: F,
    ) -> std::result::Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.policy.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.attempt(label, token_cost, &mut op) => result,
            };

            let cause = match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        info!(source = label, attempts, "Source call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if cause.is_rate_limit() {
                self.throttle.note_rate_limit();
            }

            let give_up = matches!(cause, Error::Cancelled)
                || !cause.is_retryable()
                || attempts >= self.policy.max_attempts;
            if give_up {
                warn!(source = label, attempts, error = %cause, "Source call failed");
                return Err(FetchError {
                    source_name: label.to_string(),
                    attempts,
                    cause,
                });
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
            warn!(
                source = label,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "Transient failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(source = label, "Cancelled during backoff");
                    return Err(FetchError {
                        source_name: label.to_string(),
                        attempts,
                        cause: Error::Cancelled,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, label: &str, token_cost: u32, op: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.throttle.acquire(1, token_cost).await?;

        match tokio::time::timeout(self.policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::SourceTimeout(
                label.to_string(),
                self.policy.attempt_timeout.as_millis() as u64,
            )),
        }
    }
}
