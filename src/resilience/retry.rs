//! Retry Policy
//!
//! Drives repeated attempts of one batch:
//!
//! ```text
//!            ┌──────────────── Attempting ◄──────────────────┐
//!            │                     │                         │
//!   complete │          throttled  │  failed indices         │ transient error
//!            ▼                     ▼         │               │
//!         Success     open breaker, sleep    └─ sleep 500ms ─┤
//!                     backoff + jitter ──────────────────────┘
//!
//!   other failure ──► Permanent-Failure      attempts used up ──► Exhausted
//! ```
//!
//! A partial failure means the changeset was rolled back, so the same
//! envelope is replayed in full. Attempt history is logged, not returned.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{sleep_or_cancel, CircuitBreaker};
use crate::error::{Result, SyncError};
use crate::operation::BatchExecutionResult;

/// Configuration for the retry loop
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per batch, first one included (default: 5)
    pub max_attempts: u32,
    /// First throttle/transient backoff (default: 1s)
    pub initial_backoff: Duration,
    /// Backoff cap (default: 30s)
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff (default: 500ms)
    pub max_jitter: Duration,
    /// Fixed delay before replaying a partially failed batch (default: 500ms)
    pub partial_failure_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_jitter: Duration::from_millis(500),
            partial_failure_delay: Duration::from_millis(500),
        }
    }
}

pub struct RetryPolicy {
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, breaker }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `attempt` until it completes, fails permanently or the attempts
    /// run out.
    ///
    /// `attempt` receives the 1-based attempt number. Returns the last
    /// observed result on exhaustion, or a placeholder when no attempt ever
    /// produced one. Errors that cannot succeed on retry, and cancellation,
    /// are returned as `Err`.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<BatchExecutionResult>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<BatchExecutionResult>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        let mut last: Option<BatchExecutionResult> = None;

        for number in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.breaker.wait_if_active(cancel).await?;

            let is_last = number == max_attempts;
            match attempt(number).await {
                Ok(result) if result.is_complete() => {
                    info!(attempt = number, succeeded = result.success_count(), "Batch succeeded");
                    return Ok(result);
                }
                Ok(result) if result.is_throttled() => {
                    warn!(
                        attempt = number,
                        retry_after_ms = result.retry_after().map(|d| d.as_millis() as u64),
                        "Batch throttled"
                    );
                    self.breaker.open(result.retry_after()).await;
                    last = Some(result);
                    if !is_last {
                        sleep_or_cancel(self.backoff_with_jitter(backoff), cancel).await?;
                        backoff = self.next_backoff(backoff);
                    }
                }
                Ok(result) if !result.failed_indices().is_empty() => {
                    warn!(
                        attempt = number,
                        failed = ?result.failed_indices(),
                        "Changeset rolled back, replaying whole batch"
                    );
                    last = Some(result);
                    if !is_last {
                        sleep_or_cancel(self.config.partial_failure_delay, cancel).await?;
                    }
                }
                Ok(result) => {
                    error!(
                        attempt = number,
                        error = result.error_message().unwrap_or_default(),
                        "Batch failed permanently"
                    );
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(attempt = number, error = %e, "Batch attempt failed, backing off");
                    if !is_last {
                        sleep_or_cancel(self.backoff_with_jitter(backoff), cancel).await?;
                        backoff = self.next_backoff(backoff);
                    }
                }
            }
        }

        error!(max_attempts = max_attempts, "Batch attempts exhausted");
        Ok(last.unwrap_or_else(BatchExecutionResult::attempts_exhausted))
    }

    fn backoff_with_jitter(&self, backoff: Duration) -> Duration {
        let max_jitter_ms = self.config.max_jitter.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
        backoff + Duration::from_millis(jitter_ms)
    }

    fn next_backoff(&self, backoff: Duration) -> Duration {
        (backoff * 2).min(self.config.max_backoff)
    }
}
