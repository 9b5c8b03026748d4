//! Resilience around batch execution
//!
//! - [`ConcurrencyGate`]: process-local bound on batches in flight
//! - [`CircuitBreaker`]: cross-instance pause after throttling
//! - [`RetryPolicy`]: attempt loop with backoff, jitter and whole-batch replay

pub mod breaker;
pub mod gate;
pub mod retry;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};

pub use self::breaker::{BreakerConfig, CircuitBreaker};
pub use self::gate::{ConcurrencyGate, GateConfig, GatePermit};
pub use self::retry::{RetryConfig, RetryPolicy};

/// Sleep for `delay` unless `cancel` fires first
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
