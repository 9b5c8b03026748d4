//! Concurrency Gate
//!
//! Process-wide bound on batches in flight. One gate is built at startup and
//! shared (cloned) by every caller; it does not coordinate across instances.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Result, SyncError};

/// Configuration for the concurrency gate
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Maximum concurrent batch executions (default: 4, minimum: 1)
    pub max_concurrent_batches: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 4,
        }
    }
}

#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Slot held while a batch executes. Dropping it frees the slot on every
/// exit path.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(config: &GateConfig) -> Self {
        let limit = config.max_concurrent_batches.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::GateClosed)?;
        debug!(available = self.semaphore.available_permits(), "Batch slot acquired");
        Ok(GatePermit { _permit: permit })
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reject current and future waiters (shutdown)
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_limit_floor() {
        let gate = ConcurrencyGate::new(&GateConfig {
            max_concurrent_batches: 0,
        });
        assert_eq!(gate.limit(), 1);
        assert_eq!(ConcurrencyGate::new(&GateConfig::default()).limit(), 4);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let gate = ConcurrencyGate::new(&GateConfig {
            max_concurrent_batches: 1,
        });
        {
            let _permit = gate.acquire().await.unwrap();
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_waiter_wakes_when_slot_frees() {
        let gate = ConcurrencyGate::new(&GateConfig {
            max_concurrent_batches: 1,
        });
        let mut first = tokio_test::task::spawn(gate.acquire());
        let permit = tokio_test::assert_ready_ok!(first.poll());

        let mut second = tokio_test::task::spawn(gate.acquire());
        tokio_test::assert_pending!(second.poll());

        drop(permit);
        assert!(second.is_woken());
        tokio_test::assert_ready_ok!(second.poll());
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = ConcurrencyGate::new(&GateConfig::default());
        gate.close();
        assert!(matches!(gate.acquire().await, Err(SyncError::GateClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_in_flight() {
        let gate = ConcurrencyGate::new(&GateConfig {
            max_concurrent_batches: 2,
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(gate.available(), 2);
    }
}
