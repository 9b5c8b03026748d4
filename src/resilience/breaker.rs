//! Circuit Breaker
//!
//! Cross-instance cool-down after the remote store throttles. The state is a
//! single distributed-cache entry holding `openUntil` (RFC 3339, UTC) with a
//! TTL equal to the pause. Every instance reads it before an attempt and
//! sleeps out the remainder.
//!
//! Races are tolerated: writers only ever extend the window. Store failures
//! are logged and read as "closed"; the remote store's own throttling still
//! protects it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sleep_or_cancel;
use crate::error::Result;
use crate::kv::DistributedCache;

/// Configuration for the shared circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Distributed cache key holding `openUntil`
    pub key: String,
    /// Pause when the remote store gives no `Retry-After` (default: 5s)
    pub min_pause: Duration,
    /// Upper bound for the fallback pause (default: 60s)
    pub max_pause: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            key: "dataverse:circuitbreaker".to_string(),
            min_pause: Duration::from_secs(5),
            max_pause: Duration::from_secs(60),
        }
    }
}

pub struct CircuitBreaker {
    store: Arc<dyn DistributedCache>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn DistributedCache>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Pause for a throttled attempt: the advisory delay when positive,
    /// else the minimum pause bounded by the maximum.
    pub fn pause_for(&self, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(advisory) if !advisory.is_zero() => advisory,
            _ => self.config.min_pause.min(self.config.max_pause),
        }
    }

    /// Current `openUntil`, if the breaker is open
    pub async fn open_until(&self) -> Option<DateTime<Utc>> {
        let raw = match self.store.get(&self.config.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, key = %self.config.key, "Circuit breaker state unreadable, assuming closed");
                return None;
            }
        };

        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(until) => Some(until.with_timezone(&Utc)).filter(|u| *u > Utc::now()),
            Err(e) => {
                warn!(error = %e, value = %raw, "Malformed circuit breaker timestamp, ignoring");
                None
            }
        }
    }

    /// Time left until the breaker closes
    pub async fn remaining(&self) -> Option<Duration> {
        let until = self.open_until().await?;
        (until - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Block while the breaker is open. Returns how long the caller waited.
    pub async fn wait_if_active(&self, cancel: &CancellationToken) -> Result<Duration> {
        let Some(wait) = self.remaining().await else {
            return Ok(Duration::ZERO);
        };

        warn!(wait_ms = wait.as_millis() as u64, "Circuit breaker open, pausing before remote call");
        sleep_or_cancel(wait, cancel).await?;
        Ok(wait)
    }

    /// Open (or extend) the breaker after a throttled attempt.
    ///
    /// Returns the pause applied.
    pub async fn open(&self, retry_after: Option<Duration>) -> Duration {
        let pause = self.pause_for(retry_after);
        if pause.is_zero() {
            return pause;
        }

        let Ok(delta) = chrono::Duration::from_std(pause) else {
            warn!(pause_ms = pause.as_millis() as u64, "Circuit breaker pause out of range");
            return pause;
        };
        let until = Utc::now() + delta;

        if let Some(current) = self.open_until().await {
            if current >= until {
                debug!(open_until = %current.to_rfc3339(), "Circuit breaker already open longer");
                return pause;
            }
        }

        match self
            .store
            .set(&self.config.key, &until.to_rfc3339(), Some(pause))
            .await
        {
            Ok(()) => info!(
                open_until = %until.to_rfc3339(),
                pause_secs = pause.as_secs(),
                "Circuit breaker opened"
            ),
            Err(e) => warn!(error = %e, "Failed to publish circuit breaker state"),
        }
        pause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::kv::MemoryStore;
    use async_trait::async_trait;

    fn breaker(store: Arc<dyn DistributedCache>) -> CircuitBreaker {
        CircuitBreaker::new(store, BreakerConfig::default())
    }

    #[test]
    fn test_pause_selection() {
        let b = breaker(Arc::new(MemoryStore::new()));
        assert_eq!(b.pause_for(None), Duration::from_secs(5));
        assert_eq!(b.pause_for(Some(Duration::ZERO)), Duration::from_secs(5));
        assert_eq!(b.pause_for(Some(Duration::from_secs(90))), Duration::from_secs(90));

        let capped = CircuitBreaker::new(
            Arc::new(MemoryStore::new()),
            BreakerConfig {
                min_pause: Duration::from_secs(120),
                ..BreakerConfig::default()
            },
        );
        assert_eq!(capped.pause_for(None), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_instance_waits_for_open_breaker() {
        let store: Arc<dyn DistributedCache> = Arc::new(MemoryStore::new());
        let first = breaker(store.clone());
        let second = breaker(store);

        first.open(Some(Duration::from_secs(10))).await;

        let started = tokio::time::Instant::now();
        let waited = second.wait_if_active(&CancellationToken::new()).await.unwrap();
        let elapsed = started.elapsed();

        assert!(waited > Duration::from_secs(9), "waited {waited:?}");
        assert!(elapsed >= Duration::from_secs(9) && elapsed <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_closed_breaker_does_not_wait() {
        let b = breaker(Arc::new(MemoryStore::new()));
        let waited = b.wait_if_active(&CancellationToken::new()).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_open_only_extends() {
        let store: Arc<dyn DistributedCache> = Arc::new(MemoryStore::new());
        let b = breaker(store);

        b.open(Some(Duration::from_secs(30))).await;
        let long = b.open_until().await.unwrap();

        b.open(Some(Duration::from_secs(5))).await;
        assert_eq!(b.open_until().await.unwrap(), long);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let b = breaker(Arc::new(MemoryStore::new()));
        b.open(Some(Duration::from_secs(30))).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = b.wait_if_active(&cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    struct BrokenStore;

    #[async_trait]
    impl DistributedCache for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(SyncError::Cache("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
            Err(SyncError::Cache("connection refused".into()))
        }
        async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool> {
            Err(SyncError::Cache("connection refused".into()))
        }
        async fn compare_and_delete(&self, _key: &str, _expected: &str) -> Result<bool> {
            Err(SyncError::Cache("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_reads_as_closed() {
        let b = breaker(Arc::new(BrokenStore));
        assert_eq!(b.open(None).await, Duration::from_secs(5));
        assert_eq!(
            b.wait_if_active(&CancellationToken::new()).await.unwrap(),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_malformed_state_ignored() {
        let store: Arc<dyn DistributedCache> = Arc::new(MemoryStore::new());
        store
            .set("dataverse:circuitbreaker", "not-a-date", None)
            .await
            .unwrap();
        assert!(breaker(store).open_until().await.is_none());
    }
}
