//! Distributed key/value port
//!
//! The distributed tier is the only cross-instance shared mutable state:
//! identifier cache entries (`{collection}:{keyField}:{keyValue}`) and the
//! circuit-breaker flag. Access is limited to atomic primitives:
//!
//! - `get` / `set` (with optional TTL)
//! - `set_if_absent` (SET NX PX)
//! - `compare_and_delete` (delete only while the stored value matches)
//!
//! [`MemoryStore`] backs single-instance deployments and tests;
//! [`RedisStore`] is the production implementation.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Shared key/value store reachable from every process instance
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Read a value. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one. `None` TTL never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete only if the stored value equals `expected`. Returns whether a
    /// delete happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}
