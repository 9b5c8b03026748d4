//! Redis implementation of the distributed cache port.
//!
//! Uses a multiplexed `ConnectionManager` (reconnects transparently) and an
//! optional key prefix so several environments can share one Redis.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

use super::DistributedCache;
use crate::error::{Result, SyncError};

/// Delete the key only while it still holds the caller's value
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    prefix: Option<String>,
}

impl RedisStore {
    /// Connect to Redis (`redis://` or `rediss://` URL)
    pub async fn connect(url: &str, prefix: Option<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SyncError::Cache(format!("redis client open: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| SyncError::Cache(format!("redis connect: {e}")))?;
        info!(prefix = ?prefix, "Redis distributed cache connected");
        Ok(Self { manager, prefix })
    }

    fn scoped(&self, key: &str) -> Result<String> {
        if key.trim().is_empty() {
            return Err(SyncError::Cache("redis key is empty".to_string()));
        }
        Ok(match self.prefix.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => format!("{p}:{key}"),
            _ => key.to_string(),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl DistributedCache for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.scoped(key)?;
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(&key).await?;
        debug!(key = %key, hit = value.is_some(), "redis get");
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = self.scoped(key)?;
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(&key, value, ttl_millis(ttl)).await?;
            }
            None => {
                let _: () = conn.set(&key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let key = self.scoped(key)?;
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let key = self.scoped(key)?;
        let mut conn = self.manager.clone();
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(&key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_floor() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5000);
    }
}
