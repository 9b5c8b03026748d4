//! Process-local identifier tier
//!
//! First tier of the identifier cache: a DashMap of
//! `{collection}:{keyField}:{keyValue}` to remote id with a fixed TTL.
//! Bounded by entry count; when full, expired entries go first, then the
//! oldest by insertion time.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct LocalEntry {
    id: String,
    cached_at: Instant,
    expires_at: Instant,
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters for the local tier
#[derive(Debug, Clone, Default)]
pub struct TierStats {
    /// Number of entries held (including not yet purged expired ones)
    pub item_count: usize,
    /// Maximum entries before eviction
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Evictions due to the entry limit
    pub evictions: u64,
    /// Entries dropped because their TTL passed
    pub expirations: u64,
}

impl TierStats {
    /// Hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

// ============================================================================
// Local Tier
// ============================================================================

pub struct LocalTier {
    entries: DashMap<String, LocalEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalTier {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        info!(
            ttl_secs = ttl.as_secs(),
            max_entries = max_entries,
            "Local identifier tier initialized"
        );
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up an identifier. O(1).
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if Instant::now() < entry.expires_at {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.id.clone());
            }
            drop(entry);
            if self.entries.remove_if(key, |_, e| Instant::now() >= e.expires_at).is_some() {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store an identifier, replacing any previous value
    pub fn set(&self, key: &str, id: &str) {
        if !self.entries.contains_key(key) {
            self.evict_until_fits();
        }
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                id: id.to_string(),
                cached_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make room for one more entry
    fn evict_until_fits(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }

        if self.cleanup_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }

        let to_free = self.entries.len() + 1 - self.max_entries;

        // Oldest first
        let mut candidates: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.cached_at))
            .collect();
        candidates.sort_by_key(|(_, cached_at)| *cached_at);

        let mut freed = 0usize;
        for (key, _) in candidates {
            if freed >= to_free {
                break;
            }
            if self.entries.remove(&key).is_some() {
                freed += 1;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(freed = freed, "Evicted local identifier entries");
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now >= e.expires_at)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0usize;
        for key in &expired {
            if self.entries.remove_if(key, |_, e| now >= e.expires_at).is_some() {
                removed += 1;
            }
        }
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            item_count: self.entries.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Spawn a background task that purges expired entries every `interval`.
///
/// The task holds an `Arc` to the tier and runs until the runtime shuts down.
pub fn spawn_cleanup_task(tier: Arc<LocalTier>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let expired = tier.cleanup_expired();
            let stats = tier.stats();
            debug!(
                expired = expired,
                items = stats.item_count,
                hit_rate = format!("{:.1}%", stats.hit_rate()),
                "Local identifier tier cleanup completed"
            );
        }
    });

    info!(
        interval_secs = interval.as_secs(),
        "Local identifier tier cleanup task started"
    );
}
