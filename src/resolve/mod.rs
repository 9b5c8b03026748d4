//! Identifier Resolution Cache
//!
//! Resolves business keys (structure ids, panel numbers, type names) to the
//! remote store's internal identifiers. Lookup order:
//!
//! 1. [`LocalTier`]: in-process map
//! 2. distributed tier ([`crate::kv::DistributedCache`]), shared by all instances
//! 3. [`RecordQuery`]: one bulk query per collection for the keys still missing
//!
//! Resolved entries are written back into both tiers with a fixed retention
//! TTL. Cache keys are `{collection}:{keyField}:{keyValue}`.

pub mod local;
pub mod query;
pub mod resolver;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use self::local::{spawn_cleanup_task, LocalTier, TierStats};
pub use self::query::{HttpRecordQuery, RecordQuery};
pub use self::resolver::IdentifierResolver;

/// Configuration for both identifier cache tiers
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Retention of resolved identifiers in both tiers (default: 90 days)
    pub ttl: Duration,
    /// Local tier entry limit (default: 100 000)
    pub local_max_entries: usize,
    /// Local tier purge interval (default: 10 minutes)
    pub cleanup_interval: Duration,
    /// Distributed tier; `None` falls back to an in-process store
    pub redis_url: Option<String>,
    /// Prefix for every distributed key
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(90 * 24 * 60 * 60), // 90 days
            local_max_entries: 100_000,
            cleanup_interval: Duration::from_secs(10 * 60),
            redis_url: None,
            key_prefix: None,
        }
    }
}

/// How key values are rendered in the bulk query filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Always quoted
    #[default]
    Text,
    /// Unquoted when the key parses as an integer
    Numeric,
}

/// Where and how to look up identifiers for one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupSpec {
    /// Entity set queried
    pub collection: String,
    /// Business key field matched by the filter
    pub key_field: String,
    /// Internal identifier field returned
    pub id_field: String,
    #[serde(default)]
    pub key_kind: KeyKind,
}

impl LookupSpec {
    pub fn text(
        collection: impl Into<String>,
        key_field: impl Into<String>,
        id_field: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            key_field: key_field.into(),
            id_field: id_field.into(),
            key_kind: KeyKind::Text,
        }
    }

    pub fn numeric(
        collection: impl Into<String>,
        key_field: impl Into<String>,
        id_field: impl Into<String>,
    ) -> Self {
        Self {
            key_kind: KeyKind::Numeric,
            ..Self::text(collection, key_field, id_field)
        }
    }

    /// `{collection}:{keyField}:{keyValue}`
    pub fn cache_key(&self, key: &str) -> String {
        format!("{}:{}:{}", self.collection, self.key_field, key)
    }
}

/// Keys to resolve for one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRequest {
    #[serde(flatten)]
    pub spec: LookupSpec,
    pub keys: Vec<String>,
}

impl LookupRequest {
    pub fn new(spec: LookupSpec, keys: Vec<String>) -> Self {
        Self { spec, keys }
    }
}

/// Identifiers resolved by a preload pass, keyed by cache key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedIds {
    ids: HashMap<String, String>,
}

impl ResolvedIds {
    pub fn get(&self, spec: &LookupSpec, key: &str) -> Option<&str> {
        self.ids.get(&spec.cache_key(key)).map(String::as_str)
    }

    pub fn get_by_cache_key(&self, cache_key: &str) -> Option<&str> {
        self.ids.get(cache_key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ids.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn extend(&mut self, spec: &LookupSpec, resolved: HashMap<String, String>) {
        for (key, id) in resolved {
            self.ids.insert(spec.cache_key(&key), id);
        }
    }
}
