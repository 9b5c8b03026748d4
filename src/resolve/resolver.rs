//! Fetch-through resolver over both cache tiers and the bulk query

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{LookupRequest, LookupSpec, LocalTier, RecordQuery, ResolvedIds};
use crate::error::Result;
use crate::kv::DistributedCache;

pub struct IdentifierResolver {
    local: Arc<LocalTier>,
    distributed: Arc<dyn DistributedCache>,
    query: Arc<dyn RecordQuery>,
    ttl: Duration,
}

impl IdentifierResolver {
    pub fn new(
        local: Arc<LocalTier>,
        distributed: Arc<dyn DistributedCache>,
        query: Arc<dyn RecordQuery>,
        ttl: Duration,
    ) -> Self {
        Self {
            local,
            distributed,
            query,
            ttl,
        }
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.local
    }

    /// Resolve business keys to identifiers.
    ///
    /// Duplicate and blank keys are dropped before any lookup. Keys with no
    /// matching remote record are absent from the result. Query and
    /// distributed-tier errors propagate.
    pub async fn resolve(&self, spec: &LookupSpec, keys: &[String]) -> Result<HashMap<String, String>> {
        let keys = distinct_keys(keys);
        let mut resolved = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            let cache_key = spec.cache_key(&key);

            if let Some(id) = self.local.get(&cache_key) {
                debug!(key = %cache_key, "Local tier hit");
                resolved.insert(key, id);
                continue;
            }

            match self.distributed.get(&cache_key).await? {
                Some(id) if !id.is_empty() => {
                    debug!(key = %cache_key, "Distributed tier hit");
                    self.local.set(&cache_key, &id);
                    resolved.insert(key, id);
                }
                _ => {
                    debug!(key = %cache_key, "Identifier cache miss");
                    missing.push(key);
                }
            }
        }

        if !missing.is_empty() {
            let fetched = self.fetch_and_store(spec, &missing).await?;
            resolved.extend(fetched);
        }

        Ok(resolved)
    }

    /// Resolve several collections in one pass
    pub async fn preload(&self, requests: &[LookupRequest]) -> Result<ResolvedIds> {
        let mut ids = ResolvedIds::default();
        for request in requests {
            let resolved = self.resolve(&request.spec, &request.keys).await?;
            ids.extend(&request.spec, resolved);
        }
        info!(resolved = ids.len(), collections = requests.len(), "Identifier preload complete");
        Ok(ids)
    }

    /// Bypass both tiers: query the remote store and overwrite cached entries.
    ///
    /// Used after a successful write so newly created records are cached.
    pub async fn refresh(&self, spec: &LookupSpec, keys: &[String]) -> Result<HashMap<String, String>> {
        let keys = distinct_keys(keys);
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.fetch_and_store(spec, &keys).await
    }

    async fn fetch_and_store(&self, spec: &LookupSpec, keys: &[String]) -> Result<HashMap<String, String>> {
        let fetched = self.query.fetch_ids(spec, keys).await?;
        let resolved = match_requested(keys, fetched);

        for (key, id) in &resolved {
            let cache_key = spec.cache_key(key);
            self.distributed.set(&cache_key, id, Some(self.ttl)).await?;
            self.local.set(&cache_key, id);
            debug!(key = %cache_key, "Identifier cached");
        }

        debug!(
            collection = %spec.collection,
            requested = keys.len(),
            found = resolved.len(),
            "Bulk identifier fetch stored"
        );
        Ok(resolved)
    }
}

/// Re-key fetched rows by the caller's spelling of each key.
///
/// The remote filter compares case-insensitively, so rows may come back as
/// `ACME` for a request of `acme`. Rows matching no requested key are dropped.
fn match_requested(requested: &[String], fetched: HashMap<String, String>) -> HashMap<String, String> {
    let mut by_folded: HashMap<String, Vec<&String>> = HashMap::new();
    for key in requested {
        by_folded.entry(key.to_lowercase()).or_default().push(key);
    }

    let mut resolved = HashMap::with_capacity(fetched.len());
    for (remote_key, id) in fetched {
        match by_folded.get(&remote_key.to_lowercase()) {
            Some(matches) => {
                for key in matches {
                    resolved.insert((*key).clone(), id.clone());
                }
            }
            None => debug!(key = %remote_key, "Fetched row matches no requested key"),
        }
    }
    resolved
}

/// Trimmed, non-blank keys in first-seen order
fn distinct_keys(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_string()))
        .map(str::to_string)
        .collect()
}
