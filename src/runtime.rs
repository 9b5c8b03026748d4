//! Component wiring
//!
//! Builds the shared HTTP client, token provider, distributed store,
//! identifier resolver and the batch pipeline from a [`SyncConfig`].

use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{AuthConfig, ClientCredentialsProvider, StaticToken, TokenProvider};
use crate::batch::{BatchExecutor, BatchRequestBuilder, HttpBatchTransport};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::kv::{DistributedCache, MemoryStore, RedisStore};
use crate::operation::CollectionRouting;
use crate::processor::BatchProcessor;
use crate::resilience::{CircuitBreaker, ConcurrencyGate, RetryPolicy};
use crate::resolve::{spawn_cleanup_task, HttpRecordQuery, IdentifierResolver, LocalTier};

/// Fully wired pipeline
pub struct SyncRuntime {
    processor: BatchProcessor,
    resolver: Arc<IdentifierResolver>,
    breaker: Arc<CircuitBreaker>,
    gate: ConcurrencyGate,
    routing: CollectionRouting,
}

impl SyncRuntime {
    /// Connect to the distributed store and build every component.
    ///
    /// Must run inside a Tokio runtime (spawns the local tier cleanup task).
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.remote.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;

        let tokens: Arc<dyn TokenProvider> = match &config.auth {
            AuthConfig::Static(token) => Arc::new(StaticToken::new(token.clone())),
            AuthConfig::ClientCredentials(creds) => {
                Arc::new(ClientCredentialsProvider::new(creds.clone(), http.clone()))
            }
        };

        let store: Arc<dyn DistributedCache> = match &config.cache.redis_url {
            Some(url) => Arc::new(RedisStore::connect(url, config.cache.key_prefix.clone()).await?),
            None => {
                warn!("No REDIS_URL configured, circuit breaker and identifier cache are process-local");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::with_parts(config, http, tokens, store))
    }

    /// Build the pipeline from already constructed transport pieces
    pub fn with_parts(
        config: &SyncConfig,
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        store: Arc<dyn DistributedCache>,
    ) -> Self {
        let api_base = config.remote.api_base();

        let local = Arc::new(LocalTier::new(config.cache.ttl, config.cache.local_max_entries));
        spawn_cleanup_task(Arc::clone(&local), config.cache.cleanup_interval);

        let query = Arc::new(HttpRecordQuery::new(http.clone(), api_base.clone(), Arc::clone(&tokens)));
        let resolver = Arc::new(IdentifierResolver::new(
            local,
            Arc::clone(&store),
            query,
            config.cache.ttl,
        ));

        let builder = BatchRequestBuilder::new(api_base.clone()).with_debug(config.batch.debug);
        let transport = Arc::new(HttpBatchTransport::new(http, &api_base, tokens));
        let executor = Arc::new(BatchExecutor::new(builder, transport));

        let gate = ConcurrencyGate::new(&config.gate);
        let breaker = Arc::new(CircuitBreaker::new(store, config.breaker.clone()));
        let retry = Arc::new(RetryPolicy::new(config.retry.clone(), Arc::clone(&breaker)));

        let processor = BatchProcessor::new(executor, gate.clone(), retry, config.batch.max_operations)
            .with_resolver(Arc::clone(&resolver));

        info!(
            api = %api_base,
            max_operations = processor.max_operations(),
            max_concurrent = gate.limit(),
            max_attempts = config.retry.max_attempts,
            "Sync runtime ready"
        );

        Self {
            processor,
            resolver,
            breaker,
            gate,
            routing: config.batch.routing.clone(),
        }
    }

    pub fn processor(&self) -> &BatchProcessor {
        &self.processor
    }

    pub fn resolver(&self) -> &Arc<IdentifierResolver> {
        &self.resolver
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn routing(&self) -> &CollectionRouting {
        &self.routing
    }

    /// Stop handing out batch slots; in-flight batches finish
    pub fn shutdown(&self) {
        self.gate.close();
    }
}
