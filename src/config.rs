//! Configuration for crm-sync
//!
//! CLI arguments and environment variables are read once with clap, then
//! validated into a [`SyncConfig`] that is passed to every component.
//! Nothing below this module reads the environment.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{AuthConfig, ClientCredentials};
use crate::error::{Result, SyncError};
use crate::operation::{CollectionRouting, WriteMode};
use crate::resilience::{BreakerConfig, GateConfig, RetryConfig};
use crate::resolve::CacheConfig;

/// Smallest accepted `BATCH_SIZE`
pub const MIN_BATCH_SIZE: usize = 10;
/// Largest accepted `BATCH_SIZE` (remote store limit)
pub const MAX_BATCH_SIZE: usize = 1000;

/// crm-sync - batched, throttling-aware writes into a CRM Web API
#[derive(Parser, Debug, Clone)]
#[command(name = "crm-sync")]
#[command(about = "Submit operations to a CRM Web API through the resilient batch core")]
pub struct Args {
    /// JSON file of operations (or groups of operations) to submit
    #[arg(value_name = "FILE", env = "INPUT")]
    pub input: Option<PathBuf>,

    /// Remote store base URL (e.g. https://org.crm4.dynamics.com)
    #[arg(long, env = "RESOURCE_URL")]
    pub resource_url: Option<String>,

    /// Web API version segment
    #[arg(long, env = "API_VERSION", default_value = "v9.2")]
    pub api_version: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value = "120")]
    pub request_timeout_seconds: u64,

    /// Maximum sub-requests per batch (clamped to 10..=1000)
    #[arg(long, env = "BATCH_SIZE", default_value = "1000")]
    pub batch_size: usize,

    /// Alternate keys as `collection=field`, comma separated
    /// e.g. "msdyn_workorders=dc_name,msdyn_customerassets=dc_idpanel"
    #[arg(long, env = "ALTERNATE_KEYS", value_delimiter = ',')]
    pub alternate_keys: Vec<String>,

    /// Send alternate-key writes as create-only (`If-None-Match: *`)
    #[arg(long, env = "CREATE_ONLY", default_value = "false")]
    pub create_only: bool,

    /// Log every batch sub-request at debug level
    #[arg(long, env = "BATCH_DEBUG", default_value = "false")]
    pub batch_debug: bool,

    /// Concurrent batch executions in this process
    #[arg(long, env = "MAX_CONCURRENT_BATCHES", default_value = "4")]
    pub max_concurrent_batches: usize,

    /// Attempts per batch
    #[arg(long, env = "BATCH_MAX_ATTEMPTS", default_value = "5")]
    pub batch_max_attempts: u32,

    /// First backoff after a throttled or failed attempt, in seconds
    #[arg(long, env = "BATCH_INITIAL_BACKOFF_SECONDS", default_value = "1")]
    pub batch_initial_backoff_seconds: u64,

    /// Backoff cap in seconds
    #[arg(long, env = "BATCH_MAX_BACKOFF_SECONDS", default_value = "30")]
    pub batch_max_backoff_seconds: u64,

    /// Distributed key holding the circuit breaker state
    #[arg(long, env = "CIRCUIT_BREAKER_KEY", default_value = "dataverse:circuitbreaker")]
    pub circuit_breaker_key: String,

    /// Breaker pause when no Retry-After is given, in seconds
    #[arg(long, env = "CIRCUIT_BREAKER_MIN_PAUSE_SECONDS", default_value = "5")]
    pub circuit_breaker_min_pause_seconds: u64,

    /// Upper bound for the fallback breaker pause, in seconds
    #[arg(long, env = "CIRCUIT_BREAKER_MAX_PAUSE_SECONDS", default_value = "60")]
    pub circuit_breaker_max_pause_seconds: u64,

    /// Redis URL for the shared cache tier and breaker
    /// Without it an in-process store is used and the breaker is not shared
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Prefix applied to every Redis key
    #[arg(long, env = "REDIS_KEY_PREFIX")]
    pub redis_key_prefix: Option<String>,

    /// Identifier cache retention in days
    #[arg(long, env = "CACHE_TTL_DAYS", default_value = "90")]
    pub cache_ttl_days: u64,

    /// Local identifier cache entry limit
    #[arg(long, env = "LOCAL_CACHE_MAX_ENTRIES", default_value = "100000")]
    pub local_cache_max_entries: usize,

    /// Local identifier cache purge interval in seconds
    #[arg(long, env = "CACHE_CLEANUP_INTERVAL_SECONDS", default_value = "600")]
    pub cache_cleanup_interval_seconds: u64,

    /// Authentication
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// Bearer token source: a fixed token or client credentials
#[derive(Parser, Debug, Clone)]
pub struct AuthArgs {
    /// Fixed bearer token (takes precedence over client credentials)
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Directory tenant for the client-credentials grant
    #[arg(long, env = "TENANT_ID")]
    pub tenant_id: Option<String>,

    /// Application (client) id
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// Application secret
    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Token authority base URL
    #[arg(long, env = "AUTHORITY_URL", default_value = "https://login.microsoftonline.com")]
    pub authority_url: String,
}

// ============================================================================
// Validated configuration
// ============================================================================

/// Remote store endpoint settings
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub resource_url: String,
    pub api_version: String,
    pub request_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(resource_url: impl Into<String>) -> Self {
        Self {
            resource_url: resource_url.into(),
            api_version: "v9.2".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }

    /// `{resource}/api/data/{version}`
    pub fn api_base(&self) -> String {
        crate::batch::api_base(&self.resource_url, &self.api_version)
    }
}

/// Batch shaping settings
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Sub-requests per batch
    pub max_operations: usize,
    /// Alternate keys per collection
    pub routing: CollectionRouting,
    pub mode: WriteMode,
    /// Log every sub-request
    pub debug: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_operations: MAX_BATCH_SIZE,
            routing: CollectionRouting::new(),
            mode: WriteMode::Upsert,
            debug: false,
        }
    }
}

/// Everything the runtime needs, validated once at startup
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub remote: RemoteConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub gate: GateConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
}

impl SyncConfig {
    /// Defaults for everything but the endpoint and credentials
    pub fn new(resource_url: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            remote: RemoteConfig::new(resource_url),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            gate: GateConfig::default(),
            cache: CacheConfig::default(),
            auth,
        }
    }
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self.resource_url.as_deref().map(str::trim) {
            None | Some("") => return Err("RESOURCE_URL is required".to_string()),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                return Err(format!("RESOURCE_URL must be an http(s) URL, got '{url}'"));
            }
            _ => {}
        }

        if self.auth.access_token.is_none()
            && (self.auth.tenant_id.is_none()
                || self.auth.client_id.is_none()
                || self.auth.client_secret.is_none())
        {
            return Err(
                "Either ACCESS_TOKEN or TENANT_ID, CLIENT_ID and CLIENT_SECRET are required"
                    .to_string(),
            );
        }

        parse_alternate_keys(&self.alternate_keys)?;

        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("LOG_FORMAT must be 'text' or 'json', got '{}'", self.log_format));
        }

        Ok(())
    }

    /// Validate and convert into the runtime configuration.
    ///
    /// Numeric settings are clamped: batch size to 10..=1000, concurrency,
    /// attempts and backoff seconds to at least 1.
    pub fn to_config(&self) -> Result<SyncConfig> {
        self.validate().map_err(SyncError::Config)?;

        let resource_url = self
            .resource_url
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        let auth = match (&self.auth.access_token, &self.auth.tenant_id, &self.auth.client_id, &self.auth.client_secret) {
            (Some(token), _, _, _) => AuthConfig::Static(token.clone()),
            (None, Some(tenant), Some(client), Some(secret)) => AuthConfig::ClientCredentials(
                ClientCredentials::new(tenant, client, secret, resource_url.clone())
                    .with_authority(self.auth.authority_url.clone()),
            ),
            _ => return Err(SyncError::Config("no credentials configured".to_string())),
        };

        let initial_backoff = Duration::from_secs(self.batch_initial_backoff_seconds.max(1));
        let max_backoff = Duration::from_secs(self.batch_max_backoff_seconds.max(1)).max(initial_backoff);

        Ok(SyncConfig {
            remote: RemoteConfig {
                resource_url,
                api_version: self.api_version.clone(),
                request_timeout: Duration::from_secs(self.request_timeout_seconds.max(1)),
            },
            batch: BatchConfig {
                max_operations: self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
                routing: parse_alternate_keys(&self.alternate_keys).map_err(SyncError::Config)?,
                mode: if self.create_only {
                    WriteMode::CreateOnly
                } else {
                    WriteMode::Upsert
                },
                debug: self.batch_debug,
            },
            retry: RetryConfig {
                max_attempts: self.batch_max_attempts.max(1),
                initial_backoff,
                max_backoff,
                ..RetryConfig::default()
            },
            breaker: BreakerConfig {
                key: self.circuit_breaker_key.clone(),
                min_pause: Duration::from_secs(self.circuit_breaker_min_pause_seconds),
                max_pause: Duration::from_secs(self.circuit_breaker_max_pause_seconds),
            },
            gate: GateConfig {
                max_concurrent_batches: self.max_concurrent_batches.max(1),
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(self.cache_ttl_days.max(1) * 24 * 60 * 60),
                local_max_entries: self.local_cache_max_entries.max(1),
                cleanup_interval: Duration::from_secs(self.cache_cleanup_interval_seconds.max(1)),
                redis_url: self.redis_url.clone().filter(|u| !u.trim().is_empty()),
                key_prefix: self.redis_key_prefix.clone(),
            },
            auth,
        })
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

/// Parse `collection=field` entries
fn parse_alternate_keys(entries: &[String]) -> std::result::Result<CollectionRouting, String> {
    let mut routing = CollectionRouting::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let (collection, field) = entry
            .split_once('=')
            .map(|(c, f)| (c.trim(), f.trim()))
            .filter(|(c, f)| !c.is_empty() && !f.is_empty())
            .ok_or_else(|| format!("ALTERNATE_KEYS entry '{entry}' must be collection=field"))?;
        routing = routing.with_alternate_key(collection, field);
    }
    Ok(routing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["crm-sync"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let args = parse(&[
            "--resource-url",
            "https://org.crm.dynamics.com",
            "--access-token",
            "t",
        ]);
        let config = args.to_config().unwrap();

        assert_eq!(config.remote.api_base(), "https://org.crm.dynamics.com/api/data/v9.2");
        assert_eq!(config.batch.max_operations, 1000);
        assert_eq!(config.gate.max_concurrent_batches, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.retry.max_backoff, Duration::from_secs(30));
        assert_eq!(config.breaker.key, "dataverse:circuitbreaker");
        assert_eq!(config.cache.ttl, Duration::from_secs(90 * 24 * 60 * 60));
        assert!(config.cache.redis_url.is_none());
        assert!(matches!(config.auth, AuthConfig::Static(_)));
    }

    #[test]
    fn test_clamps() {
        let args = parse(&[
            "--resource-url",
            "https://org.crm.dynamics.com",
            "--access-token",
            "t",
            "--batch-size",
            "3",
            "--max-concurrent-batches",
            "0",
            "--batch-max-attempts",
            "0",
            "--batch-initial-backoff-seconds",
            "0",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.batch.max_operations, MIN_BATCH_SIZE);
        assert_eq!(config.gate.max_concurrent_batches, 1);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.initial_backoff, Duration::from_secs(1));

        let big = parse(&[
            "--resource-url",
            "https://org.crm.dynamics.com",
            "--access-token",
            "t",
            "--batch-size",
            "5000",
        ]);
        assert_eq!(big.to_config().unwrap().batch.max_operations, MAX_BATCH_SIZE);
    }

    #[test]
    fn test_alternate_keys_parsed() {
        let args = parse(&[
            "--resource-url",
            "https://org.crm.dynamics.com",
            "--access-token",
            "t",
            "--alternate-keys",
            "msdyn_workorders=dc_name, msdyn_customerassets = dc_idpanel",
            "--create-only",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.batch.routing.alternate_key("msdyn_workorders"), Some("dc_name"));
        assert_eq!(
            config.batch.routing.alternate_key("msdyn_customerassets"),
            Some("dc_idpanel")
        );
        assert_eq!(config.batch.mode, WriteMode::CreateOnly);
    }

    #[test]
    fn test_validation_errors() {
        let missing_url = parse(&["--access-token", "t"]);
        assert!(missing_url.validate().unwrap_err().contains("RESOURCE_URL"));

        let missing_creds = parse(&["--resource-url", "https://org.crm.dynamics.com", "--tenant-id", "x"]);
        assert!(missing_creds.validate().is_err());

        let bad_key = parse(&[
            "--resource-url",
            "https://org.crm.dynamics.com",
            "--access-token",
            "t",
            "--alternate-keys",
            "accounts",
        ]);
        assert!(matches!(bad_key.to_config(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_client_credentials_config() {
        let args = parse(&[
            "--resource-url",
            "https://org.crm.dynamics.com/",
            "--tenant-id",
            "tenant",
            "--client-id",
            "client",
            "--client-secret",
            "secret",
        ]);
        match args.to_config().unwrap().auth {
            AuthConfig::ClientCredentials(creds) => {
                assert_eq!(creds.tenant_id, "tenant");
                assert_eq!(creds.resource_url, "https://org.crm.dynamics.com/");
            }
            other => panic!("unexpected auth: {other:?}"),
        }
    }
}
