//! Bearer token providers for the remote store
//!
//! The batch transport and the bulk query client ask a [`TokenProvider`] for
//! a token on every call. [`ClientCredentialsProvider`] caches the token and
//! refreshes it shortly before expiry; concurrent refreshes are collapsed
//! into one token request.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// Refresh when less than this much validity remains
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a bearer token valid for at least the next request
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token (tests, local development, externally managed tokens)
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// How the remote store bearer token is obtained
#[derive(Clone)]
pub enum AuthConfig {
    /// Externally managed token
    Static(String),
    /// OAuth2 client-credentials grant
    ClientCredentials(ClientCredentials),
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::Static(_) => f.write_str("Static(<redacted>)"),
            AuthConfig::ClientCredentials(creds) => {
                f.debug_tuple("ClientCredentials").field(creds).finish()
            }
        }
    }
}

/// OAuth2 client-credentials settings
#[derive(Clone)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Resource the token is requested for (`{resource}/.default` scope)
    pub resource_url: String,
    /// Token authority base URL
    pub authority: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("resource_url", &self.resource_url)
            .field("authority", &self.authority)
            .finish()
    }
}

impl ClientCredentials {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        resource_url: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            resource_url: resource_url.into(),
            authority: DEFAULT_AUTHORITY.to_string(),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.tenant_id
        )
    }

    fn scope(&self) -> String {
        format!("{}/.default", self.resource_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN < self.expires_at
    }
}

/// Client-credentials grant with an in-process token cache
pub struct ClientCredentialsProvider {
    credentials: ClientCredentials,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
    /// Serializes refreshes
    refreshing: Mutex<()>,
}

impl ClientCredentialsProvider {
    pub fn new(credentials: ClientCredentials, http: reqwest::Client) -> Self {
        info!(
            tenant = %credentials.tenant_id,
            client_id = %credentials.client_id,
            "Client-credentials token provider created"
        );
        Self {
            credentials,
            http,
            cached: RwLock::new(None),
            refreshing: Mutex::new(()),
        }
    }

    async fn cached_token(&self) -> Option<String> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|t| t.is_fresh())
            .map(|t| t.value.clone())
    }

    async fn request_token(&self) -> Result<CachedToken> {
        let scope = self.credentials.scope();
        let form = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", scope.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let response = self
            .http
            .post(self.credentials.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!(
                "token endpoint returned HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("invalid token response: {e}")))?;

        debug!(expires_in = token.expires_in, "Access token acquired");
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let _guard = self.refreshing.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let fresh = self.request_token().await?;
        let value = fresh.value.clone();
        *self.cached.write().await = Some(fresh);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let provider = StaticToken::new("abc");
        assert_eq!(provider.access_token().await.unwrap(), "abc");
    }

    #[test]
    fn test_token_url_and_scope() {
        let creds = ClientCredentials::new("tenant-1", "client", "secret", "https://org.crm.dynamics.com/");
        assert_eq!(
            creds.token_url(),
            "https://login.microsoftonline.com/tenant-1/oauth2/v2.0/token"
        );
        assert_eq!(creds.scope(), "https://org.crm.dynamics.com/.default");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = ClientCredentials::new("t", "c", "very-secret", "https://org.crm.dynamics.com");
        let rendered = format!("{:?}", AuthConfig::ClientCredentials(creds));
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_token_freshness() {
        let token = CachedToken {
            value: "t".into(),
            expires_at: Instant::now() + Duration::from_secs(120),
        };
        assert!(token.is_fresh());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!token.is_fresh());
    }
}
