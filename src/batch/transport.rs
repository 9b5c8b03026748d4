//! Wire transport for batch envelopes

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{BatchRequest, RawBatchResponse};
use crate::auth::TokenProvider;
use crate::error::Result;

/// Sends one batch envelope and returns the raw response.
///
/// Network failures are errors; any HTTP status is a response.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, request: &BatchRequest) -> Result<RawBatchResponse>;
}

/// `POST {api}/$batch` over reqwest
pub struct HttpBatchTransport {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpBatchTransport {
    /// `api_base` is `{resource}/api/data/{version}`
    pub fn new(http: reqwest::Client, api_base: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            endpoint: format!("{}/$batch", api_base.trim_end_matches('/')),
            tokens,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn send(&self, request: &BatchRequest) -> Result<RawBatchResponse> {
        let token = self.tokens.access_token().await?;

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, request.content_type())
            .header(reqwest::header::ACCEPT, "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .body(request.body().to_string())
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        debug!(
            status = status,
            operations = request.operation_count(),
            body_len = body.len(),
            "Batch response received"
        );

        Ok(RawBatchResponse {
            status,
            retry_after,
            body,
        })
    }
}
