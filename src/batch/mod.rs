//! Batch envelope: request building, transport and response interpretation
//!
//! ```text
//! Batch ──► BatchRequestBuilder ──► BatchRequest (multipart/mixed)
//!                                        │
//!                                        ▼
//!                                  BatchTransport ──► RawBatchResponse
//!                                                          │
//!                                                          ▼
//!                                  interpret() ──► BatchExecutionResult
//! ```
//!
//! [`BatchExecutor`] ties the three together for one attempt. Retrying,
//! throttling and concurrency limits live in [`crate::resilience`].

pub mod builder;
pub mod executor;
pub mod interpreter;
pub mod transport;

pub use self::builder::{BatchRequest, BatchRequestBuilder};
pub use self::executor::BatchExecutor;
pub use self::interpreter::{interpret, parse_retry_after};
pub use self::transport::{BatchTransport, HttpBatchTransport};

/// Top-level HTTP response of a batch submission, before interpretation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatchResponse {
    pub status: u16,
    /// Raw `Retry-After` header value, if any
    pub retry_after: Option<String>,
    pub body: String,
}

impl RawBatchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

/// `{resource}/api/data/{version}` with no trailing slash
pub fn api_base(resource_url: &str, api_version: &str) -> String {
    format!(
        "{}/api/data/{}",
        resource_url.trim_end_matches('/'),
        api_version.trim_matches('/')
    )
}
