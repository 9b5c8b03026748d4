//! Error types for crm-sync
//!
//! One error enum for the whole crate. Classification into transient vs.
//! fatal drives the retry policy: only transient errors are retried.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the batch execution core
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation targets an alternate-key collection without the key value
    #[error("Alternate key '{field}' missing for collection '{collection}'")]
    MissingAlternateKey { collection: String, field: String },

    /// Network failure or unexpected error while talking to the remote store
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bulk lookup query rejected by the remote store
    #[error("Remote query failed with HTTP {status}: {body}")]
    RemoteQuery { status: u16, body: String },

    /// Distributed cache unavailable or returned an error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Token acquisition failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A batch reached a terminal failure
    #[error("Batch failed (throttled={throttled}): {message}")]
    BatchFailed { throttled: bool, message: String },

    /// Caller cancelled the work
    #[error("Operation cancelled")]
    Cancelled,

    /// Concurrency gate was closed while waiting for a slot
    #[error("Concurrency gate closed")]
    GateClosed,
}

impl SyncError {
    /// Whether a retry with backoff may succeed.
    ///
    /// Configuration and payload errors are raised before any network call
    /// and would fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Cache(_) | SyncError::Auth(_) => true,
            SyncError::RemoteQuery { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(err: redis::RedisError) -> Self {
        SyncError::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(SyncError::Cache("down".into()).is_retryable());
        assert!(!SyncError::MissingAlternateKey {
            collection: "accounts".into(),
            field: "name".into(),
        }
        .is_retryable());
        assert!(!SyncError::Config("bad".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(SyncError::RemoteQuery { status: 503, body: String::new() }.is_retryable());
        assert!(!SyncError::RemoteQuery { status: 400, body: String::new() }.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = SyncError::MissingAlternateKey {
            collection: "msdyn_workorders".into(),
            field: "dc_name".into(),
        };
        assert_eq!(
            err.to_string(),
            "Alternate key 'dc_name' missing for collection 'msdyn_workorders'"
        );
    }
}
