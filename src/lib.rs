//! crm-sync - resilient batch execution core for a CRM Web API
//!
//! Writes are grouped into OData `$batch` envelopes (one atomic changeset
//! per batch) and submitted under a process-local concurrency bound, a
//! cross-instance circuit breaker and an exponential retry policy.
//!
//! ## Components
//!
//! - **Identifier resolution**: business key to internal id, two cache tiers
//!   plus one bulk query for misses ([`resolve`])
//! - **Batch request builder / response interpreter** ([`batch`])
//! - **Concurrency gate, circuit breaker, retry policy** ([`resilience`])
//! - **Processor**: partition, submit and report ([`processor`])

pub mod auth;
pub mod batch;
pub mod config;
pub mod error;
pub mod kv;
pub mod logging;
pub mod operation;
pub mod processor;
pub mod resilience;
pub mod resolve;
pub mod runtime;

pub use config::{Args, SyncConfig};
pub use error::{Result, SyncError};
pub use operation::{Batch, BatchExecutionResult, CollectionRouting, Operation, OperationGroup, WriteMode};
pub use processor::{BatchProcessor, ProcessReport, ProcessRequest};
pub use runtime::SyncRuntime;
