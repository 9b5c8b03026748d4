//! Inbound entry point: submit operation groups through the full pipeline
//!
//! ```text
//! groups ──► partition (≤ max_operations, groups never split)
//!        ──► build every envelope (fails fast on a missing alternate key)
//!        ──► per batch: gate slot ──► retry policy ──► executor
//!        ──► post-write identifier warm-up
//! ```
//!
//! Batches run one after another; the first batch that does not succeed
//! stops processing and is reported to the caller.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::BatchExecutor;
use crate::error::{Result, SyncError};
use crate::operation::{Batch, BatchExecutionResult, CollectionRouting, Operation, OperationGroup, WriteMode};
use crate::resilience::{ConcurrencyGate, RetryPolicy};
use crate::resolve::{IdentifierResolver, LookupRequest};

/// Remote store limit on sub-requests per batch
pub const MAX_OPERATIONS_LIMIT: usize = 1000;

// ============================================================================
// Request / Report
// ============================================================================

/// One unit of inbound work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub groups: Vec<OperationGroup>,
    #[serde(skip)]
    pub mode: WriteMode,
    /// Identifiers to refresh once every batch has succeeded
    #[serde(default)]
    pub warm: Vec<LookupRequest>,
}

impl ProcessRequest {
    /// Each operation is its own group
    pub fn from_operations(operations: Vec<Operation>) -> Self {
        Self::from_groups(operations.into_iter().map(OperationGroup::single).collect())
    }

    pub fn from_groups(groups: Vec<OperationGroup>) -> Self {
        Self {
            groups,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_warm_up(mut self, warm: Vec<LookupRequest>) -> Self {
        self.warm = warm;
        self
    }

    pub fn operation_count(&self) -> usize {
        self.groups.iter().map(OperationGroup::len).sum()
    }
}

/// Final result of one batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// 1-based batch number within the request
    pub batch: usize,
    pub operations: usize,
    pub result: BatchExecutionResult,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    /// Outcomes of the batches that were run, in order
    pub batches: Vec<BatchOutcome>,
    /// Batches planned for the request
    pub planned: usize,
    /// Identifiers refreshed after the write
    pub warmed: usize,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.batches.len() == self.planned && self.batches.iter().all(|b| b.result.is_success())
    }

    /// First batch that did not succeed
    pub fn failure(&self) -> Option<&BatchOutcome> {
        self.batches.iter().find(|b| !b.result.is_success())
    }

    pub fn succeeded_operations(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.result.is_success())
            .map(|b| b.operations)
            .sum()
    }

    /// Turn a failed report into [`SyncError::BatchFailed`]
    pub fn into_result(self) -> Result<Self> {
        match self.failure() {
            Some(failed) => Err(SyncError::BatchFailed {
                throttled: failed.result.is_throttled(),
                message: format!(
                    "batch {} of {}: {}",
                    failed.batch,
                    self.planned,
                    failed.result.error_message().unwrap_or("failed")
                ),
            }),
            None => Ok(self),
        }
    }
}

// ============================================================================
// Partitioning
// ============================================================================

/// Pack groups into batches of at most `max_operations`.
///
/// Group order is kept and a group is never split; a group larger than the
/// limit becomes a batch of its own. Empty groups are dropped.
pub fn partition(groups: Vec<OperationGroup>, max_operations: usize) -> Vec<Batch> {
    let max = max_operations.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<Operation> = Vec::new();

    for group in groups.into_iter().filter(|g| !g.is_empty()) {
        if !current.is_empty() && current.len() + group.len() > max {
            batches.push(Batch::new(std::mem::take(&mut current)));
        }
        current.extend(group.operations);
        if current.len() >= max {
            batches.push(Batch::new(std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        batches.push(Batch::new(current));
    }
    batches
}

// ============================================================================
// Processor
// ============================================================================

pub struct BatchProcessor {
    executor: Arc<BatchExecutor>,
    gate: ConcurrencyGate,
    retry: Arc<RetryPolicy>,
    resolver: Option<Arc<IdentifierResolver>>,
    max_operations: usize,
}

impl BatchProcessor {
    pub fn new(
        executor: Arc<BatchExecutor>,
        gate: ConcurrencyGate,
        retry: Arc<RetryPolicy>,
        max_operations: usize,
    ) -> Self {
        Self {
            executor,
            gate,
            retry,
            resolver: None,
            max_operations: max_operations.clamp(1, MAX_OPERATIONS_LIMIT),
        }
    }

    /// Resolver used for post-write warm-up
    pub fn with_resolver(mut self, resolver: Arc<IdentifierResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn max_operations(&self) -> usize {
        self.max_operations
    }

    /// Submit every group and report the per-batch outcomes.
    ///
    /// Errors are returned for problems raised before or around the remote
    /// call (missing alternate key, cancellation, closed gate). A batch that
    /// the remote store rejects is reported in the [`ProcessReport`].
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(groups = request.groups.len(), operations = request.operation_count(), mode = ?request.mode)
    )]
    pub async fn process(
        &self,
        request: ProcessRequest,
        routing: &CollectionRouting,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport> {
        let ProcessRequest { groups, mode, warm } = request;

        let batches = partition(groups, self.max_operations);
        let prepared = batches
            .iter()
            .map(|batch| self.executor.prepare(batch, routing, mode))
            .collect::<Result<Vec<_>>>()?;

        let mut report = ProcessReport {
            planned: prepared.len(),
            ..ProcessReport::default()
        };
        info!(batches = report.planned, "Processing batches");

        for (index, envelope) in prepared.iter().enumerate() {
            let number = index + 1;

            let _permit = self.gate.acquire().await?;
            debug!(batch = number, operations = envelope.operation_count(), "Batch slot acquired");

            let result = self
                .retry
                .run(cancel, |attempt| {
                    debug!(batch = number, attempt = attempt, "Submitting batch");
                    self.executor.execute(envelope)
                })
                .await?;

            let succeeded = result.is_success();
            report.batches.push(BatchOutcome {
                batch: number,
                operations: envelope.operation_count(),
                result,
            });

            if !succeeded {
                warn!(batch = number, planned = report.planned, "Batch failed, stopping");
                return Ok(report);
            }
        }

        report.warmed = self.warm_up(&warm).await;
        info!(
            batches = report.batches.len(),
            operations = report.succeeded_operations(),
            warmed = report.warmed,
            "All batches succeeded"
        );
        Ok(report)
    }

    /// Refresh identifiers of freshly written records. Failures are logged;
    /// the write has already succeeded.
    async fn warm_up(&self, lookups: &[LookupRequest]) -> usize {
        let Some(resolver) = &self.resolver else {
            return 0;
        };

        let mut warmed = 0;
        for lookup in lookups {
            match resolver.refresh(&lookup.spec, &lookup.keys).await {
                Ok(ids) => warmed += ids.len(),
                Err(e) => warn!(
                    collection = %lookup.spec.collection,
                    error = %e,
                    "Identifier warm-up failed"
                ),
            }
        }
        warmed
    }
}
