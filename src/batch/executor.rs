//! One batch attempt: envelope in, classified result out

use std::sync::Arc;
use tracing::warn;

use super::{interpret, BatchRequest, BatchRequestBuilder, BatchTransport};
use crate::error::Result;
use crate::operation::{Batch, BatchExecutionResult, CollectionRouting, WriteMode};

pub struct BatchExecutor {
    builder: BatchRequestBuilder,
    transport: Arc<dyn BatchTransport>,
}

impl BatchExecutor {
    pub fn new(builder: BatchRequestBuilder, transport: Arc<dyn BatchTransport>) -> Self {
        Self { builder, transport }
    }

    /// Build the envelope once; every attempt resends the same bytes.
    pub fn prepare(
        &self,
        batch: &Batch,
        routing: &CollectionRouting,
        mode: WriteMode,
    ) -> Result<BatchRequest> {
        self.builder.build(batch, routing, mode)
    }

    /// Submit a prepared envelope once.
    ///
    /// An empty envelope succeeds without a network call. Transport errors
    /// are returned as errors so the retry policy can back off.
    pub async fn execute(&self, request: &BatchRequest) -> Result<BatchExecutionResult> {
        if request.operation_count() == 0 {
            return Ok(BatchExecutionResult::success(0));
        }

        let response = self.transport.send(request).await.map_err(|e| {
            warn!(error = %e, "Batch transport failed");
            e
        })?;
        Ok(interpret(&response, request.operation_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RawBatchResponse;
    use crate::operation::Operation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchTransport for CountingTransport {
        async fn send(&self, _request: &BatchRequest) -> Result<RawBatchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawBatchResponse::new(200, "HTTP/1.1 204 No Content\r\n"))
        }
    }

    fn executor() -> (BatchExecutor, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
        });
        let executor = BatchExecutor::new(
            BatchRequestBuilder::new("https://org.crm.dynamics.com/api/data/v9.2"),
            transport.clone(),
        );
        (executor, transport)
    }

    #[tokio::test]
    async fn test_empty_batch_skips_network() {
        let (executor, transport) = executor();
        let request = executor
            .prepare(&Batch::default(), &CollectionRouting::new(), WriteMode::Upsert)
            .unwrap();
        let result = executor.execute(&request).await.unwrap();
        assert!(result.is_success());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_interprets_response() {
        let (executor, transport) = executor();
        let batch = Batch::new(vec![Operation::new("annotations").field("subject", "x")]);
        let request = executor
            .prepare(&batch, &CollectionRouting::new(), WriteMode::Upsert)
            .unwrap();
        let result = executor.execute(&request).await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.success_count(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
