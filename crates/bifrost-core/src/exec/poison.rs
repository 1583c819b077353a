//! Dead-letter (poison) queue processor.
//!
//! Messages that failed delivery repeatedly land on the poison queue; each
//! one marks its execution Failed with a `PoisonQueueFailure` error naming
//! the dequeue count, then leaves the queue for good. Processing runs both
//! on arrival and on a fixed timer sweep to cover missed arrivals.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use bifrost_workflow::status::ExecutionStatus;

use crate::error::EngineError;
use crate::repository::{ExecutionOutcome, ExecutionRecorder};
use crate::storage::{QueueDelivery, WorkQueue};

/// Batch cap per sweep.
pub const POISON_BATCH_LIMIT: usize = 32;

/// Timer sweep period.
pub const POISON_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Processor over the poison queue.
pub struct PoisonQueueProcessor {
    queue: Arc<dyn WorkQueue>,
    recorder: ExecutionRecorder,
}

impl PoisonQueueProcessor {
    pub fn new(queue: Arc<dyn WorkQueue>, recorder: ExecutionRecorder) -> Self {
        Self { queue, recorder }
    }

    /// Mark one poisoned execution failed. These messages are never
    /// retried; they represent permanent failures.
    pub async fn process_delivery(&self, delivery: &QueueDelivery) -> Result<(), EngineError> {
        let message = &delivery.message;
        error!(
            execution_id = %message.execution_id,
            workflow = %message.workflow_name,
            dequeue_count = delivery.dequeue_count,
            "Poison queue message"
        );

        let mut outcome = ExecutionOutcome::status(ExecutionStatus::Failed);
        outcome.error_message = Some(format!(
            "Execution failed after {} attempts and was moved to the poison queue. \
             This indicates a persistent failure that requires investigation.",
            delivery.dequeue_count
        ));
        outcome.error_type = Some("PoisonQueueFailure".to_string());
        self.recorder
            .update(
                message.execution_id,
                message.org_id.as_deref(),
                outcome,
            )
            .await?;

        warn!(
            execution_id = %message.execution_id,
            "Marked execution failed (poison queue)"
        );
        Ok(())
    }

    /// One sweep: drain up to [`POISON_BATCH_LIMIT`] messages. Messages are
    /// acknowledged even when marking fails, to keep a broken record from
    /// wedging the queue.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let deliveries = self.queue.receive_batch(POISON_BATCH_LIMIT).await?;
        let total = deliveries.len();
        let mut processed = 0;

        for delivery in &deliveries {
            match self.process_delivery(delivery).await {
                Ok(()) => processed += 1,
                Err(e) => error!(
                    execution_id = %delivery.message.execution_id,
                    error = %e,
                    "Error processing poison message"
                ),
            }
            self.queue.ack(delivery).await?;
        }

        if total > 0 {
            warn!(processed, total, "Poison queue sweep processed messages");
        } else {
            info!("Poison queue sweep found no messages");
        }
        Ok(processed)
    }

    /// Arrival-driven loop plus nothing else; pair with [`run_timer`] for
    /// the backup sweep.
    pub async fn run(&self) -> Result<(), EngineError> {
        while let Some(delivery) = self.queue.receive().await? {
            if let Err(e) = self.process_delivery(&delivery).await {
                error!(error = %e, "Error processing poison queue message");
            }
            self.queue.ack(&delivery).await?;
        }
        Ok(())
    }

    /// Fixed-interval backup sweep covering arrivals the queue trigger
    /// missed.
    pub async fn run_timer(&self) -> Result<(), EngineError> {
        let mut ticker = tokio::time::interval(POISON_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Poison queue sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NoopBroadcaster;
    use crate::repository::ExecutionRepository;
    use crate::storage::{MemoryBlobStore, MemoryTableStore, MemoryWorkQueue};
    use bifrost_workflow::message::ExecutionMessage;
    use bifrost_workflow::execution::WorkflowExecution;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn recorder() -> ExecutionRecorder {
        ExecutionRecorder::new(
            ExecutionRepository::new(
                Arc::new(MemoryTableStore::new()),
                Arc::new(MemoryTableStore::new()),
            ),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(NoopBroadcaster),
        )
    }

    async fn seed_execution(recorder: &ExecutionRecorder) -> Uuid {
        let execution = WorkflowExecution {
            execution_id: Uuid::new_v4(),
            workflow_name: "flaky".into(),
            org_id: None,
            form_id: None,
            executed_by: "user-1".into(),
            executed_by_name: "User One".into(),
            status: ExecutionStatus::Pending,
            input_data: BTreeMap::new(),
            result: None,
            result_type: None,
            result_in_blob: false,
            error_message: None,
            error_type: None,
            duration_ms: None,
            started_at: Utc::now(),
            completed_at: None,
            metrics: None,
        };
        recorder.create(&execution).await.unwrap();
        execution.execution_id
    }

    fn message(execution_id: Uuid) -> ExecutionMessage {
        ExecutionMessage {
            execution_id,
            workflow_name: "flaky".into(),
            org_id: None,
            user_id: "user-1".into(),
            user_name: "User One".into(),
            user_email: "one@example.com".into(),
            parameters: BTreeMap::new(),
            form_id: None,
            code: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_marks_executions_failed() {
        let recorder = recorder();
        let queue = Arc::new(MemoryWorkQueue::new());
        let execution_id = seed_execution(&recorder).await;
        queue.push_with_count(message(execution_id), 6).await;

        let processor = PoisonQueueProcessor::new(queue.clone(), recorder.clone());
        let processed = processor.sweep().await.unwrap();
        assert_eq!(processed, 1);
        assert!(queue.is_empty().await);

        let record = recorder
            .repository()
            .get(execution_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_type.as_deref(), Some("PoisonQueueFailure"));
        assert!(record
            .error_message
            .unwrap()
            .contains("failed after 6 attempts"));
    }

    #[tokio::test]
    async fn test_sweep_caps_batch_size() {
        let recorder = recorder();
        let queue = Arc::new(MemoryWorkQueue::new());
        for _ in 0..(POISON_BATCH_LIMIT + 5) {
            let id = seed_execution(&recorder).await;
            queue.push_with_count(message(id), 5).await;
        }

        let processor = PoisonQueueProcessor::new(queue.clone(), recorder);
        let processed = processor.sweep().await.unwrap();
        assert_eq!(processed, POISON_BATCH_LIMIT);
        assert_eq!(queue.len().await, 5);
    }
}
