//! Per-execution log pipeline.
//!
//! Sequence numbers are assigned under a lock at emission time, and the
//! log-store write happens synchronously on the emitting task before
//! `emit` returns, so a killed worker never loses a line it already
//! reported. Only the broadcast is backgrounded: entries are enqueued in
//! sequence order to a single dispatch task, so broadcast order equals
//! persisted order equals emission order. The pipeline is scoped to one
//! execution and never intercepts process-global logging, so the
//! persistence path logging through `tracing` cannot re-enter it.

use bifrost_workflow::log::{LogEntry, LogLevel, LogSource};
use bifrost_workflow::status::ExecutionStatus;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::broadcast::{Broadcaster, ExecutionUpdate};
use crate::repository::execution_logs::ExecutionLogRepository;

/// Ordered emitter for one execution's user-visible logs.
pub struct ExecutionLogger {
    execution_id: Uuid,
    default_source: LogSource,
    repository: Option<ExecutionLogRepository>,
    sequence: Mutex<u32>,
    entries: Mutex<Vec<LogEntry>>,
    sender: Mutex<Option<mpsc::UnboundedSender<LogEntry>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionLogger {
    /// Create a pipeline. With a repository every entry is persisted
    /// synchronously, per record, before `emit` returns; without one
    /// (transient executions) entries are only collected. Broadcasts go
    /// through the background dispatch task either way.
    pub fn new(
        execution_id: Uuid,
        default_source: LogSource,
        repository: Option<ExecutionLogRepository>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel::<LogEntry>();
        let dispatcher = tokio::spawn(Self::broadcast_loop(receiver, broadcaster));

        Arc::new(Self {
            execution_id,
            default_source,
            repository,
            sequence: Mutex::new(0),
            entries: Mutex::new(Vec::new()),
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    async fn broadcast_loop(
        mut receiver: mpsc::UnboundedReceiver<LogEntry>,
        broadcaster: Arc<dyn Broadcaster>,
    ) {
        while let Some(entry) = receiver.recv().await {
            broadcaster
                .broadcast_execution_update(ExecutionUpdate::new(
                    entry.execution_id,
                    ExecutionStatus::Running,
                    Some(vec![entry]),
                ))
                .await;
        }
    }

    /// Emit one log line: assign the next sequence under the lock, write
    /// the entry to the log store on this task, then enqueue the broadcast.
    /// Persistence failures are logged and never fail the workflow.
    pub async fn emit(&self, level: LogLevel, message: impl Into<String>, source: LogSource) {
        let entry = {
            let message = message.into();
            let mut sequence = self.sequence.lock();
            *sequence += 1;
            let entry = LogEntry::new(self.execution_id, *sequence, level, message, source);
            self.entries.lock().push(entry.clone());
            entry
        };

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.append_entry(&entry).await {
                warn!(
                    execution_id = %entry.execution_id,
                    error = %e,
                    "Failed to persist execution log"
                );
            }
        }

        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(entry);
        }
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message, self.default_source).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message, self.default_source).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warning, message, self.default_source).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message, self.default_source).await;
    }

    pub async fn traceback(&self, message: impl Into<String>) {
        self.emit(LogLevel::Traceback, message, self.default_source).await;
    }

    pub fn default_source(&self) -> LogSource {
        self.default_source
    }

    /// Close the pipeline: drains the broadcast dispatcher, then returns
    /// the collected entries. Every entry was already persisted by its own
    /// `emit` call.
    pub async fn finish(&self) -> Vec<LogEntry> {
        self.sender.lock().take();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(execution_id = %self.execution_id, error = %e, "Broadcast dispatch task failed");
            }
        }
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{ChannelBroadcaster, NoopBroadcaster};
    use crate::storage::MemoryTableStore;

    #[tokio::test]
    async fn test_sequences_are_contiguous_from_one() {
        let logger = ExecutionLogger::new(
            Uuid::new_v4(),
            LogSource::Workflow,
            None,
            Arc::new(NoopBroadcaster),
        );
        logger.info("a").await;
        logger.warning("b").await;
        logger.error("c").await;
        let entries = logger.finish().await;
        let sequences: Vec<u32> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_entry_is_persisted_before_emit_returns() {
        let table = Arc::new(MemoryTableStore::new());
        let repo = ExecutionLogRepository::new(table);
        let execution_id = Uuid::new_v4();
        let logger = ExecutionLogger::new(
            execution_id,
            LogSource::Workflow,
            Some(repo.clone()),
            Arc::new(NoopBroadcaster),
        );

        // No finish(), no draining: the write happened inside emit itself,
        // so a hard kill after this point cannot lose the line.
        logger.info("durable").await;
        let persisted = repo.get_logs(execution_id, None, 100).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].message, "durable");
    }

    #[tokio::test]
    async fn test_persisted_order_equals_broadcast_order() {
        let table = Arc::new(MemoryTableStore::new());
        let repo = ExecutionLogRepository::new(table);
        let broadcaster = Arc::new(ChannelBroadcaster::default());
        let mut rx = broadcaster.subscribe();

        let execution_id = Uuid::new_v4();
        let logger = ExecutionLogger::new(
            execution_id,
            LogSource::Script,
            Some(repo.clone()),
            broadcaster.clone(),
        );
        for i in 1..=4 {
            logger.info(format!("line {i}")).await;
        }
        logger.finish().await;

        let persisted = repo.get_logs(execution_id, None, 100).await.unwrap();
        assert_eq!(persisted.len(), 4);

        for persisted_entry in &persisted {
            let envelope = rx.recv().await.unwrap();
            let logs = envelope.payload["latestLogs"].as_array().unwrap();
            assert_eq!(
                logs[0]["sequence"].as_u64().unwrap() as u32,
                persisted_entry.sequence
            );
        }
    }

    #[tokio::test]
    async fn test_transient_logger_only_collects() {
        let logger = ExecutionLogger::new(
            Uuid::new_v4(),
            LogSource::Workflow,
            None,
            Arc::new(NoopBroadcaster),
        );
        logger.info("kept in memory").await;
        let entries = logger.finish().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "kept in memory");
    }
}
