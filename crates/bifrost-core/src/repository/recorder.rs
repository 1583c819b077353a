//! Write façade over the execution repository.
//!
//! Applies the inline-size rule before anything reaches the record store:
//! logs and captured variables always spill to blobs, results spill once
//! their serialized form exceeds 1 KiB. Every successful write fans out the
//! matching real-time events.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use bifrost_workflow::execution::{ResultKind, WorkerResult, WorkflowExecution};
use bifrost_workflow::log::LogEntry;
use bifrost_workflow::status::ExecutionStatus;

use crate::broadcast::{Broadcaster, ExecutionUpdate, HistoryUpdate};
use crate::repository::executions::{ExecutionPatch, ExecutionRepository};
use crate::storage::{BlobStore, StorageError};

/// Serialized results larger than this go to the blob store.
pub const BLOB_THRESHOLD_BYTES: usize = 1024;

fn logs_path(execution_id: Uuid) -> String {
    format!("{execution_id}/logs.json")
}

fn variables_path(execution_id: Uuid) -> String {
    format!("{execution_id}/variables.json")
}

fn snapshot_path(execution_id: Uuid) -> String {
    format!("{execution_id}/snapshot.json")
}

fn result_path(execution_id: Uuid, kind: ResultKind) -> String {
    format!("{execution_id}/result.{}", kind.extension())
}

/// Terminal-commit payload assembled by the consumer or dispatcher.
#[derive(Debug, Default, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub logs: Vec<LogEntry>,
    pub variables: Option<BTreeMap<String, Value>>,
    pub snapshots: Vec<Value>,
    pub metrics: Option<bifrost_workflow::execution::ResourceMetrics>,
}

impl ExecutionOutcome {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn from_worker_result(result: WorkerResult) -> Self {
        Self {
            status: result.status,
            result: result.result,
            error_message: result.error_message,
            error_type: result.error_type,
            duration_ms: Some(result.duration_ms),
            logs: result.logs,
            variables: result.variables,
            snapshots: Vec::new(),
            metrics: result.metrics,
        }
    }
}

/// Recorder combining the repository, blob spill and broadcasting.
#[derive(Clone)]
pub struct ExecutionRecorder {
    repository: ExecutionRepository,
    blobs: Arc<dyn BlobStore>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl ExecutionRecorder {
    pub fn new(
        repository: ExecutionRepository,
        blobs: Arc<dyn BlobStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            repository,
            blobs,
            broadcaster,
        }
    }

    pub fn repository(&self) -> &ExecutionRepository {
        &self.repository
    }

    /// Create the initial record and announce it to the history group.
    pub async fn create(&self, execution: &WorkflowExecution) -> Result<(), StorageError> {
        self.repository.create(execution).await?;
        self.broadcast_history(execution).await;
        Ok(())
    }

    /// Persist an outcome: spill oversized fields, update the record and
    /// its indexes, then broadcast to both groups.
    pub async fn update(
        &self,
        execution_id: Uuid,
        scope: Option<&str>,
        outcome: ExecutionOutcome,
    ) -> Result<WorkflowExecution, StorageError> {
        let mut patch = ExecutionPatch {
            status: outcome.status,
            error_message: outcome.error_message,
            error_type: outcome.error_type,
            duration_ms: outcome.duration_ms,
            metrics: outcome.metrics,
            ..Default::default()
        };

        if let Some(result) = outcome.result {
            let kind = ResultKind::detect(&result);
            let serialized = match &result {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other)?,
            };
            if serialized.len() > BLOB_THRESHOLD_BYTES {
                self.blobs
                    .put(
                        &result_path(execution_id, kind),
                        serialized.as_bytes(),
                        content_type(kind),
                    )
                    .await?;
                patch.result_in_blob = true;
                patch.result_type = Some(kind);
                info!(
                    execution_id = %execution_id,
                    bytes = serialized.len(),
                    "Spilled large result to blob storage"
                );
            } else {
                patch.result = Some(result);
                patch.result_type = Some(kind);
            }
        }

        if !outcome.logs.is_empty() {
            let payload = serde_json::to_vec(&outcome.logs)?;
            self.blobs
                .put(&logs_path(execution_id), &payload, "application/json")
                .await?;
        }

        if let Some(variables) = &outcome.variables {
            if !variables.is_empty() {
                let payload = serde_json::to_vec(variables)?;
                self.blobs
                    .put(&variables_path(execution_id), &payload, "application/json")
                    .await?;
            }
        }

        if !outcome.snapshots.is_empty() {
            let payload = serde_json::to_vec(&outcome.snapshots)?;
            self.blobs
                .put(&snapshot_path(execution_id), &payload, "application/json")
                .await?;
        }

        let execution = self.repository.update(execution_id, scope, patch).await?;

        self.broadcaster
            .broadcast_execution_update(ExecutionUpdate::new(
                execution_id,
                execution.status,
                None,
            ))
            .await;
        self.broadcast_history(&execution).await;

        Ok(execution)
    }

    async fn broadcast_history(&self, execution: &WorkflowExecution) {
        self.broadcaster
            .broadcast_history_update(HistoryUpdate {
                scope: execution.scope().to_string(),
                execution_id: execution.execution_id,
                workflow_name: execution.workflow_name.clone(),
                status: execution.status,
                executed_by: execution.executed_by.clone(),
                executed_by_name: execution.executed_by_name.clone(),
                started_at: execution.started_at,
                completed_at: execution.completed_at,
                duration_ms: execution.duration_ms,
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Read a spilled result back, trying the known suffixes in order.
    pub async fn fetch_result(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<(ResultKind, Vec<u8>)>, StorageError> {
        for kind in [ResultKind::Json, ResultKind::Html, ResultKind::Text] {
            if let Some(content) = self.blobs.get(&result_path(execution_id, kind)).await? {
                return Ok(Some((kind, content)));
            }
        }
        Ok(None)
    }

    /// Read spilled logs back.
    pub async fn fetch_logs(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Vec<LogEntry>>, StorageError> {
        match self.blobs.get(&logs_path(execution_id)).await? {
            Some(content) => match serde_json::from_slice(&content) {
                Ok(logs) => Ok(Some(logs)),
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Corrupt logs blob");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

fn content_type(kind: ResultKind) -> &'static str {
    match kind {
        ResultKind::Json => "application/json",
        ResultKind::Html => "text/html",
        ResultKind::Text => "text/plain",
    }
}
