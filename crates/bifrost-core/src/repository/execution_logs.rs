//! Append-only per-execution log stream store.
//!
//! Partition = execution id; row key = `{iso_timestamp}-{sequence:04}` so a
//! plain key-order scan is chronological and stable within one timestamp
//! tick. Entries are never mutated or deleted by the pipeline.

use bifrost_workflow::log::LogEntry;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{StorageError, TableEntity, TableStore};

/// Default cap for unbounded log reads.
const DEFAULT_READ_LIMIT: usize = 1000;

/// Repository over the log table.
#[derive(Clone)]
pub struct ExecutionLogRepository {
    table: Arc<dyn TableStore>,
}

impl ExecutionLogRepository {
    pub fn new(table: Arc<dyn TableStore>) -> Self {
        Self { table }
    }

    /// Persist one pre-sequenced entry. Sequence numbers are assigned by
    /// the emitting pipeline before this call, so persisted order equals
    /// broadcast order.
    pub async fn append_entry(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let data = match serde_json::to_value(entry)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.table
            .upsert(TableEntity::new(
                entry.execution_id.to_string(),
                entry.row_key(),
                data,
            ))
            .await
    }

    /// Logs for an execution, optionally only those with row key strictly
    /// greater than `since` (incremental tail reads).
    pub async fn get_logs(
        &self,
        execution_id: Uuid,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let partition = execution_id.to_string();
        let entities = match since {
            Some(token) => {
                self.table
                    .query_greater_than(&partition, token, limit)
                    .await?
            }
            None => self.table.query_partition(&partition, limit).await?,
        };
        Ok(entities
            .into_iter()
            .filter_map(|entity| serde_json::from_value(Value::Object(entity.data)).ok())
            .collect())
    }

    /// The latest `count` logs, in chronological order.
    pub async fn get_latest(
        &self,
        execution_id: Uuid,
        count: usize,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let mut logs = self
            .get_logs(execution_id, None, DEFAULT_READ_LIMIT.max(count))
            .await?;
        let skip = logs.len().saturating_sub(count);
        Ok(logs.split_off(skip))
    }

    pub async fn count(&self, execution_id: Uuid) -> Result<usize, StorageError> {
        Ok(self
            .get_logs(execution_id, None, DEFAULT_READ_LIMIT)
            .await?
            .len())
    }

    /// Logs filtered by caller visibility: admins see every level,
    /// everyone else loses DEBUG and TRACEBACK.
    pub async fn get_logs_visible(
        &self,
        execution_id: Uuid,
        since: Option<&str>,
        limit: usize,
        is_platform_admin: bool,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let logs = self.get_logs(execution_id, since, limit).await?;
        if is_platform_admin {
            return Ok(logs);
        }
        Ok(logs
            .into_iter()
            .filter(|entry| !entry.level.is_admin_only())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTableStore;
    use bifrost_workflow::log::{LogLevel, LogSource};

    fn repo() -> ExecutionLogRepository {
        ExecutionLogRepository::new(Arc::new(MemoryTableStore::new()))
    }

    async fn append_n(repo: &ExecutionLogRepository, execution_id: Uuid, n: u32) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for i in 1..=n {
            let entry = LogEntry::new(
                execution_id,
                i,
                LogLevel::Info,
                format!("line {i}"),
                LogSource::Workflow,
            );
            repo.append_entry(&entry).await.unwrap();
            entries.push(entry);
        }
        entries
    }

    #[tokio::test]
    async fn test_logs_come_back_in_sequence_order() {
        let repo = repo();
        let id = Uuid::new_v4();
        append_n(&repo, id, 5).await;
        let logs = repo.get_logs(id, None, 100).await.unwrap();
        let sequences: Vec<u32> = logs.iter().map(|l| l.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_since_partitions_the_stream() {
        let repo = repo();
        let id = Uuid::new_v4();
        let entries = append_n(&repo, id, 6).await;
        let pivot = entries[2].row_key();

        let tail = repo.get_logs(id, Some(&pivot), 100).await.unwrap();
        let head = repo.get_logs(id, Some("0"), 100).await.unwrap();

        assert_eq!(tail.len(), 3);
        assert!(tail.iter().all(|l| l.sequence > 3));
        // "0" sorts before any ISO timestamp, so this is the full stream.
        assert_eq!(head.len(), 6);
    }

    #[tokio::test]
    async fn test_latest_returns_chronological_tail() {
        let repo = repo();
        let id = Uuid::new_v4();
        append_n(&repo, id, 10).await;
        let latest = repo.get_latest(id, 3).await.unwrap();
        let sequences: Vec<u32> = latest.iter().map(|l| l.sequence).collect();
        assert_eq!(sequences, vec![8, 9, 10]);
        assert_eq!(repo.count(id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_visibility_filter_hides_admin_levels() {
        let repo = repo();
        let id = Uuid::new_v4();
        for (sequence, level) in [
            (1, LogLevel::Debug),
            (2, LogLevel::Info),
            (3, LogLevel::Error),
            (4, LogLevel::Traceback),
        ] {
            repo.append_entry(&LogEntry::new(id, sequence, level, "line", LogSource::Workflow))
                .await
                .unwrap();
        }

        let admin_view = repo.get_logs_visible(id, None, 100, true).await.unwrap();
        assert_eq!(admin_view.len(), 4);

        let user_view = repo.get_logs_visible(id, None, 100, false).await.unwrap();
        let levels: Vec<LogLevel> = user_view.iter().map(|l| l.level).collect();
        assert_eq!(levels, vec![LogLevel::Info, LogLevel::Error]);
    }

    #[tokio::test]
    async fn test_streams_are_isolated_per_execution() {
        let repo = repo();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        append_n(&repo, a, 2).await;
        append_n(&repo, b, 3).await;
        assert_eq!(repo.count(a).await.unwrap(), 2);
        assert_eq!(repo.count(b).await.unwrap(), 3);
    }
}
