//! Storage abstractions and in-memory backends.
//!
//! Traits here are the seams the production backends implement (Postgres
//! table store, Redis handshake, RabbitMQ queue, filesystem blobs in
//! `bifrost-db`). The in-memory implementations back tests and local
//! development.

use async_trait::async_trait;
use bifrost_workflow::ExecutionMessage;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Entity not found: {partition}/{row}")]
    NotFound { partition: String, row: String },

    /// Optimistic-concurrency conflict (ETag mismatch). Never retried by
    /// the repository layer; callers decide.
    #[error("Concurrency conflict on {partition}/{row}")]
    Concurrency { partition: String, row: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

// =============================================================================
// Key-range table store
// =============================================================================

/// One row in a key-range table store.
#[derive(Debug, Clone)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    /// ETag of the version this entity was read at; `None` for new rows.
    pub etag: Option<String>,
    pub data: Map<String, Value>,
}

impl TableEntity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            data,
        }
    }
}

/// One page of a range query plus the continuation token for the next page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entities: Vec<TableEntity>,
    pub continuation: Option<String>,
}

/// Minimal key-range table contract: point reads/writes plus ordered
/// row-key range scans within a partition. No secondary filters; all list
/// access patterns are encoded in row-key prefixes.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Insert a new row. Fails if the row already exists.
    async fn insert(&self, entity: TableEntity) -> Result<(), StorageError>;

    /// Insert or replace a row unconditionally.
    async fn upsert(&self, entity: TableEntity) -> Result<(), StorageError>;

    async fn get(&self, partition: &str, row: &str) -> Result<Option<TableEntity>, StorageError>;

    /// Replace an existing row. When the entity carries an ETag the write
    /// fails with [`StorageError::Concurrency`] if the row changed since it
    /// was read.
    async fn update(&self, entity: TableEntity) -> Result<(), StorageError>;

    async fn delete(&self, partition: &str, row: &str) -> Result<bool, StorageError>;

    /// Ordered scan of rows whose key starts with `prefix`. `continuation`
    /// is the opaque token from a previous page.
    async fn query_prefix(
        &self,
        partition: &str,
        prefix: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<Page, StorageError>;

    /// Ordered scan of rows with key strictly greater than `row_key`.
    async fn query_greater_than(
        &self,
        partition: &str,
        row_key: &str,
        limit: usize,
    ) -> Result<Vec<TableEntity>, StorageError>;

    /// All rows of a partition in key order, up to `limit`.
    async fn query_partition(
        &self,
        partition: &str,
        limit: usize,
    ) -> Result<Vec<TableEntity>, StorageError>;
}

/// In-memory table store over an ordered map.
#[derive(Default)]
pub struct MemoryTableStore {
    rows: RwLock<BTreeMap<(String, String), (u64, Map<String, Value>)>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn insert(&self, entity: TableEntity) -> Result<(), StorageError> {
        let mut rows = self.rows.write().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if rows.contains_key(&key) {
            return Err(StorageError::Backend(format!(
                "Row already exists: {}/{}",
                entity.partition_key, entity.row_key
            )));
        }
        rows.insert(key, (1, entity.data));
        Ok(())
    }

    async fn upsert(&self, entity: TableEntity) -> Result<(), StorageError> {
        let mut rows = self.rows.write().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let next_etag = rows.get(&key).map(|(etag, _)| etag + 1).unwrap_or(1);
        rows.insert(key, (next_etag, entity.data));
        Ok(())
    }

    async fn get(&self, partition: &str, row: &str) -> Result<Option<TableEntity>, StorageError> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&(partition.to_string(), row.to_string()))
            .map(|(etag, data)| TableEntity {
                partition_key: partition.to_string(),
                row_key: row.to_string(),
                etag: Some(etag.to_string()),
                data: data.clone(),
            }))
    }

    async fn update(&self, entity: TableEntity) -> Result<(), StorageError> {
        let mut rows = self.rows.write().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let current = rows.get(&key).ok_or_else(|| StorageError::NotFound {
            partition: entity.partition_key.clone(),
            row: entity.row_key.clone(),
        })?;
        if let Some(expected) = &entity.etag {
            if *expected != current.0.to_string() {
                return Err(StorageError::Concurrency {
                    partition: entity.partition_key.clone(),
                    row: entity.row_key.clone(),
                });
            }
        }
        let next_etag = current.0 + 1;
        rows.insert(key, (next_etag, entity.data));
        Ok(())
    }

    async fn delete(&self, partition: &str, row: &str) -> Result<bool, StorageError> {
        let mut rows = self.rows.write().await;
        Ok(rows
            .remove(&(partition.to_string(), row.to_string()))
            .is_some())
    }

    async fn query_prefix(
        &self,
        partition: &str,
        prefix: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<Page, StorageError> {
        let rows = self.rows.read().await;
        let mut entities = Vec::new();
        let mut next_token = None;
        for ((p, r), (etag, data)) in rows.range(
            (partition.to_string(), prefix.to_string())
                ..(partition.to_string(), format!("{prefix}\u{10FFFF}")),
        ) {
            if p != partition || !r.starts_with(prefix) {
                continue;
            }
            if let Some(token) = continuation {
                if r.as_str() <= token {
                    continue;
                }
            }
            if entities.len() == limit {
                next_token = entities
                    .last()
                    .map(|e: &TableEntity| e.row_key.clone());
                break;
            }
            entities.push(TableEntity {
                partition_key: p.clone(),
                row_key: r.clone(),
                etag: Some(etag.to_string()),
                data: data.clone(),
            });
        }
        Ok(Page {
            entities,
            continuation: next_token,
        })
    }

    async fn query_greater_than(
        &self,
        partition: &str,
        row_key: &str,
        limit: usize,
    ) -> Result<Vec<TableEntity>, StorageError> {
        let rows = self.rows.read().await;
        Ok(rows
            .range(
                (partition.to_string(), row_key.to_string())
                    ..(partition.to_string(), "\u{10FFFF}".to_string()),
            )
            .filter(|((p, r), _)| p == partition && r.as_str() > row_key)
            .take(limit)
            .map(|((p, r), (etag, data))| TableEntity {
                partition_key: p.clone(),
                row_key: r.clone(),
                etag: Some(etag.to_string()),
                data: data.clone(),
            })
            .collect())
    }

    async fn query_partition(
        &self,
        partition: &str,
        limit: usize,
    ) -> Result<Vec<TableEntity>, StorageError> {
        self.query_greater_than(partition, "", limit).await
    }
}

// =============================================================================
// Blob store
// =============================================================================

/// Object storage for large execution artifacts (logs, variables, spilled
/// results, snapshots).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, content: &[u8], content_type: &str)
        -> Result<(), StorageError>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn delete(&self, path: &str) -> Result<bool, StorageError>;
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        path: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.blobs
            .write()
            .await
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.read().await.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.write().await.remove(path).is_some())
    }
}

// =============================================================================
// Worker handshake store
// =============================================================================

/// TTL-bounded KV used for the pool-to-worker handshake. All entries are
/// per-execution and write-once/read-once (the cancel key is a presence
/// flag).
#[async_trait]
pub trait HandshakeStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError>;
}

/// Handshake key construction.
pub mod handshake_keys {
    use uuid::Uuid;

    pub fn context(execution_id: Uuid) -> String {
        format!("bifrost:exec:{execution_id}:context")
    }

    pub fn result(execution_id: Uuid) -> String {
        format!("bifrost:exec:{execution_id}:result")
    }

    pub fn cancel(execution_id: Uuid) -> String {
        format!("bifrost:exec:{execution_id}:cancel")
    }

    pub fn all(execution_id: Uuid) -> Vec<String> {
        vec![context(execution_id), result(execution_id), cancel(execution_id)]
    }
}

/// In-memory handshake store with TTL expiry.
#[derive(Default)]
pub struct MemoryHandshakeStore {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryHandshakeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandshakeStore for MemoryHandshakeStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

// =============================================================================
// Work queue
// =============================================================================

/// A message pulled off the queue, carrying its delivery count for
/// dead-letter reporting and an acknowledgement tag.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub message: ExecutionMessage,
    pub dequeue_count: u32,
    pub tag: u64,
}

/// Broker contract: at-least-once delivery, acknowledged after processing.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: &ExecutionMessage) -> Result<(), StorageError>;

    /// Next delivery, or `None` when the queue is drained/closed.
    async fn receive(&self) -> Result<Option<QueueDelivery>, StorageError>;

    /// Up to `max` deliveries without waiting (dead-letter sweeps).
    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueDelivery>, StorageError>;

    async fn ack(&self, delivery: &QueueDelivery) -> Result<(), StorageError>;
}

/// In-memory queue for tests and local development.
#[derive(Default)]
pub struct MemoryWorkQueue {
    messages: RwLock<VecDeque<(ExecutionMessage, u32)>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enqueue a message with an elevated dequeue count, simulating
    /// broker redelivery in tests.
    pub async fn push_with_count(&self, message: ExecutionMessage, dequeue_count: u32) {
        self.messages
            .write()
            .await
            .push_back((message, dequeue_count));
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, message: &ExecutionMessage) -> Result<(), StorageError> {
        self.messages
            .write()
            .await
            .push_back((message.clone(), 1));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<QueueDelivery>, StorageError> {
        Ok(self
            .messages
            .write()
            .await
            .pop_front()
            .map(|(message, dequeue_count)| QueueDelivery {
                message,
                dequeue_count,
                tag: 0,
            }))
    }

    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueDelivery>, StorageError> {
        let mut messages = self.messages.write().await;
        let take = max.min(messages.len());
        Ok(messages
            .drain(..take)
            .map(|(message, dequeue_count)| QueueDelivery {
                message,
                dequeue_count,
                tag: 0,
            })
            .collect())
    }

    async fn ack(&self, _delivery: &QueueDelivery) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Convenience alias used across the pipeline.
pub type SharedTableStore = Arc<dyn TableStore>;
