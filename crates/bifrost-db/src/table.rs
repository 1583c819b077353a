//! PostgreSQL-backed key-range table store.
//!
//! One SQL table per logical store, keyed `(partition_key, row_key)` with a
//! monotonically increasing `etag` and a jsonb payload. Range scans order
//! by row key, so the repository's reverse-timestamp and prefix schemes
//! work unchanged. The continuation token is the last row key of the
//! previous page.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;

use bifrost_core::storage::{Page, StorageError, TableEntity, TableStore};

use crate::error::DbError;

/// Upper bound for a prefix range scan. Row keys use `[a-z0-9:_-]` plus the
/// uuid alphabet, all below `~`.
fn prefix_upper_bound(prefix: &str) -> String {
    format!("{prefix}~")
}

/// The closed set of tables this store can open. Interpolating a table
/// identifier into SQL is only safe because the name comes from this enum,
/// never from caller-supplied strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableName {
    /// Primary execution records, partitioned by scope.
    Entities,
    /// Index rows (user/workflow/form/status) and id pointers.
    Relationships,
    /// Per-execution log streams.
    ExecutionLogs,
}

impl TableName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Entities => "entities",
            TableName::Relationships => "relationships",
            TableName::ExecutionLogs => "execution_logs",
        }
    }
}

/// A named table in the shared Postgres database.
#[derive(Clone)]
pub struct PgTableStore {
    pool: PgPool,
    table: &'static str,
}

impl PgTableStore {
    /// Open a store over one of the known tables, creating it if needed.
    pub async fn open(pool: PgPool, table: TableName) -> Result<Self, DbError> {
        let table = table.as_str();
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                partition_key TEXT NOT NULL,
                row_key TEXT NOT NULL,
                etag BIGINT NOT NULL DEFAULT 1,
                data JSONB NOT NULL,
                PRIMARY KEY (partition_key, row_key)
            )
            "#
        );
        sqlx::query(&ddl).execute(&pool).await?;
        Ok(Self { pool, table })
    }

    fn entity_from_row(&self, row: &sqlx::postgres::PgRow) -> Result<TableEntity, StorageError> {
        let partition_key: String = row
            .try_get("partition_key")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let row_key: String = row
            .try_get("row_key")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let etag: i64 = row
            .try_get("etag")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let data: Value = row
            .try_get("data")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let data = match data {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        Ok(TableEntity {
            partition_key,
            row_key,
            etag: Some(etag.to_string()),
            data,
        })
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn insert(&self, entity: TableEntity) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {} (partition_key, row_key, data) VALUES ($1, $2, $3)",
            self.table
        );
        sqlx::query(&sql)
            .bind(&entity.partition_key)
            .bind(&entity.row_key)
            .bind(Value::Object(entity.data))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn upsert(&self, entity: TableEntity) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO {} (partition_key, row_key, data) VALUES ($1, $2, $3)
            ON CONFLICT (partition_key, row_key)
            DO UPDATE SET data = EXCLUDED.data, etag = {}.etag + 1
            "#,
            self.table, self.table
        );
        sqlx::query(&sql)
            .bind(&entity.partition_key)
            .bind(&entity.row_key)
            .bind(Value::Object(entity.data))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, partition: &str, row: &str) -> Result<Option<TableEntity>, StorageError> {
        let sql = format!(
            "SELECT partition_key, row_key, etag, data FROM {} WHERE partition_key = $1 AND row_key = $2",
            self.table
        );
        let found = sqlx::query(&sql)
            .bind(partition)
            .bind(row)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match found {
            Some(pg_row) => Ok(Some(self.entity_from_row(&pg_row)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, entity: TableEntity) -> Result<(), StorageError> {
        let expected_etag: Option<i64> = entity.etag.as_deref().and_then(|e| e.parse().ok());

        let result = match expected_etag {
            Some(expected) => {
                let sql = format!(
                    r#"
                    UPDATE {} SET data = $3, etag = etag + 1
                    WHERE partition_key = $1 AND row_key = $2 AND etag = $4
                    "#,
                    self.table
                );
                sqlx::query(&sql)
                    .bind(&entity.partition_key)
                    .bind(&entity.row_key)
                    .bind(Value::Object(entity.data.clone()))
                    .bind(expected)
                    .execute(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    r#"
                    UPDATE {} SET data = $3, etag = etag + 1
                    WHERE partition_key = $1 AND row_key = $2
                    "#,
                    self.table
                );
                sqlx::query(&sql)
                    .bind(&entity.partition_key)
                    .bind(&entity.row_key)
                    .bind(Value::Object(entity.data.clone()))
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Distinguish a concurrent writer from a missing row.
            let exists = self
                .get(&entity.partition_key, &entity.row_key)
                .await?
                .is_some();
            if exists {
                return Err(StorageError::Concurrency {
                    partition: entity.partition_key,
                    row: entity.row_key,
                });
            }
            return Err(StorageError::NotFound {
                partition: entity.partition_key,
                row: entity.row_key,
            });
        }
        Ok(())
    }

    async fn delete(&self, partition: &str, row: &str) -> Result<bool, StorageError> {
        let sql = format!(
            "DELETE FROM {} WHERE partition_key = $1 AND row_key = $2",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(partition)
            .bind(row)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_prefix(
        &self,
        partition: &str,
        prefix: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<Page, StorageError> {
        let lower = continuation
            .map(String::from)
            .unwrap_or_else(|| prefix.to_string());
        let strict = continuation.is_some();
        let sql = format!(
            r#"
            SELECT partition_key, row_key, etag, data FROM {}
            WHERE partition_key = $1 AND row_key {} $2 AND row_key < $3
            ORDER BY row_key
            LIMIT $4
            "#,
            self.table,
            if strict { ">" } else { ">=" }
        );
        let rows = sqlx::query(&sql)
            .bind(partition)
            .bind(&lower)
            .bind(prefix_upper_bound(prefix))
            .bind((limit + 1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut entities = Vec::with_capacity(rows.len().min(limit));
        for row in rows.iter().take(limit) {
            entities.push(self.entity_from_row(row)?);
        }
        let continuation = if rows.len() > limit {
            entities.last().map(|e| e.row_key.clone())
        } else {
            None
        };
        Ok(Page {
            entities,
            continuation,
        })
    }

    async fn query_greater_than(
        &self,
        partition: &str,
        row_key: &str,
        limit: usize,
    ) -> Result<Vec<TableEntity>, StorageError> {
        let sql = format!(
            r#"
            SELECT partition_key, row_key, etag, data FROM {}
            WHERE partition_key = $1 AND row_key > $2
            ORDER BY row_key
            LIMIT $3
            "#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(partition)
            .bind(row_key)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(|row| self.entity_from_row(row)).collect()
    }

    async fn query_partition(
        &self,
        partition: &str,
        limit: usize,
    ) -> Result<Vec<TableEntity>, StorageError> {
        self.query_greater_than(partition, "", limit).await
    }
}
