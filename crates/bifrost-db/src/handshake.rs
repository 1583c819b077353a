//! Redis-backed worker handshake store.
//!
//! Holds the `bifrost:exec:{id}:{context|result|cancel}` entries the pool
//! and worker processes exchange. Every entry is written with an explicit
//! TTL; nothing here outlives its execution by more than the safety
//! margin.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

use bifrost_core::storage::{HandshakeStore, StorageError};

use crate::error::DbError;

/// Handshake store over a shared Redis connection.
#[derive(Clone)]
pub struct RedisHandshakeStore {
    connection: ConnectionManager,
}

impl RedisHandshakeStore {
    /// Connect to the Redis instance at `url`.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

fn backend_err(e: redis::RedisError) -> StorageError {
    StorageError::Backend(format!("Redis error: {e}"))
}

#[async_trait]
impl HandshakeStore for RedisHandshakeStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs())
            .arg(value)
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(backend_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut connection = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut connection)
            .await
            .map_err(backend_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut connection = self.connection.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(backend_err)?;
        Ok(count > 0)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<_, ()>(&mut connection)
            .await
            .map_err(backend_err)
    }
}
