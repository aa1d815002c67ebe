use crate::error::RepositoryError;
use crate::idempotency::IdempotencyRecord;
use crate::observability::{get_metrics, LatencyTimer};
use crate::repositories::{Repository, RepositoryResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Redis-backed repository; entries are written with a millisecond TTL and evicted server-side.
pub struct RedisRepository {
    client: redis::Client,
    key_prefix: String,
    ttl_ms: u64,
    connection: RwLock<Option<MultiplexedConnection>>,
    connect_attempts: AtomicU64,
}

impl RedisRepository {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            ttl_ms,
            connection: RwLock::new(None),
            connect_attempts: AtomicU64::new(0),
        }
    }

    /// Storage key for a fingerprint: `{namespace}.{service}.{fingerprint}`.
    pub fn key_for(&self, fingerprint: &str) -> String {
        if self.key_prefix.is_empty() {
            fingerprint.to_string()
        } else {
            format!("{}.{}", self.key_prefix, fingerprint)
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Times a connection has been opened or attempted.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Shared connection, opened on first use.
    async fn connection(&self) -> RepositoryResult<MultiplexedConnection> {
        {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(attempt, "Opening Redis connection for idempotency repository");
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RepositoryError::NotConnected(e.to_string()))?;
        *guard = Some(conn.clone());
        tracing::info!("Redis idempotency repository connected");

        Ok(conn)
    }

    /// Drops a broken connection so the next call reconnects.
    async fn observe<T>(&self, operation: &'static str, result: redis::RedisResult<T>) -> RepositoryResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    tracing::warn!(operation, "Redis connection lost, will reconnect: {}", e);
                    *self.connection.write().await = None;
                }
                Err(RepositoryError::Redis(e))
            }
        }
    }
}

#[async_trait]
impl Repository for RedisRepository {
    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let mut conn = self.connection().await?;
        let storage_key = self.key_for(key);

        let result: redis::RedisResult<Option<String>> = conn.get(&storage_key).await;
        get_metrics().record_repository_operation("get", timer.elapsed_ms(), result.is_ok());
        let payload = self.observe("get", result).await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> RepositoryResult<IdempotencyRecord> {
        let timer = LatencyTimer::new();
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.connection().await?;
        let storage_key = self.key_for(key);

        let result = redis::cmd("SET")
            .arg(&storage_key)
            .arg(payload)
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async::<_, ()>(&mut conn)
            .await;
        get_metrics().record_repository_operation("put", timer.elapsed_ms(), result.is_ok());
        self.observe("put", result).await?;

        tracing::debug!(key = %storage_key, ttl_ms = self.ttl_ms, "Stored idempotency record");
        Ok(record)
    }

    async fn delete(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let mut conn = self.connection().await?;
        let storage_key = self.key_for(key);

        let result: redis::RedisResult<(Option<String>, i64)> = redis::pipe()
            .atomic()
            .get(&storage_key)
            .del(&storage_key)
            .query_async(&mut conn)
            .await;
        get_metrics().record_repository_operation("delete", timer.elapsed_ms(), result.is_ok());
        let (previous, _deleted) = self.observe("delete", result).await?;

        match previous {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> RepositoryResult<()> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("PING").query_async::<_, ()>(&mut conn).await;
        self.observe("ping", result).await
    }
}
