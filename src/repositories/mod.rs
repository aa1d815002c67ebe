pub mod memory_repository;
pub mod redis_repository;
pub mod resilient_repository;

pub use memory_repository::InMemoryRepository;
pub use redis_repository::RedisRepository;
pub use resilient_repository::ResilientRepository;

use crate::config::{RepositoryBackend, Settings};
use crate::error::RepositoryError;
use crate::idempotency::IdempotencyRecord;
use async_trait::async_trait;
use std::sync::Arc;

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Key/value store of idempotency records. All operations are single-key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    /// Record stored under `key`, if any.
    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>>;

    /// Stores `record` under `key`, replacing whatever was there.
    async fn put(&self, key: &str, record: IdempotencyRecord) -> RepositoryResult<IdempotencyRecord>;

    /// Removes `key`, returning the record it held.
    async fn delete(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>>;

    /// Checks that the backend answers. In-process backends always do.
    async fn ping(&self) -> RepositoryResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<R: Repository + ?Sized> Repository for Arc<R> {
    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> RepositoryResult<IdempotencyRecord> {
        (**self).put(key, record).await
    }

    async fn delete(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        (**self).delete(key).await
    }

    async fn ping(&self) -> RepositoryResult<()> {
        (**self).ping().await
    }
}

/// Builds the configured backend wrapped in the retry and circuit-breaker layer.
pub fn build_repository(settings: &Settings) -> crate::error::Result<Arc<ResilientRepository>> {
    let backend: Arc<dyn Repository> = match settings.repository.backend {
        RepositoryBackend::Memory => Arc::new(InMemoryRepository::new(
            settings.repository.memory.capacity,
            Some(settings.repository.ttl()),
        )),
        RepositoryBackend::Redis => {
            let client = redis::Client::open(settings.repository.redis.url.as_str())
                .map_err(RepositoryError::from)?;
            Arc::new(RedisRepository::new(
                client,
                settings.idempotency.key_prefix(),
                settings.repository.ttl_ms,
            ))
        }
    };

    tracing::info!(
        backend = ?settings.repository.backend,
        ttl_ms = settings.repository.ttl_ms,
        "Idempotency repository configured"
    );

    Ok(Arc::new(ResilientRepository::new(
        backend,
        settings.resiliency.retry_policy(),
        settings.resiliency.circuit_breaker_config(),
    )))
}
