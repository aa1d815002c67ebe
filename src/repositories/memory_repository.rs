use crate::idempotency::IdempotencyRecord;
use crate::observability::get_metrics;
use crate::repositories::{Repository, RepositoryResult};
use async_trait::async_trait;
use moka::future::Cache;
use moka::notification::RemovalCause;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bounded in-process repository with size-based eviction and optional TTL.
///
/// **For demos and tests only.** Nothing survives a restart, nothing is
/// shared between processes, and entries disappear as soon as capacity runs
/// out.
pub struct InMemoryRepository {
    cache: Cache<String, IdempotencyRecord>,
    capacity: u64,
    ttl: Option<Duration>,
    evictions: Arc<AtomicU64>,
}

impl InMemoryRepository {
    pub fn new(capacity: u64, ttl: Option<Duration>) -> Self {
        tracing::warn!(
            capacity,
            ttl_ms = ttl.map(|t| t.as_millis() as u64),
            "CAUTION: in-memory idempotency repository is for demo purposes only, do not use in production"
        );

        let capacity = capacity.max(1);
        let evictions = Arc::new(AtomicU64::new(0));
        let listener_evictions = Arc::clone(&evictions);

        let mut builder = Cache::<String, IdempotencyRecord>::builder()
            .max_capacity(capacity)
            .eviction_listener(move |key: Arc<String>, _record: IdempotencyRecord, cause: RemovalCause| {
                if cause.was_evicted() {
                    listener_evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, cause = ?cause, "Evicted in-memory idempotency record");
                }
            });
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            cache: builder.build(),
            capacity,
            ttl,
            evictions,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Approximate entry count. Call [`sync`](Self::sync) first for an exact figure.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries dropped for capacity or expiry.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Applies pending evictions and expirations and refreshes the entry gauge.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
        get_metrics().set_memory_entries(self.cache.entry_count());
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.sync().await;
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        Ok(self.cache.get(key).await)
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> RepositoryResult<IdempotencyRecord> {
        self.cache.insert(key.to_string(), record.clone()).await;
        get_metrics().set_memory_entries(self.cache.entry_count());
        Ok(record)
    }

    async fn delete(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        let removed = self.cache.remove(key).await;
        get_metrics().set_memory_entries(self.cache.entry_count());
        Ok(removed)
    }
}
