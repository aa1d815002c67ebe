#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idempotency_receiver::error::RepositoryError;
use idempotency_receiver::idempotency::{
    Coordinator, Fingerprinter, IdempotencyRecord, ManualClock, RequestDescriptor,
};
use idempotency_receiver::repositories::{InMemoryRepository, Repository, RepositoryResult};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub fn start_instant() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-18T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn books_request(key: &str, body: &str) -> RequestDescriptor {
    RequestDescriptor::new("acme.books", "POST", "/books")
        .with_idempotency_key(key)
        .with_client_identity("192.168.1.10")
        .with_body(body.as_bytes().to_vec())
}

/// Coordinator over an in-memory repository with a manual clock.
pub fn memory_coordinator() -> (Coordinator, Arc<CountingRepository>, Arc<ManualClock>) {
    let repository = Arc::new(CountingRepository::new(InMemoryRepository::new(128, None)));
    let clock = Arc::new(ManualClock::new(start_instant()));
    let coordinator = Coordinator::new(Fingerprinter::new(true), repository.clone())
        .with_clock(clock.clone());
    (coordinator, repository, clock)
}

/// Repository wrapper that counts calls per operation.
pub struct CountingRepository {
    inner: InMemoryRepository,
    pub gets: AtomicU32,
    pub puts: AtomicU32,
    pub deletes: AtomicU32,
}

impl CountingRepository {
    pub fn new(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            gets: AtomicU32::new(0),
            puts: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &InMemoryRepository {
        &self.inner
    }

    pub fn puts(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for CountingRepository {
    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> RepositoryResult<IdempotencyRecord> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, record).await
    }

    async fn delete(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }
}

/// Repository that fails while `down` is set, or for the next `fail_next` calls.
pub struct FlakyRepository {
    inner: InMemoryRepository,
    down: AtomicBool,
    fail_next: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self {
            inner: InMemoryRepository::new(128, None),
            down: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> RepositoryResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("backend down".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(RepositoryError::Unavailable("transient failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> RepositoryResult<IdempotencyRecord> {
        self.check()?;
        self.inner.put(key, record).await
    }

    async fn delete(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        self.check()?;
        self.inner.delete(key).await
    }
}
