use crate::idempotency::IdempotencyRecord;
use crate::repositories::{Repository, RepositoryResult};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, RetryPolicy};
use async_trait::async_trait;
use std::sync::Arc;

/// Decorates a repository with retry and a circuit breaker.
///
/// Each call runs as `breaker(retry(op))`, so the breaker only counts outcomes
/// after retries are exhausted.
pub struct ResilientRepository {
    inner: Arc<dyn Repository>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResilientRepository {
    pub fn new(inner: Arc<dyn Repository>, retry: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            retry,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn circuit_state(&self) -> CircuitBreakerState {
        self.breaker.state().await
    }
}

#[async_trait]
impl Repository for ResilientRepository {
    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        let inner = &self.inner;
        self.breaker
            .call(|| self.retry.run("get", move || inner.get(key)))
            .await
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> RepositoryResult<IdempotencyRecord> {
        let inner = &self.inner;
        let record = &record;
        self.breaker
            .call(|| self.retry.run("put", move || inner.put(key, record.clone())))
            .await
    }

    async fn delete(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        let inner = &self.inner;
        self.breaker
            .call(|| self.retry.run("delete", move || inner.delete(key)))
            .await
    }

    /// Goes straight to the backend; health probes never move the breaker.
    async fn ping(&self) -> RepositoryResult<()> {
        self.inner.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::repositories::MockRepository;
    use chrono::Utc;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), 1)
    }

    fn breaker(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mut mock = MockRepository::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RepositoryError::Unavailable("blip".to_string())));
        mock.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|key| Ok(Some(IdempotencyRecord::running(key, Utc::now()))));

        let repo = ResilientRepository::new(Arc::new(mock), fast_retry(), breaker(5));
        let found = repo.get("k").await.unwrap();
        assert_eq!(found.unwrap().key(), "k");
        assert_eq!(repo.circuit_state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_counts_post_retry_failures() {
        let mut mock = MockRepository::new();
        // Two logical calls, two attempts each.
        mock.expect_put()
            .times(4)
            .returning(|_, _| Err(RepositoryError::Unavailable("down".to_string())));

        let repo = ResilientRepository::new(Arc::new(mock), fast_retry(), breaker(2));
        let record = IdempotencyRecord::running("k", Utc::now());

        let first = repo.put("k", record.clone()).await;
        assert!(matches!(first, Err(RepositoryError::Exhausted { attempts: 2, .. })));
        assert_eq!(repo.circuit_state().await, CircuitBreakerState::Closed);

        let second = repo.put("k", record.clone()).await;
        assert!(second.is_err());
        assert_eq!(repo.circuit_state().await, CircuitBreakerState::Open);

        // Fail fast; the mock would panic on a fifth call.
        let third = repo.put("k", record).await;
        assert!(matches!(third, Err(RepositoryError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_circuit() {
        let mut mock = MockRepository::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_delete()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(RepositoryError::Unavailable("down".to_string())));
        mock.expect_delete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));

        let repo = ResilientRepository::new(Arc::new(mock), fast_retry(), breaker(1));
        assert!(repo.delete("k").await.is_err());
        assert_eq!(repo.circuit_state().await, CircuitBreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(repo.circuit_state().await, CircuitBreakerState::HalfOpen);

        assert!(repo.delete("k").await.unwrap().is_none());
        assert_eq!(repo.circuit_state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_ping_bypasses_breaker() {
        let mut mock = MockRepository::new();
        mock.expect_ping()
            .times(3)
            .returning(|| Err(RepositoryError::NotConnected("refused".to_string())));

        let repo = ResilientRepository::new(Arc::new(mock), fast_retry(), breaker(1));
        for _ in 0..3 {
            assert!(matches!(repo.ping().await, Err(RepositoryError::NotConnected(_))));
        }
        assert_eq!(repo.circuit_state().await, CircuitBreakerState::Closed);
    }
}
