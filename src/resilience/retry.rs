use crate::error::RepositoryError;
use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry of repository-kind failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(150),
            max_retries: 1,
        }
    }
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn total_delay(&self) -> Duration {
        self.delay * self.max_retries
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// Exhaustion is reported as [`RepositoryError::Exhausted`] wrapping the last failure.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut op: F) -> Result<T, RepositoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(RepositoryError::Exhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        "Repository operation failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
