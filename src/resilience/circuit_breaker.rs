use crate::error::RepositoryError;
use crate::observability::get_metrics;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit again.
    pub success_threshold: u32,
    /// Time spent open before a trial call is let through.
    pub delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            delay: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    // Start of the single half-open trial. A trial older than `delay` is treated as abandoned.
    trial_started: Option<Instant>,
    // Bumped on every transition; a trial only frees the permit of its own half-open period.
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Fail-fast guard shared by every call through one repository.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                trial_started: None,
                generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock().await;
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock().await;
        self.maybe_half_open(&mut inner);
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
        }
    }

    /// Runs `f` unless the circuit is open.
    ///
    /// While half-open a single trial call is admitted at a time; concurrent
    /// calls fail fast until it settles. The lock is not held while `f` runs.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let trial = {
            let mut inner = self.inner.lock().await;
            self.maybe_half_open(&mut inner);
            match inner.state {
                CircuitBreakerState::Open => return Err(RepositoryError::CircuitOpen),
                CircuitBreakerState::HalfOpen if self.trial_running(&inner) => {
                    tracing::trace!("Half-open trial already in flight, failing fast");
                    return Err(RepositoryError::CircuitOpen);
                }
                CircuitBreakerState::HalfOpen => {
                    inner.trial_started = Some(Instant::now());
                    Some(inner.generation)
                }
                CircuitBreakerState::Closed => None,
            }
        };

        let result = f().await;

        let mut inner = self.inner.lock().await;
        if trial == Some(inner.generation) {
            inner.trial_started = None;
        }
        match result {
            Ok(value) => {
                self.on_success(&mut inner);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(&mut inner);
                Err(e)
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        self.on_success(&mut inner);
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        self.on_failure(&mut inner);
    }

    fn on_success(&self, inner: &mut Inner) {
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitBreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(inner, CircuitBreakerState::Closed);
                }
            }
            // A call admitted before the circuit opened; it does not close it.
            CircuitBreakerState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner) {
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                self.transition(inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn trial_running(&self, inner: &Inner) -> bool {
        inner
            .trial_started
            .map_or(false, |started| started.elapsed() < self.config.delay)
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitBreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.delay {
                    self.transition(inner, CircuitBreakerState::HalfOpen);
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitBreakerState) {
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.trial_started = None;
        inner.generation += 1;
        inner.opened_at = match to {
            CircuitBreakerState::Open => Some(Instant::now()),
            _ => None,
        };

        match to {
            CircuitBreakerState::Closed => tracing::info!("The circuit breaker has been closed"),
            CircuitBreakerState::Open => tracing::info!("The circuit breaker has been opened"),
            CircuitBreakerState::HalfOpen => tracing::info!("The circuit breaker has been half-opened"),
        }
        get_metrics().record_circuit_transition(to.as_str());
    }
}
