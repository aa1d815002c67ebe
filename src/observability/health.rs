use crate::config::RepositoryBackend;
use crate::observability::LatencyTimer;
use crate::repositories::{Repository, ResilientRepository};
use crate::resilience::CircuitBreakerState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Dependency name used for the repository circuit breaker.
pub const REPOSITORY_DEPENDENCY: &str = "idempotency_repository";

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const SLOW_PING_MS: f64 = 50.0;

/// Ordered from best to worst, so the report status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    pub fn is_unhealthy(&self) -> bool {
        *self == HealthStatus::Unhealthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            latency_ms: None,
            message: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl HealthReport {
    pub fn new(uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = dependencies
            .iter()
            .map(|d| d.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            dependencies,
        }
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &DependencyHealth> {
        self.dependencies.iter().filter(|d| !d.status.is_healthy())
    }
}

/// Closed is healthy, half-open degraded, open unhealthy.
pub fn circuit_health(state: CircuitBreakerState) -> DependencyHealth {
    match state {
        CircuitBreakerState::Closed => DependencyHealth::new(REPOSITORY_DEPENDENCY, HealthStatus::Healthy),
        CircuitBreakerState::HalfOpen => DependencyHealth::new(REPOSITORY_DEPENDENCY, HealthStatus::Degraded)
            .with_message("Circuit breaker half-open, probing the backend"),
        CircuitBreakerState::Open => DependencyHealth::new(REPOSITORY_DEPENDENCY, HealthStatus::Unhealthy)
            .with_message("Circuit breaker open, idempotency bypassed"),
    }
}

/// Reports on the idempotency repository: its circuit breaker and a backend ping.
pub struct HealthChecker {
    repository: Arc<ResilientRepository>,
    backend: RepositoryBackend,
    started: Instant,
}

impl HealthChecker {
    pub fn new(repository: Arc<ResilientRepository>, backend: RepositoryBackend) -> Self {
        Self {
            repository,
            backend,
            started: Instant::now(),
        }
    }

    pub async fn check_all(&self) -> HealthReport {
        let dependencies = vec![self.check_circuit().await, self.check_backend().await];
        HealthReport::new(self.uptime_seconds(), dependencies)
    }

    pub async fn check_circuit(&self) -> DependencyHealth {
        circuit_health(self.repository.circuit_state().await)
    }

    /// Pings the backend through the repository's own connection.
    pub async fn check_backend(&self) -> DependencyHealth {
        let name = self.backend.as_str();
        let timer = LatencyTimer::new();

        match tokio::time::timeout(PING_TIMEOUT, self.repository.ping()).await {
            Ok(Ok(())) => {
                let latency = timer.elapsed_ms();
                let health = if latency > SLOW_PING_MS {
                    DependencyHealth::new(name, HealthStatus::Degraded).with_message("High latency detected")
                } else {
                    DependencyHealth::new(name, HealthStatus::Healthy)
                };
                health.with_latency(latency)
            }
            Ok(Err(e)) => {
                DependencyHealth::new(name, HealthStatus::Unhealthy).with_message(format!("Ping failed: {}", e))
            }
            Err(_) => DependencyHealth::new(name, HealthStatus::Unhealthy).with_message("Ping timed out"),
        }
    }

    /// False only while the repository circuit is open.
    pub async fn is_ready(&self) -> bool {
        !self.check_circuit().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
