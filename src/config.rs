use crate::error::{AppError, Result};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub idempotency: IdempotencySettings,
    pub repository: RepositorySettings,
    pub resiliency: ResiliencySettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ApplicationSettings {
    #[validate(length(min = 1))]
    pub log_level: String,
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencySettings {
    #[validate(length(min = 1))]
    pub namespace: String,
    #[validate(length(min = 1))]
    pub service_name: String,
    pub key_header_mandatory: bool,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            service_name: "service".to_string(),
            key_header_mandatory: false,
        }
    }
}

impl IdempotencySettings {
    /// Prefix of persisted keys: `{namespace}.{service_name}`.
    pub fn key_prefix(&self) -> String {
        format!("{}.{}", self.namespace, self.service_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
    #[default]
    Memory,
    Redis,
}

impl RepositoryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryBackend::Memory => "memory",
            RepositoryBackend::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct RepositorySettings {
    pub backend: RepositoryBackend,
    #[validate(range(min = 1))]
    pub ttl_ms: u64,
    pub memory: MemorySettings,
    pub redis: RedisSettings,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            backend: RepositoryBackend::Memory,
            ttl_ms: 3_600_000,
            memory: MemorySettings::default(),
            redis: RedisSettings::default(),
        }
    }
}

impl RepositorySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct MemorySettings {
    #[validate(range(min = 1))]
    pub capacity: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct RedisSettings {
    #[validate(length(min = 1))]
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResiliencySettings {
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
}

impl ResiliencySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.retry.delay_ms), self.retry.max_retries)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            success_threshold: self.circuit_breaker.success_threshold,
            delay: Duration::from_millis(self.circuit_breaker.delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct RetrySettings {
    pub delay_ms: u64,
    #[validate(range(max = 10))]
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            delay_ms: 150,
            max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    pub delay_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            delay_ms: 30_000,
        }
    }
}

impl Settings {
    /// Loads `config/default`, then optional `config/local`, then `APP__*` environment variables.
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parses settings from a TOML document, applying defaults for anything missing.
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            self.application.validate(),
            self.idempotency.validate(),
            self.repository.validate(),
            self.repository.memory.validate(),
            self.repository.redis.validate(),
            self.resiliency.retry.validate(),
            self.resiliency.circuit_breaker.validate(),
        ];

        for check in checks {
            check.map_err(|e| AppError::Validation(e.to_string()))?;
        }
        Ok(())
    }
}
