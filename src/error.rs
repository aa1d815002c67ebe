use http::StatusCode;
use thiserror::Error;

/// Failures raised by repository backends and the resilience layer around them.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Repository client not connected: {0}")]
    NotConnected(String),

    #[error("Repository backend unavailable: {0}")]
    Unavailable(String),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Repository operation failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<RepositoryError>,
    },
}

impl RepositoryError {
    /// Whether another attempt may succeed. An open circuit is never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RepositoryError::CircuitOpen | RepositoryError::Exhausted { .. })
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("request is missing mandatory idempotency key header '{0}'")]
    MissingIdempotencyKey(String),

    #[error("Unable to read request body: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fingerprint error: {0}")]
    Fingerprint(String),

    #[error("Unmarshall error: {0}")]
    Unmarshall(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status a transport layer should answer with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingIdempotencyKey(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
