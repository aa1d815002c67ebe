pub mod logging;
pub mod metrics;
pub mod health;

pub use logging::{init_logging, LogConfig, LogFormat, mask_sensitive};
pub use metrics::{init_metrics, get_metrics, Metrics, LatencyTimer, METRICS};
pub use health::{circuit_health, DependencyHealth, HealthChecker, HealthReport, HealthStatus, REPOSITORY_DEPENDENCY};
