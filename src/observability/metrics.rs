use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for idempotency coordination.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    /// `outcome` is one of `found`, `absent` or `skip`.
    pub fn record_lookup(&self, outcome: &str) {
        counter!("idempotency_lookups_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_replay(&self, kind: &str) {
        counter!("idempotency_replays_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_repository_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_repository_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_repository_operation_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_circuit_transition(&self, state: &str) {
        counter!("idempotency_circuit_transitions_total", "state" => state.to_string()).increment(1);
    }

    pub fn set_memory_entries(&self, count: u64) {
        gauge!("idempotency_memory_entries").set(count as f64);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> PrometheusHandle {
    let handle = METRICS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        describe_metrics();
        handle
    });

    METRICS.get_or_init(Metrics::new);

    handle.clone()
}

fn describe_metrics() {
    describe_counter!("idempotency_lookups_total", Unit::Count, "Repository lookups by outcome");
    describe_counter!("idempotency_replays_total", Unit::Count, "Subsequent presentations by replay kind");

    describe_counter!("idempotency_repository_operations_total", Unit::Count, "Total idempotency repository operations");
    describe_histogram!("idempotency_repository_operation_duration_ms", Unit::Milliseconds, "Repository operation latency in milliseconds");

    describe_counter!("idempotency_circuit_transitions_total", Unit::Count, "Circuit breaker state transitions");
    describe_gauge!("idempotency_memory_entries", Unit::Count, "Records held by the in-memory repository");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
