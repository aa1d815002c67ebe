use idempotency_receiver::config::Settings;
use idempotency_receiver::idempotency::{Coordinator, Fingerprinter};
use idempotency_receiver::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use idempotency_receiver::repositories::build_repository;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    settings.validate()?;

    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        &settings.application.log_format,
    ));
    let _metrics = init_metrics();
    info!(
        namespace = %settings.idempotency.namespace,
        service = %settings.idempotency.service_name,
        "Configuration loaded"
    );

    let repository = build_repository(&settings)?;
    let coordinator = Coordinator::new(
        Fingerprinter::new(settings.idempotency.key_header_mandatory),
        repository.clone(),
    );
    info!(
        codecs = coordinator.registry().len(),
        key_header_mandatory = coordinator.fingerprinter().key_header_mandatory(),
        "Idempotency coordinator ready"
    );

    let health = HealthChecker::new(Arc::clone(&repository), settings.repository.backend);
    let report = health.check_all().await;

    if report.status.is_healthy() {
        info!("System startup verification complete: All services healthy.");
    } else {
        for dependency in report.unhealthy() {
            warn!(
                dependency = %dependency.name,
                status = ?dependency.status,
                "{}",
                dependency.message.as_deref().unwrap_or("no details")
            );
        }
        warn!("System startup verification complete with degraded dependencies.");
    }

    Ok(())
}
