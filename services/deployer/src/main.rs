//! maestro scaler
//!
//! Runs one capacity tick for the fleet named by the environment and exits.
//! Scheduled once per fleet per interval; state between invocations lives
//! in the backend (the cooldown record and the fleet stack parameters).

use std::sync::Arc;

use anyhow::Result;
use maestro_deployer::{
    backend::{Backends, MemoryBackend},
    capacity::CapacityController,
    config::ScalerConfig,
};
use maestro_reconcile::SystemClock;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = ScalerConfig::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MAESTRO_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster = %config.cluster,
        version = %config.version,
        fleet = %config.fleet,
        state_file = %config.state_file.display(),
        "Starting scaler tick"
    );

    let backend = Arc::new(MemoryBackend::open(&config.state_file).await?);
    let controller = CapacityController::new(
        &Backends::from_memory(backend.clone()),
        Arc::new(SystemClock),
        config.capacity.clone(),
    );

    let outcome = controller
        .tick(&config.fleet, &config.cluster, &config.version)
        .await;

    // Persist whatever the tick managed to change, even on failure
    if let Err(e) = backend.persist().await {
        error!(error = %e, "Failed to persist backend state");
        return Err(e.into());
    }

    match outcome {
        Ok(outcome) => {
            info!(%outcome, mutated = outcome.is_mutation(), "Scaler tick finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Scaler tick failed");
            Err(e.into())
        }
    }
}
