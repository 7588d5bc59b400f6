//! Daemon setup and initialization

pub mod database;
pub mod server;
pub mod services;
pub mod storage;

use anyhow::Result;
use pictor_core::Config;
use pictor_infra::LogFormat;

use crate::state::AppState;

/// Initialize telemetry, stores and services.
pub async fn initialize_app(config: Config) -> Result<AppState> {
    pictor_infra::init_telemetry(
        "pictor-server",
        LogFormat::for_environment(config.is_production()),
    )
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        environment = %config.environment,
        "Configuration loaded and validated successfully"
    );

    let db = database::setup_database(&config).await?;
    let storage = storage::setup_storage(&config).await?;

    services::initialize_services(config, db, storage).await
}
