//! Storage setup and initialization

use anyhow::{Context, Result};
use pictor_core::Config;
use pictor_storage::{create_storage, Storage};
use std::sync::Arc;

pub async fn setup_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    tracing::info!("Initializing storage...");
    let storage = create_storage(config)
        .await
        .context("Failed to initialize storage backend")?;
    tracing::info!(backend = %storage.backend_type(), "Storage initialized");

    tokio::fs::create_dir_all(&config.upload.scratch_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create upload scratch directory {}",
                config.upload.scratch_dir.display()
            )
        })?;

    Ok(storage)
}
