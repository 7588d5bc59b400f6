//! Background job loop and graceful shutdown

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pictor_core::SettingsProvider;
use pictor_pipeline::{spawn_periodic, PeriodicJob};

use crate::state::AppState;
use crate::stats::StatsReporter;

/// Start the periodic jobs, then block until a shutdown signal arrives.
pub async fn run_until_shutdown(state: AppState) -> Result<()> {
    let cancel = CancellationToken::new();

    let jobs: Vec<Arc<dyn PeriodicJob>> = vec![
        state.jobs.retry_scanner.clone() as Arc<dyn PeriodicJob>,
        state.jobs.orphan_scanner.clone() as Arc<dyn PeriodicJob>,
        state.jobs.session_sweeper.clone() as Arc<dyn PeriodicJob>,
        Arc::new(StatsReporter::new(state.pool.clone(), state.reader.clone())),
    ];
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| spawn_periodic(job, cancel.child_token()))
        .collect();

    let settings = state.settings.current().await;
    tracing::info!(
        storage_backend = %state.config.storage_backend,
        persistent_metadata = state.config.database_url.is_some(),
        webp_enabled = settings.webp_enabled,
        thumbnails_enabled = settings.thumbnails_enabled,
        thumbnail_sizes = ?settings.thumbnail_sizes,
        max_retries = settings.max_retries,
        "Pictor ready"
    );

    shutdown_signal().await;

    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background job ended abnormally");
        }
    }

    if state.pool.shutdown().await {
        tracing::info!("Task pool drained");
    } else {
        tracing::warn!("Task pool shutdown grace period elapsed, remaining tasks aborted");
    }

    pictor_infra::shutdown_telemetry().await;
    Ok(())
}

/// Wait for Ctrl+C (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
        },
    }

    tracing::info!("Shutting down gracefully...");
}
