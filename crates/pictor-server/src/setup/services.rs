//! Repository, pool and pipeline wiring

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;

use pictor_core::{Config, SettingsProvider, StaticSettingsProvider};
use pictor_db::{
    DerivativeRepository, InMemoryDerivativeRepository, InMemorySourceImageRepository,
    PostgresDerivativeRepository, PostgresSourceImageRepository, SourceImageRepository,
};
use pictor_pipeline::{
    DerivativeContext, DerivativeDispatcher, ImageReader, InMemoryUploadSessionRepository,
    OrphanScanner, QueuedDerivatives, RetryScanner, SessionSweeper, SubmitPolicy,
    UploadSessionManager,
};
use pictor_processing::{ImageCrateEncoder, ImageEncoder};
use pictor_storage::Storage;
use pictor_worker::{TaskPool, TaskPoolConfig};

use crate::state::{AppState, BackgroundJobs};

type Repositories = (Arc<dyn DerivativeRepository>, Arc<dyn SourceImageRepository>);

fn repositories(db: Option<PgPool>) -> Repositories {
    match db {
        Some(pool) => (
            Arc::new(PostgresDerivativeRepository::new(pool.clone())),
            Arc::new(PostgresSourceImageRepository::new(pool)),
        ),
        None => (
            Arc::new(InMemoryDerivativeRepository::new()),
            Arc::new(InMemorySourceImageRepository::new()),
        ),
    }
}

pub async fn initialize_services(
    config: Config,
    db: Option<PgPool>,
    storage: Arc<dyn Storage>,
) -> Result<AppState> {
    let (derivatives, sources) = repositories(db);

    let settings = StaticSettingsProvider::new(config.pipeline.clone());
    let settings_provider: Arc<dyn SettingsProvider> = Arc::new(settings.clone());
    let encoder: Arc<dyn ImageEncoder> = Arc::new(ImageCrateEncoder::new());
    let pool = TaskPool::new(TaskPoolConfig::from(&config.pool));

    let ctx = DerivativeContext {
        derivatives: derivatives.clone(),
        storage: storage.clone(),
        encoder: encoder.clone(),
        pool: pool.clone(),
        settings: settings_provider.clone(),
        submit: SubmitPolicy::from(&config.pool),
        queued: Arc::new(QueuedDerivatives::new()),
    };
    let dispatcher = Arc::new(DerivativeDispatcher::new(ctx));

    let reader = Arc::new(ImageReader::new(
        sources.clone(),
        derivatives.clone(),
        storage.clone(),
        dispatcher.clone(),
        pool.clone(),
        config.cache_capacity,
        config.cache_fetch_timeout,
    ));

    let uploads = Arc::new(UploadSessionManager::new(
        Arc::new(InMemoryUploadSessionRepository::new()),
        sources.clone(),
        storage,
        dispatcher.clone(),
        pool.clone(),
        encoder,
        config.upload.clone(),
    ));

    let jobs = BackgroundJobs {
        retry_scanner: Arc::new(RetryScanner::new(
            derivatives.clone(),
            sources.clone(),
            dispatcher.clone(),
            settings_provider.clone(),
        )),
        orphan_scanner: Arc::new(OrphanScanner::new(
            derivatives,
            sources,
            dispatcher,
            settings_provider,
        )),
        session_sweeper: Arc::new(SessionSweeper::new(uploads)),
    };

    tracing::info!(
        workers = config.pool.workers,
        queue_capacity = config.pool.queue_capacity,
        cache_capacity = config.cache_capacity,
        "Pipeline services initialized"
    );

    Ok(AppState {
        config,
        settings,
        pool,
        reader,
        jobs,
    })
}
