use std::sync::Arc;

use pictor_core::{Config, StaticSettingsProvider};
use pictor_pipeline::{ImageReader, OrphanScanner, RetryScanner, SessionSweeper};
use pictor_worker::TaskPool;

/// Everything the daemon owns while running.
pub struct AppState {
    pub config: Config,
    pub settings: StaticSettingsProvider,
    pub pool: Arc<TaskPool>,
    pub reader: Arc<ImageReader>,
    pub jobs: BackgroundJobs,
}

/// Periodic jobs, started by the server loop.
pub struct BackgroundJobs {
    pub retry_scanner: Arc<RetryScanner>,
    pub orphan_scanner: Arc<OrphanScanner>,
    pub session_sweeper: Arc<SessionSweeper>,
}
