//! Periodic pool and cache statistics log line.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use pictor_pipeline::{ImageReader, PeriodicJob, ScanReport};
use pictor_worker::TaskPool;

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub struct StatsReporter {
    pool: Arc<TaskPool>,
    reader: Arc<ImageReader>,
}

impl StatsReporter {
    pub fn new(pool: Arc<TaskPool>, reader: Arc<ImageReader>) -> Self {
        Self { pool, reader }
    }
}

#[async_trait]
impl PeriodicJob for StatsReporter {
    fn name(&self) -> &'static str {
        "stats_reporter"
    }

    async fn interval(&self) -> Duration {
        REPORT_INTERVAL
    }

    async fn run_once(&self) -> Result<ScanReport> {
        let pool = self.pool.stats();
        let metadata = self.reader.metadata_cache().stats();
        let content = self.reader.content_cache().stats();

        tracing::info!(
            queued = self.pool.queued(),
            capacity = self.pool.capacity(),
            accepted = pool.accepted,
            rejected = pool.rejected,
            succeeded = pool.succeeded,
            failed = pool.failed,
            panicked = pool.panicked,
            "Task pool stats"
        );
        tracing::info!(
            metadata_hits = metadata.hits,
            metadata_misses = metadata.misses,
            metadata_timeouts = metadata.timeouts,
            content_hits = content.hits,
            content_misses = content.misses,
            content_timeouts = content.timeouts,
            "Cache stats"
        );

        Ok(ScanReport::default())
    }
}
