//! Periodic background jobs.
//!
//! The interval is asked for again before every pass, so settings changes
//! take effect without a restart.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Counts from one pass of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Candidates returned by the query.
    pub found: usize,
    /// Candidates this pass changed.
    pub handled: usize,
    /// Tasks handed to the pool.
    pub dispatched: usize,
    /// Candidates another actor changed first, or that could not be dispatched.
    pub skipped: usize,
}

#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn interval(&self) -> Duration;

    async fn run_once(&self) -> Result<ScanReport>;
}

/// Run `job` every `job.interval()` until `cancel` fires. A failed pass is
/// logged and the next one runs on schedule.
pub fn spawn_periodic(job: Arc<dyn PeriodicJob>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(job = job.name(), "Periodic job started");
        loop {
            let interval = job.interval().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match job.run_once().await {
                        Ok(report) if report.found > 0 => {
                            tracing::info!(
                                job = job.name(),
                                found = report.found,
                                handled = report.handled,
                                dispatched = report.dispatched,
                                skipped = report.skipped,
                                "Periodic job pass finished"
                            );
                        }
                        Ok(_) => {
                            tracing::trace!(job = job.name(), "Periodic job pass found nothing");
                        }
                        Err(e) => {
                            tracing::error!(job = job.name(), error = %e, "Periodic job pass failed");
                        }
                    }
                }
            }
        }
        tracing::info!(job = job.name(), "Periodic job stopped");
    })
}
