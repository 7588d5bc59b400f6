use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use pictor_core::SettingsProvider;
use pictor_db::{DerivativeRepository, SourceImageRepository};

use crate::producer::{DerivativeDispatcher, DispatchOutcome};
use crate::scanner::{PeriodicJob, ScanReport};

/// Recovers derivatives nobody is working on: left in `processing` by a
/// worker that died or hung, or left `pending` after the queue dropped their
/// task or the process restarted.
pub struct OrphanScanner {
    derivatives: Arc<dyn DerivativeRepository>,
    sources: Arc<dyn SourceImageRepository>,
    dispatcher: Arc<DerivativeDispatcher>,
    settings: Arc<dyn SettingsProvider>,
}

impl OrphanScanner {
    pub fn new(
        derivatives: Arc<dyn DerivativeRepository>,
        sources: Arc<dyn SourceImageRepository>,
        dispatcher: Arc<DerivativeDispatcher>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            derivatives,
            sources,
            dispatcher,
            settings,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn scan(&self) -> Result<ScanReport> {
        let settings = self.settings.current().await;
        let stale_after = chrono::Duration::from_std(settings.orphan_stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let stale_before = Utc::now() - stale_after;

        let orphans = self
            .derivatives
            .find_orphaned(stale_before, settings.orphan_batch_size)
            .await?;

        let mut report = ScanReport {
            found: orphans.len(),
            ..ScanReport::default()
        };

        for derivative in orphans {
            // Re-checks staleness in the same write, so a worker that just
            // touched the record keeps it.
            match self
                .derivatives
                .reset_orphan_to_pending(derivative.id, stale_before)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(derivative_id = %derivative.id, "Orphan changed before reset, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(derivative_id = %derivative.id, error = %e, "Failed to reset orphaned derivative");
                    report.skipped += 1;
                    continue;
                }
            }
            report.handled += 1;

            tracing::warn!(
                derivative_id = %derivative.id,
                format = %derivative.format,
                status = %derivative.status,
                last_update = %derivative.updated_at,
                "Recovered orphaned derivative"
            );

            let source = match self.sources.get(derivative.source_image_id).await {
                Ok(Some(source)) => source,
                Ok(None) => {
                    tracing::warn!(
                        derivative_id = %derivative.id,
                        source_image_id = %derivative.source_image_id,
                        "Source image missing for orphaned derivative"
                    );
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(derivative_id = %derivative.id, error = %e, "Failed to load source image");
                    report.skipped += 1;
                    continue;
                }
            };

            match self.dispatcher.dispatch(&source, derivative.format).await {
                Ok(DispatchOutcome::Submitted) => report.dispatched += 1,
                Ok(outcome) => {
                    tracing::debug!(derivative_id = %derivative.id, ?outcome, "Recovered derivative not dispatched");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(derivative_id = %derivative.id, error = %e, "Failed to dispatch recovered derivative");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for OrphanScanner {
    fn name(&self) -> &'static str {
        "orphan_scanner"
    }

    async fn interval(&self) -> Duration {
        self.settings.current().await.orphan_scan_interval
    }

    async fn run_once(&self) -> Result<ScanReport> {
        self.scan().await
    }
}
