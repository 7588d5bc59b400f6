use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use pictor_core::models::BackoffPolicy;
use pictor_core::SettingsProvider;
use pictor_db::{DerivativeRepository, SourceImageRepository};

use crate::producer::{DerivativeDispatcher, DispatchOutcome};
use crate::scanner::{PeriodicJob, ScanReport};

/// Requeues failed derivatives whose backoff has elapsed, up to the retry
/// ceiling.
pub struct RetryScanner {
    derivatives: Arc<dyn DerivativeRepository>,
    sources: Arc<dyn SourceImageRepository>,
    dispatcher: Arc<DerivativeDispatcher>,
    settings: Arc<dyn SettingsProvider>,
}

impl RetryScanner {
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
        let backoff =
            BackoffPolicy::new(settings.retry_base_backoff).with_cap(settings.retry_backoff_cap);

        let candidates = self
            .derivatives
            .find_retryable(settings.max_retries, Utc::now(), settings.retry_batch_size)
            .await?;

        let mut report = ScanReport {
            found: candidates.len(),
            ..ScanReport::default()
        };

        for derivative in candidates {
            let reset = match self.derivatives.reset_for_retry(derivative.id, &backoff).await {
                Ok(reset) => reset,
                Err(e) => {
                    tracing::error!(derivative_id = %derivative.id, error = %e, "Failed to reset derivative for retry");
                    report.skipped += 1;
                    continue;
                }
            };
            if !reset {
                tracing::debug!(derivative_id = %derivative.id, "Derivative changed before retry, skipping");
                report.skipped += 1;
                continue;
            }
            report.handled += 1;

            tracing::info!(
                derivative_id = %derivative.id,
                format = %derivative.format,
                retry_count = derivative.retry_count + 1,
                "Retrying failed derivative"
            );

            let source = match self.sources.get(derivative.source_image_id).await {
                Ok(Some(source)) => source,
                Ok(None) => {
                    tracing::warn!(
                        derivative_id = %derivative.id,
                        source_image_id = %derivative.source_image_id,
                        "Source image missing for retried derivative"
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
                    tracing::debug!(derivative_id = %derivative.id, ?outcome, "Retried derivative not dispatched");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(derivative_id = %derivative.id, error = %e, "Failed to dispatch retried derivative");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for RetryScanner {
    fn name(&self) -> &'static str {
        "retry_scanner"
    }

    async fn interval(&self) -> Duration {
        self.settings.current().await.retry_scan_interval
    }

    async fn run_once(&self) -> Result<ScanReport> {
        self.scan().await
    }
}
