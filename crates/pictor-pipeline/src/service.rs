use std::sync::Arc;
use uuid::Uuid;

use pictor_core::models::{BackoffPolicy, Derivative, DerivativeFormat, DerivativeStatus};
use pictor_core::{AppError, SettingsProvider};
use pictor_db::{DerivativeRepository, SourceImageRepository};

use crate::producer::{DerivativeDispatcher, DispatchOutcome};

/// Operator-facing operations on derivatives.
pub struct DerivativeService {
    derivatives: Arc<dyn DerivativeRepository>,
    sources: Arc<dyn SourceImageRepository>,
    dispatcher: Arc<DerivativeDispatcher>,
    settings: Arc<dyn SettingsProvider>,
}

impl DerivativeService {
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

    pub async fn get(&self, id: Uuid) -> Result<Derivative, AppError> {
        self.derivatives
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Derivative {} not found", id)))
    }

    pub async fn find(
        &self,
        source_image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<Option<Derivative>, AppError> {
        Ok(self
            .derivatives
            .get_by_source_and_format(source_image_id, format)
            .await?)
    }

    pub async fn list_for_source(&self, source_image_id: Uuid) -> Result<Vec<Derivative>, AppError> {
        Ok(self.derivatives.list_for_source(source_image_id).await?)
    }

    /// Queue every enabled derivative of an original.
    pub async fn generate(
        &self,
        source_image_id: Uuid,
    ) -> Result<Vec<(DerivativeFormat, DispatchOutcome)>, AppError> {
        let source = self
            .sources
            .get(source_image_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Image {} not found", source_image_id)))?;
        Ok(self.dispatcher.produce_all(&source).await)
    }

    /// Requeue a failed derivative now. Unlike the retry scanner this ignores
    /// the scheduled retry time and the automatic retry ceiling, and waits
    /// for queue space instead of dropping the task.
    #[tracing::instrument(skip(self))]
    pub async fn retry(&self, id: Uuid) -> Result<Derivative, AppError> {
        let derivative = self.get(id).await?;
        if derivative.status != DerivativeStatus::Failed {
            return Err(AppError::Conflict(format!(
                "Derivative {} is {}, only failed derivatives can be retried",
                id, derivative.status
            )));
        }

        let settings = self.settings.current().await;
        let backoff =
            BackoffPolicy::new(settings.retry_base_backoff).with_cap(settings.retry_backoff_cap);
        if !self.derivatives.reset_for_retry(id, &backoff).await? {
            return Err(AppError::Conflict(format!(
                "Derivative {} changed while retrying",
                id
            )));
        }

        let source = self
            .sources
            .get(derivative.source_image_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Image {} not found", derivative.source_image_id))
            })?;

        match self
            .dispatcher
            .dispatch_blocking(&source, derivative.format)
            .await?
        {
            DispatchOutcome::Discarded => {
                return Err(AppError::TemporaryFailure(
                    "Task queue stayed full, the derivative stays pending".to_string(),
                ));
            }
            outcome => {
                tracing::info!(
                    derivative_id = %id,
                    ?outcome,
                    retry_count = derivative.retry_count + 1,
                    "Derivative retry requested"
                );
            }
        }

        self.get(id).await
    }
}
