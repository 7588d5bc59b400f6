//! One attempt at producing a derivative.
//!
//! The attempt claims the record (`pending -> processing`), encodes, stores the
//! artifact under a key unique to the attempt, then completes the record. Any
//! step may lose a race against a scanner or another worker; the loser backs
//! off without touching the winner's state and removes its own artifact.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use pictor_core::models::{
    DerivativeArtifact, DerivativeFormat, DerivativeStatus, SourceImage,
};
use pictor_core::TaskError;
use pictor_db::DerivativeRepository;
use pictor_processing::{EncodeSettings, ImageEncoder};
use pictor_storage::keys::derivative_key;
use pictor_storage::Storage;
use pictor_worker::PoolTask;

use crate::context::{DerivativeContext, QueuedDerivatives};

/// Error messages stored on a failed record are cut to this many characters.
const MAX_ERROR_MESSAGE_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { identifier: String },
    Failed { permanent: bool },
    /// Another actor moved the record out of `pending` first.
    LostClaim,
    /// The record left `processing` while we were encoding.
    LostCompletion,
}

pub struct DerivativeTask {
    derivative_id: Uuid,
    source_image_id: Uuid,
    source_key: String,
    format: DerivativeFormat,
    settings: EncodeSettings,
    derivatives: Arc<dyn DerivativeRepository>,
    storage: Arc<dyn Storage>,
    encoder: Arc<dyn ImageEncoder>,
    queued: Arc<QueuedDerivatives>,
}

impl DerivativeTask {
    pub fn new(
        derivative_id: Uuid,
        source: &SourceImage,
        format: DerivativeFormat,
        settings: EncodeSettings,
        ctx: &DerivativeContext,
    ) -> Self {
        Self {
            derivative_id,
            source_image_id: source.id,
            source_key: source.storage_key.clone(),
            format,
            settings,
            derivatives: ctx.derivatives.clone(),
            storage: ctx.storage.clone(),
            encoder: ctx.encoder.clone(),
            queued: ctx.queued.clone(),
        }
    }

    pub fn derivative_id(&self) -> Uuid {
        self.derivative_id
    }

    #[tracing::instrument(
        skip(self),
        fields(
            derivative_id = %self.derivative_id,
            source_image_id = %self.source_image_id,
            format = %self.format
        )
    )]
    pub async fn run(&self) -> Result<TaskOutcome> {
        // out of the queue; a new request may submit again
        self.queued.clear(self.derivative_id).await;

        let claimed = self
            .derivatives
            .transition(
                self.derivative_id,
                DerivativeStatus::Pending,
                DerivativeStatus::Processing,
                None,
            )
            .await?;
        if !claimed {
            tracing::debug!("Derivative already claimed, skipping");
            return Ok(TaskOutcome::LostClaim);
        }

        let attempt_id = Uuid::new_v4();
        let artifact = match self.produce(attempt_id).await {
            Ok(artifact) => artifact,
            Err(e) => return self.fail(e).await,
        };

        let completed = self.derivatives.complete(self.derivative_id, &artifact).await?;
        if !completed {
            tracing::debug!(
                identifier = %artifact.identifier,
                "Derivative was reset while processing, discarding artifact"
            );
            if let Err(e) = self.storage.delete(&artifact.identifier).await {
                tracing::warn!(
                    identifier = %artifact.identifier,
                    error = %e,
                    "Failed to delete discarded artifact"
                );
            }
            return Ok(TaskOutcome::LostCompletion);
        }

        tracing::info!(
            identifier = %artifact.identifier,
            width = artifact.width,
            height = artifact.height,
            file_size = artifact.file_size,
            "Derivative completed"
        );
        Ok(TaskOutcome::Completed {
            identifier: artifact.identifier,
        })
    }

    async fn produce(&self, attempt_id: Uuid) -> Result<DerivativeArtifact, TaskError> {
        let source = self
            .storage
            .download(&self.source_key)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    TaskError::permanent(e)
                } else {
                    TaskError::transient(e)
                }
            })?;

        let encoded = self
            .encoder
            .encode(source, self.format, self.settings)
            .await?;

        let identifier = derivative_key(self.source_image_id, self.format, attempt_id);
        let file_size = encoded.len() as i64;
        self.storage
            .save(&identifier, encoded.bytes, self.format.content_type())
            .await
            .map_err(TaskError::transient)?;

        Ok(DerivativeArtifact {
            identifier,
            width: encoded.width as i32,
            height: encoded.height as i32,
            file_size,
        })
    }

    async fn fail(&self, err: TaskError) -> Result<TaskOutcome> {
        let permanent = err.is_permanent();
        let message: String = err.to_string().chars().take(MAX_ERROR_MESSAGE_LEN).collect();

        if permanent {
            tracing::warn!(error = %message, "Derivative input rejected");
        } else {
            tracing::warn!(error = %message, "Derivative attempt failed");
        }

        let recorded = self
            .derivatives
            .transition(
                self.derivative_id,
                DerivativeStatus::Processing,
                DerivativeStatus::Failed,
                Some(&message),
            )
            .await?;
        if !recorded {
            tracing::debug!("Derivative left processing before failure was recorded");
            return Ok(TaskOutcome::LostCompletion);
        }

        Ok(TaskOutcome::Failed { permanent })
    }
}

#[async_trait]
impl PoolTask for DerivativeTask {
    fn name(&self) -> &str {
        "derivative"
    }

    async fn execute(self: Box<Self>) -> Result<()> {
        self.run().await.map(|_| ())
    }
}
