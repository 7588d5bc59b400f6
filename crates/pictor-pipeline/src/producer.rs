//! Conversion and thumbnail producers.
//!
//! A producer is invoked when an original is first stored or a derivative is
//! first requested. It makes sure a record exists and queues an encode task
//! only when that record is still `pending`.

use anyhow::Result;

use pictor_core::models::{DerivativeFormat, DerivativeKind, DerivativeStatus, SourceImage};
use pictor_core::PipelineSettings;
use pictor_processing::EncodeSettings;

use crate::context::DerivativeContext;
use crate::task::DerivativeTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A task for the record is queued.
    Submitted,
    /// A task for the record was queued earlier and has not started yet.
    AlreadyQueued,
    /// The queue stayed full. The record remains `pending` until the orphan
    /// scanner finds it stale.
    Discarded,
    /// The record exists in another state and needs nothing from us.
    Skipped(DerivativeStatus),
    /// The format is switched off in the current settings.
    Disabled,
}

/// How a dispatch waits for queue space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A few quick attempts, then give up.
    Retry,
    /// Wait up to the policy's block timeout.
    Block,
}

pub struct DerivativeProducer {
    kind: DerivativeKind,
    ctx: DerivativeContext,
}

impl DerivativeProducer {
    pub fn new(kind: DerivativeKind, ctx: DerivativeContext) -> Self {
        Self { kind, ctx }
    }

    pub fn conversion(ctx: DerivativeContext) -> Self {
        Self::new(DerivativeKind::Conversion, ctx)
    }

    pub fn thumbnail(ctx: DerivativeContext) -> Self {
        Self::new(DerivativeKind::Thumbnail, ctx)
    }

    pub fn kind(&self) -> DerivativeKind {
        self.kind
    }

    /// Run for every format this producer currently targets.
    #[tracing::instrument(skip(self, source), fields(source_image_id = %source.id, kind = ?self.kind))]
    pub async fn produce(
        &self,
        source: &SourceImage,
    ) -> Result<Vec<(DerivativeFormat, DispatchOutcome)>> {
        let settings = self.ctx.settings.current().await;
        let formats = settings.target_formats(self.kind);

        let mut outcomes = Vec::with_capacity(formats.len());
        for format in formats {
            let outcome = self
                .produce_with(source, format, &settings, Submission::Retry)
                .await?;
            outcomes.push((format, outcome));
        }
        Ok(outcomes)
    }

    /// Run for a single format, e.g. when a reader asks for it.
    pub async fn produce_format(
        &self,
        source: &SourceImage,
        format: DerivativeFormat,
        submission: Submission,
    ) -> Result<DispatchOutcome> {
        if format.kind() != self.kind {
            return Err(anyhow::anyhow!(
                "Format {} is not handled by the {:?} producer",
                format,
                self.kind
            ));
        }
        let settings = self.ctx.settings.current().await;
        self.produce_with(source, format, &settings, submission).await
    }

    async fn produce_with(
        &self,
        source: &SourceImage,
        format: DerivativeFormat,
        settings: &PipelineSettings,
        submission: Submission,
    ) -> Result<DispatchOutcome> {
        if !settings.is_enabled(format) {
            tracing::debug!(format = %format, "Derivative format disabled");
            return Ok(DispatchOutcome::Disabled);
        }

        let derivative = self
            .ctx
            .derivatives
            .upsert_pending(source.id, format)
            .await?;
        if derivative.status != DerivativeStatus::Pending {
            return Ok(DispatchOutcome::Skipped(derivative.status));
        }
        if !self.ctx.queued.try_mark(derivative.id).await {
            return Ok(DispatchOutcome::AlreadyQueued);
        }

        let task = DerivativeTask::new(
            derivative.id,
            source,
            format,
            EncodeSettings::from(settings),
            &self.ctx,
        );
        let policy = self.ctx.submit;
        let accepted = match submission {
            Submission::Retry => {
                self.ctx
                    .pool
                    .try_submit_with_retry(Box::new(task), policy.attempts, policy.delay)
                    .await
            }
            Submission::Block => {
                self.ctx
                    .pool
                    .submit_blocking(Box::new(task), policy.block_timeout)
                    .await
            }
        };

        if accepted {
            tracing::debug!(
                derivative_id = %derivative.id,
                format = %format,
                "Derivative task submitted"
            );
            Ok(DispatchOutcome::Submitted)
        } else {
            self.ctx.queued.clear(derivative.id).await;
            Ok(DispatchOutcome::Discarded)
        }
    }
}

/// Routes a format to the producer of its kind.
pub struct DerivativeDispatcher {
    conversion: DerivativeProducer,
    thumbnail: DerivativeProducer,
}

impl DerivativeDispatcher {
    pub fn new(ctx: DerivativeContext) -> Self {
        Self {
            conversion: DerivativeProducer::conversion(ctx.clone()),
            thumbnail: DerivativeProducer::thumbnail(ctx),
        }
    }

    pub fn producer_for(&self, format: DerivativeFormat) -> &DerivativeProducer {
        match format.kind() {
            DerivativeKind::Conversion => &self.conversion,
            DerivativeKind::Thumbnail => &self.thumbnail,
        }
    }

    pub async fn dispatch(
        &self,
        source: &SourceImage,
        format: DerivativeFormat,
    ) -> Result<DispatchOutcome> {
        self.producer_for(format)
            .produce_format(source, format, Submission::Retry)
            .await
    }

    /// Like [`dispatch`](Self::dispatch) but waits for queue space, for
    /// callers that would rather be slow than dropped.
    pub async fn dispatch_blocking(
        &self,
        source: &SourceImage,
        format: DerivativeFormat,
    ) -> Result<DispatchOutcome> {
        self.producer_for(format)
            .produce_format(source, format, Submission::Block)
            .await
    }

    /// Run every producer for a new original. A failing producer is logged
    /// and does not stop the others.
    pub async fn produce_all(
        &self,
        source: &SourceImage,
    ) -> Vec<(DerivativeFormat, DispatchOutcome)> {
        let mut outcomes = Vec::new();
        for producer in [&self.conversion, &self.thumbnail] {
            match producer.produce(source).await {
                Ok(mut produced) => outcomes.append(&mut produced),
                Err(e) => {
                    tracing::error!(
                        source_image_id = %source.id,
                        kind = ?producer.kind(),
                        error = %e,
                        "Derivative producer failed"
                    );
                }
            }
        }
        outcomes
    }
}
