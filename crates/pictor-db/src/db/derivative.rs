use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use pictor_core::models::{
    BackoffPolicy, Derivative, DerivativeArtifact, DerivativeFormat, DerivativeStatus,
};

/// Durable store of derivative records and their state machine.
///
/// Every mutating method is a compare-and-swap: it returns `false` (or the
/// existing record) instead of failing when another actor got there first.
#[async_trait]
pub trait DerivativeRepository: Send + Sync {
    /// Insert a `pending` record for `(source_image_id, format)` unless one
    /// exists. The existing record is returned unchanged otherwise.
    async fn upsert_pending(
        &self,
        source_image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<Derivative>;

    /// Move `id` from `from` to `to` if its status is still `from`. Only the
    /// `pending -> processing` and `processing -> failed` edges are accepted.
    async fn transition(
        &self,
        id: Uuid,
        from: DerivativeStatus,
        to: DerivativeStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    /// `processing -> completed` with the artifact metadata in the same write.
    async fn complete(&self, id: Uuid, artifact: &DerivativeArtifact) -> Result<bool>;

    /// `failed -> pending`, incrementing `retry_count` and scheduling
    /// `next_retry_at = now + backoff(new retry_count)`.
    async fn reset_for_retry(&self, id: Uuid, backoff: &BackoffPolicy) -> Result<bool>;

    /// `processing -> pending` for a record not touched since `stale_before`.
    /// A `pending` record that stale has lost its task; it stays `pending`
    /// and gets a fresh `updated_at` so one caller wins the resubmission.
    async fn reset_orphan_to_pending(&self, id: Uuid, stale_before: DateTime<Utc>)
        -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<Derivative>>;

    async fn get_by_source_and_format(
        &self,
        source_image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<Option<Derivative>>;

    async fn list_for_source(&self, source_image_id: Uuid) -> Result<Vec<Derivative>>;

    /// Failed records below the retry ceiling whose `next_retry_at` has
    /// passed or was never set, oldest first.
    async fn find_retryable(
        &self,
        max_retries: i32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Derivative>>;

    /// `processing` or `pending` records last updated before `stale_before`,
    /// oldest first.
    async fn find_orphaned(&self, stale_before: DateTime<Utc>, limit: i64)
        -> Result<Vec<Derivative>>;
}

/// Shared guard for the rules every implementation enforces before writing.
pub(crate) fn check_transition(from: DerivativeStatus, to: DerivativeStatus) -> Result<()> {
    if !from.is_direct_transition(to) {
        return Err(anyhow::anyhow!(
            "Transition {} -> {} is not allowed through transition()",
            from,
            to
        ));
    }
    Ok(())
}

pub(crate) fn check_artifact(artifact: &DerivativeArtifact) -> Result<()> {
    if artifact.identifier.is_empty() {
        return Err(anyhow::anyhow!(
            "A completed derivative requires a non-empty identifier"
        ));
    }
    Ok(())
}

const DERIVATIVE_COLUMNS: &str = r#"
    id,
    source_image_id,
    format,
    status,
    identifier,
    width,
    height,
    file_size,
    retry_count,
    next_retry_at,
    error_message,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PostgresDerivativeRepository {
    pool: PgPool,
}

impl PostgresDerivativeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DerivativeRepository for PostgresDerivativeRepository {
    #[tracing::instrument(skip(self))]
    async fn upsert_pending(
        &self,
        source_image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<Derivative> {
        let inserted: Option<Derivative> = sqlx::query_as::<Postgres, Derivative>(&format!(
            r#"
            INSERT INTO derivatives (id, source_image_id, format, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (source_image_id, format) DO NOTHING
            RETURNING {}
            "#,
            DERIVATIVE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(source_image_id)
        .bind(format.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert derivative")?;

        if let Some(derivative) = inserted {
            tracing::debug!(
                derivative_id = %derivative.id,
                source_image_id = %source_image_id,
                format = %format,
                "Derivative record created"
            );
            return Ok(derivative);
        }

        self.get_by_source_and_format(source_image_id, format)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Derivative {} for {} vanished after conflicting insert",
                    format,
                    source_image_id
                )
            })
    }

    #[tracing::instrument(skip(self))]
    async fn transition(
        &self,
        id: Uuid,
        from: DerivativeStatus,
        to: DerivativeStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        check_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE derivatives
            SET status = $3,
                error_message = COALESCE($4, error_message),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .context("Failed to transition derivative")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn complete(&self, id: Uuid, artifact: &DerivativeArtifact) -> Result<bool> {
        check_artifact(artifact)?;

        let result = sqlx::query(
            r#"
            UPDATE derivatives
            SET status = 'completed',
                identifier = $2,
                width = $3,
                height = $4,
                file_size = $5,
                error_message = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(&artifact.identifier)
        .bind(artifact.width)
        .bind(artifact.height)
        .bind(artifact.file_size)
        .execute(&self.pool)
        .await
        .context("Failed to complete derivative")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn reset_for_retry(&self, id: Uuid, backoff: &BackoffPolicy) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE derivatives
            SET status = 'pending',
                retry_count = retry_count + 1,
                next_retry_at = NOW() + make_interval(
                    secs => LEAST($2 * power(2::float8, retry_count + 1), $3)
                ),
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(backoff.base.as_secs_f64())
        .bind(backoff.cap.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("Failed to reset derivative for retry")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn reset_orphan_to_pending(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE derivatives
            SET status = 'pending',
                updated_at = NOW()
            WHERE id = $1
                AND status IN ('processing', 'pending')
                AND updated_at < $2
            "#,
        )
        .bind(id)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .context("Failed to reset orphaned derivative")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<Derivative>> {
        let derivative = sqlx::query_as::<Postgres, Derivative>(&format!(
            "SELECT {} FROM derivatives WHERE id = $1",
            DERIVATIVE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch derivative")?;

        Ok(derivative)
    }

    #[tracing::instrument(skip(self))]
    async fn get_by_source_and_format(
        &self,
        source_image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<Option<Derivative>> {
        let derivative = sqlx::query_as::<Postgres, Derivative>(&format!(
            "SELECT {} FROM derivatives WHERE source_image_id = $1 AND format = $2",
            DERIVATIVE_COLUMNS
        ))
        .bind(source_image_id)
        .bind(format.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch derivative by source and format")?;

        Ok(derivative)
    }

    #[tracing::instrument(skip(self))]
    async fn list_for_source(&self, source_image_id: Uuid) -> Result<Vec<Derivative>> {
        let derivatives = sqlx::query_as::<Postgres, Derivative>(&format!(
            "SELECT {} FROM derivatives WHERE source_image_id = $1 ORDER BY format",
            DERIVATIVE_COLUMNS
        ))
        .bind(source_image_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list derivatives")?;

        Ok(derivatives)
    }

    #[tracing::instrument(skip(self))]
    async fn find_retryable(
        &self,
        max_retries: i32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Derivative>> {
        let derivatives = sqlx::query_as::<Postgres, Derivative>(&format!(
            r#"
            SELECT {}
            FROM derivatives
            WHERE status = 'failed'
                AND retry_count < $1
                AND (next_retry_at IS NULL OR next_retry_at <= $2)
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
            DERIVATIVE_COLUMNS
        ))
        .bind(max_retries)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query retryable derivatives")?;

        Ok(derivatives)
    }

    #[tracing::instrument(skip(self))]
    async fn find_orphaned(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Derivative>> {
        let derivatives = sqlx::query_as::<Postgres, Derivative>(&format!(
            r#"
            SELECT {}
            FROM derivatives
            WHERE status IN ('processing', 'pending') AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            DERIVATIVE_COLUMNS
        ))
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query orphaned derivatives")?;

        Ok(derivatives)
    }
}
