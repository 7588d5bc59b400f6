use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use pictor_core::models::{NewSourceImage, SourceImage};

#[async_trait]
pub trait SourceImageRepository: Send + Sync {
    /// Register a stored original. A record with the same content hash is
    /// returned as-is instead of creating a duplicate.
    async fn create(&self, input: NewSourceImage) -> Result<SourceImage>;

    async fn get(&self, id: Uuid) -> Result<Option<SourceImage>>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<SourceImage>>;

    async fn set_dimensions(&self, id: Uuid, width: i32, height: i32) -> Result<bool>;
}

const SOURCE_IMAGE_COLUMNS: &str = r#"
    id,
    file_name,
    content_type,
    content_hash,
    storage_key,
    file_size,
    width,
    height,
    created_at
"#;

#[derive(Clone)]
pub struct PostgresSourceImageRepository {
    pool: PgPool,
}

impl PostgresSourceImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceImageRepository for PostgresSourceImageRepository {
    #[tracing::instrument(skip(self, input), fields(content_hash = %input.content_hash))]
    async fn create(&self, input: NewSourceImage) -> Result<SourceImage> {
        let inserted: Option<SourceImage> = sqlx::query_as::<Postgres, SourceImage>(&format!(
            r#"
            INSERT INTO source_images (
                id, file_name, content_type, content_hash, storage_key, file_size
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (content_hash) DO NOTHING
            RETURNING {}
            "#,
            SOURCE_IMAGE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&input.file_name)
        .bind(&input.content_type)
        .bind(&input.content_hash)
        .bind(&input.storage_key)
        .bind(input.file_size)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert source image")?;

        if let Some(image) = inserted {
            tracing::info!(
                source_image_id = %image.id,
                storage_key = %image.storage_key,
                file_size = image.file_size,
                "Source image registered"
            );
            return Ok(image);
        }

        self.find_by_hash(&input.content_hash)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Source image vanished after conflicting insert"))
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<SourceImage>> {
        let image = sqlx::query_as::<Postgres, SourceImage>(&format!(
            "SELECT {} FROM source_images WHERE id = $1",
            SOURCE_IMAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch source image")?;

        Ok(image)
    }

    #[tracing::instrument(skip(self))]
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<SourceImage>> {
        let image = sqlx::query_as::<Postgres, SourceImage>(&format!(
            "SELECT {} FROM source_images WHERE content_hash = $1",
            SOURCE_IMAGE_COLUMNS
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch source image by hash")?;

        Ok(image)
    }

    #[tracing::instrument(skip(self))]
    async fn set_dimensions(&self, id: Uuid, width: i32, height: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE source_images
            SET width = $2, height = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(width)
        .bind(height)
        .execute(&self.pool)
        .await
        .context("Failed to update source image dimensions")?;

        Ok(result.rows_affected() == 1)
    }
}
