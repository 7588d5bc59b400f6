//! Read path for originals and derivatives.
//!
//! Metadata and bytes are both served through [`ReadThroughCache`]. Asking
//! for a derivative that is not ready yet triggers its producer and serves
//! the original in the meantime.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use pictor_core::models::{DerivativeFormat, SourceImage};
use pictor_core::AppError;
use pictor_db::{DerivativeRepository, SourceImageRepository};
use pictor_storage::Storage;
use pictor_worker::TaskPool;

use crate::cache::{CacheLoader, LruCacheStore, ReadThroughCache};
use crate::producer::{DerivativeDispatcher, DispatchOutcome};

#[derive(Debug, Clone)]
pub struct ImageContent {
    pub bytes: Bytes,
    pub content_type: String,
    pub storage_key: String,
    /// True when the original is served because the derivative is not ready.
    pub is_fallback: bool,
}

struct SourceImageLoader {
    sources: Arc<dyn SourceImageRepository>,
}

#[async_trait]
impl CacheLoader<SourceImage> for SourceImageLoader {
    async fn load(&self, key: &str) -> Result<SourceImage, AppError> {
        let id = Uuid::parse_str(key)?;
        self.sources
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Image {} not found", id)))
    }
}

struct ObjectLoader {
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl CacheLoader<Bytes> for ObjectLoader {
    async fn load(&self, key: &str) -> Result<Bytes, AppError> {
        Ok(self.storage.download(key).await?)
    }
}

pub struct ImageReader {
    metadata: ReadThroughCache<SourceImage>,
    content: ReadThroughCache<Bytes>,
    derivatives: Arc<dyn DerivativeRepository>,
    dispatcher: Arc<DerivativeDispatcher>,
}

impl ImageReader {
    pub fn new(
        sources: Arc<dyn SourceImageRepository>,
        derivatives: Arc<dyn DerivativeRepository>,
        storage: Arc<dyn Storage>,
        dispatcher: Arc<DerivativeDispatcher>,
        pool: Arc<TaskPool>,
        capacity: usize,
        fetch_timeout: Duration,
    ) -> Self {
        let metadata = ReadThroughCache::new(
            "image_metadata",
            Arc::new(LruCacheStore::new(capacity)),
            Arc::new(SourceImageLoader { sources }),
            pool.clone(),
            fetch_timeout,
        );
        let content = ReadThroughCache::new(
            "image_content",
            Arc::new(LruCacheStore::new(capacity)),
            Arc::new(ObjectLoader { storage }),
            pool,
            fetch_timeout,
        );
        Self {
            metadata,
            content,
            derivatives,
            dispatcher,
        }
    }

    pub async fn get_metadata(&self, image_id: Uuid) -> Result<SourceImage, AppError> {
        self.metadata.get(&image_id.to_string()).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_original(&self, image_id: Uuid) -> Result<ImageContent, AppError> {
        let image = self.get_metadata(image_id).await?;
        self.original_content(&image).await
    }

    /// Serve a derivative, or the original while it is being produced.
    #[tracing::instrument(skip(self))]
    pub async fn get_derivative(
        &self,
        image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<ImageContent, AppError> {
        let image = self.get_metadata(image_id).await?;

        if let Some(derivative) = self
            .derivatives
            .get_by_source_and_format(image.id, format)
            .await?
        {
            if derivative.is_completed() {
                match self.content.get(&derivative.identifier).await {
                    Ok(bytes) => {
                        return Ok(ImageContent {
                            bytes,
                            content_type: format.content_type().to_string(),
                            storage_key: derivative.identifier,
                            is_fallback: false,
                        });
                    }
                    // Completed record whose artifact vanished; fall back
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(
                            derivative_id = %derivative.id,
                            identifier = %derivative.identifier,
                            "Derivative artifact missing from storage"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match self.dispatcher.dispatch(&image, format).await {
            Ok(DispatchOutcome::Discarded) => {
                tracing::debug!(format = %format, "Lazy derivative request dropped, queue full");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(format = %format, error = %e, "Lazy derivative dispatch failed");
            }
        }

        let mut original = self.original_content(&image).await?;
        original.is_fallback = true;
        Ok(original)
    }

    /// Drop cached metadata for an image.
    pub async fn invalidate(&self, image_id: Uuid) {
        self.metadata.invalidate(&image_id.to_string()).await;
    }

    pub fn metadata_cache(&self) -> &ReadThroughCache<SourceImage> {
        &self.metadata
    }

    pub fn content_cache(&self) -> &ReadThroughCache<Bytes> {
        &self.content
    }

    async fn original_content(&self, image: &SourceImage) -> Result<ImageContent, AppError> {
        let bytes = self.content.get(&image.storage_key).await?;
        Ok(ImageContent {
            bytes,
            content_type: image.content_type.clone(),
            storage_key: image.storage_key.clone(),
            is_fallback: false,
        })
    }
}
