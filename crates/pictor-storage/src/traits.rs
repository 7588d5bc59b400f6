//! Storage abstraction trait

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<StorageError> for pictor_core::AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => pictor_core::AppError::NotFound(key),
            StorageError::InvalidKey(msg) => pictor_core::AppError::InvalidInput(msg),
            other => pictor_core::AppError::Storage(other.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Chunks of an object as they are read from the backend.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Object store used for originals and derivative artifacts.
///
/// `save` must replace an existing object atomically: readers see either the
/// old or the new content, never a partial write.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, storage_key: &str, data: Bytes, content_type: &str) -> StorageResult<()>;

    /// Stream an object. Fails with [`StorageError::NotFound`] if absent.
    async fn get(&self, storage_key: &str) -> StorageResult<ByteStream>;

    /// Read a whole object into memory.
    async fn download(&self, storage_key: &str) -> StorageResult<Bytes> {
        let mut stream = self.get(storage_key).await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Deleting a missing object is not an error.
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    fn backend_type(&self) -> StorageBackend;
}
