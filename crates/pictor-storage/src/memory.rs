use crate::keys::validate_key;
use crate::traits::{ByteStream, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Objects kept in process memory. Used by tests and by ephemeral deployments.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<RwLock<HashMap<String, (Bytes, String)>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn content_type(&self, storage_key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(storage_key)
            .map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(&self, storage_key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        validate_key(storage_key)?;
        self.objects
            .write()
            .await
            .insert(storage_key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, storage_key: &str) -> StorageResult<ByteStream> {
        validate_key(storage_key)?;
        let data = self
            .objects
            .read()
            .await
            .get(storage_key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(storage_key.to_string()))?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        validate_key(storage_key)?;
        self.objects.write().await.remove(storage_key);
        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        validate_key(storage_key)?;
        Ok(self.objects.read().await.contains_key(storage_key))
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}
