//! In-memory repositories
//!
//! Used when no database is configured and as the store in tests. Each
//! conditional update checks and writes under a single lock acquisition, so
//! racing callers see the same one-winner outcome as the SQL version.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use pictor_core::models::{
    BackoffPolicy, Derivative, DerivativeArtifact, DerivativeFormat, DerivativeStatus,
    NewSourceImage, SourceImage,
};

use super::derivative::{check_artifact, check_transition, DerivativeRepository};
use super::source_image::SourceImageRepository;

/// The record is in `from` and the state machine allows `from -> to`.
fn accepts(record: &Derivative, from: DerivativeStatus, to: DerivativeStatus) -> bool {
    record.status == from && from.can_transition_to(to)
}

#[derive(Default)]
struct DerivativeTable {
    records: HashMap<Uuid, Derivative>,
    by_source_format: HashMap<(Uuid, DerivativeFormat), Uuid>,
}

#[derive(Clone, Default)]
pub struct InMemoryDerivativeRepository {
    table: Arc<Mutex<DerivativeTable>>,
}

impl InMemoryDerivativeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record verbatim, bypassing the state machine.
    pub async fn put(&self, derivative: Derivative) {
        let mut table = self.table.lock().await;
        table
            .by_source_format
            .insert((derivative.source_image_id, derivative.format), derivative.id);
        table.records.insert(derivative.id, derivative);
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Derivative> {
        self.table.lock().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl DerivativeRepository for InMemoryDerivativeRepository {
    async fn upsert_pending(
        &self,
        source_image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<Derivative> {
        let mut table = self.table.lock().await;
        if let Some(existing) = table
            .by_source_format
            .get(&(source_image_id, format))
            .and_then(|id| table.records.get(id))
        {
            return Ok(existing.clone());
        }

        let derivative = Derivative::new_pending(source_image_id, format);
        table
            .by_source_format
            .insert((source_image_id, format), derivative.id);
        table.records.insert(derivative.id, derivative.clone());
        Ok(derivative)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: DerivativeStatus,
        to: DerivativeStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        check_transition(from, to)?;

        let mut table = self.table.lock().await;
        match table.records.get_mut(&id) {
            Some(record) if accepts(record, from, to) => {
                record.status = to;
                if let Some(msg) = error_message {
                    record.error_message = Some(msg.to_string());
                }
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: Uuid, artifact: &DerivativeArtifact) -> Result<bool> {
        check_artifact(artifact)?;

        let mut table = self.table.lock().await;
        match table.records.get_mut(&id) {
            Some(record)
                if accepts(
                    record,
                    DerivativeStatus::Processing,
                    DerivativeStatus::Completed,
                ) =>
            {
                record.status = DerivativeStatus::Completed;
                record.identifier = artifact.identifier.clone();
                record.width = Some(artifact.width);
                record.height = Some(artifact.height);
                record.file_size = Some(artifact.file_size);
                record.error_message = None;
                record.next_retry_at = None;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_for_retry(&self, id: Uuid, backoff: &BackoffPolicy) -> Result<bool> {
        let mut table = self.table.lock().await;
        match table.records.get_mut(&id) {
            Some(record)
                if accepts(record, DerivativeStatus::Failed, DerivativeStatus::Pending) =>
            {
                let now = Utc::now();
                record.retry_count += 1;
                let delay = chrono::Duration::from_std(backoff.delay(record.retry_count))
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
                record.next_retry_at = Some(now + delay);
                record.status = DerivativeStatus::Pending;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_orphan_to_pending(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut table = self.table.lock().await;
        match table.records.get_mut(&id) {
            Some(record) if record.is_orphaned(stale_before) => {
                // stale pending records only get a fresh timestamp
                record.status = DerivativeStatus::Pending;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Derivative>> {
        Ok(self.table.lock().await.records.get(&id).cloned())
    }

    async fn get_by_source_and_format(
        &self,
        source_image_id: Uuid,
        format: DerivativeFormat,
    ) -> Result<Option<Derivative>> {
        let table = self.table.lock().await;
        Ok(table
            .by_source_format
            .get(&(source_image_id, format))
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    async fn list_for_source(&self, source_image_id: Uuid) -> Result<Vec<Derivative>> {
        let table = self.table.lock().await;
        let mut derivatives: Vec<Derivative> = table
            .records
            .values()
            .filter(|d| d.source_image_id == source_image_id)
            .cloned()
            .collect();
        derivatives.sort_by_key(|d| d.format.to_string());
        Ok(derivatives)
    }

    async fn find_retryable(
        &self,
        max_retries: i32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Derivative>> {
        let table = self.table.lock().await;
        let mut derivatives: Vec<Derivative> = table
            .records
            .values()
            .filter(|d| d.is_retry_due(max_retries, now))
            .cloned()
            .collect();
        derivatives.sort_by_key(|d| d.updated_at);
        derivatives.truncate(limit.max(0) as usize);
        Ok(derivatives)
    }

    async fn find_orphaned(
        &self,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Derivative>> {
        let table = self.table.lock().await;
        let mut derivatives: Vec<Derivative> = table
            .records
            .values()
            .filter(|d| d.is_orphaned(stale_before))
            .cloned()
            .collect();
        derivatives.sort_by_key(|d| d.updated_at);
        derivatives.truncate(limit.max(0) as usize);
        Ok(derivatives)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySourceImageRepository {
    images: Arc<Mutex<HashMap<Uuid, SourceImage>>>,
}

impl InMemorySourceImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record verbatim.
    pub async fn put(&self, image: SourceImage) {
        self.images.lock().await.insert(image.id, image);
    }

    pub async fn len(&self) -> usize {
        self.images.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SourceImageRepository for InMemorySourceImageRepository {
    async fn create(&self, input: NewSourceImage) -> Result<SourceImage> {
        let mut images = self.images.lock().await;
        if let Some(existing) = images
            .values()
            .find(|i| i.content_hash == input.content_hash)
        {
            return Ok(existing.clone());
        }

        let image = SourceImage {
            id: Uuid::new_v4(),
            file_name: input.file_name,
            content_type: input.content_type,
            content_hash: input.content_hash,
            storage_key: input.storage_key,
            file_size: input.file_size,
            width: None,
            height: None,
            created_at: Utc::now(),
        };
        images.insert(image.id, image.clone());
        Ok(image)
    }

    async fn get(&self, id: Uuid) -> Result<Option<SourceImage>> {
        Ok(self.images.lock().await.get(&id).cloned())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<SourceImage>> {
        Ok(self
            .images
            .lock()
            .await
            .values()
            .find(|i| i.content_hash == content_hash)
            .cloned())
    }

    async fn set_dimensions(&self, id: Uuid, width: i32, height: i32) -> Result<bool> {
        let mut images = self.images.lock().await;
        match images.get_mut(&id) {
            Some(image) => {
                image.width = Some(width);
                image.height = Some(height);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
