//! Resumable chunked uploads.
//!
//! Chunks land in a per-session scratch directory, one file per index, and
//! may arrive in any order or be re-sent. Completion takes the session out of
//! the live table at once and merges in the background: chunks are read in
//! index order, hashed, checked against the declared hash, stored as an
//! original and handed to the derivative producers.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use pictor_core::models::{
    compute_total_chunks, content_type_for, extension_of, ChunkUploadResponse,
    CompleteUploadResponse, InitUploadRequest, InitUploadResponse, NewSourceImage, SourceImage,
    UploadProgress, UploadSession,
};
use pictor_core::{AppError, UploadConfig};
use pictor_db::SourceImageRepository;
use pictor_processing::ImageEncoder;
use pictor_storage::keys::original_key;
use pictor_storage::Storage;
use pictor_worker::TaskPool;

use super::repository::{SessionClaim, UploadSessionRepository};
use crate::producer::DerivativeDispatcher;

/// Bound on a single scratch file write.
const CHUNK_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepted completion plus a way to learn how the background merge ended.
pub struct CompletionHandle {
    pub response: CompleteUploadResponse,
    outcome: oneshot::Receiver<Result<SourceImage, AppError>>,
}

impl CompletionHandle {
    /// Wait for the merge. Callers that only need the acceptance can drop
    /// the handle; the merge still runs.
    pub async fn wait(self) -> Result<SourceImage, AppError> {
        self.outcome.await.map_err(|_| {
            AppError::Internal("Upload merge ended without reporting a result".to_string())
        })?
    }
}

#[derive(Clone)]
pub struct UploadSessionManager {
    sessions: Arc<dyn UploadSessionRepository>,
    sources: Arc<dyn SourceImageRepository>,
    storage: Arc<dyn Storage>,
    dispatcher: Arc<DerivativeDispatcher>,
    pool: Arc<TaskPool>,
    encoder: Arc<dyn ImageEncoder>,
    config: UploadConfig,
}

impl UploadSessionManager {
    pub fn new(
        sessions: Arc<dyn UploadSessionRepository>,
        sources: Arc<dyn SourceImageRepository>,
        storage: Arc<dyn Storage>,
        dispatcher: Arc<DerivativeDispatcher>,
        pool: Arc<TaskPool>,
        encoder: Arc<dyn ImageEncoder>,
        config: UploadConfig,
    ) -> Self {
        Self {
            sessions,
            sources,
            storage,
            dispatcher,
            pool,
            encoder,
            config,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    fn validate_init(&self, request: &InitUploadRequest) -> Result<String, AppError> {
        if request.file_name.trim().is_empty() {
            return Err(AppError::InvalidInput("file_name must not be empty".to_string()));
        }

        let file_hash = request.file_hash.trim().to_lowercase();
        if file_hash.len() != 64 || !file_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::InvalidInput(
                "file_hash must be a hex-encoded SHA-256 digest".to_string(),
            ));
        }

        if request.total_size == 0 {
            return Err(AppError::InvalidInput(
                "total_size must be greater than 0".to_string(),
            ));
        }
        if request.total_size > self.config.max_file_size {
            return Err(AppError::PayloadTooLarge(format!(
                "File size exceeds maximum allowed ({} MB)",
                self.config.max_file_size / 1024 / 1024
            )));
        }

        if request.chunk_size == 0 {
            return Err(AppError::InvalidInput(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if request.chunk_size > self.config.max_chunk_size {
            return Err(AppError::InvalidInput(format!(
                "chunk_size {} exceeds maximum {}",
                request.chunk_size, self.config.max_chunk_size
            )));
        }
        // Small chunks are only allowed when the whole file fits in one
        if request.chunk_size < self.config.min_chunk_size
            && request.chunk_size < request.total_size
        {
            return Err(AppError::InvalidInput(format!(
                "chunk_size {} is below minimum {}",
                request.chunk_size, self.config.min_chunk_size
            )));
        }

        let chunk_count = compute_total_chunks(request.total_size, request.chunk_size);
        if chunk_count > self.config.max_chunk_count {
            return Err(AppError::InvalidInput(format!(
                "Chunk count {} exceeds maximum {}; use a larger chunk_size",
                chunk_count, self.config.max_chunk_count
            )));
        }

        Ok(file_hash)
    }

    /// Start an upload, or short-circuit if the content is already stored.
    #[tracing::instrument(skip(self, request), fields(file_name = %request.file_name))]
    pub async fn init(&self, request: InitUploadRequest) -> Result<InitUploadResponse, AppError> {
        let file_hash = self.validate_init(&request)?;

        if let Some(existing) = self.sources.find_by_hash(&file_hash).await? {
            if self.storage.exists(&existing.storage_key).await? {
                tracing::info!(
                    source_image_id = %existing.id,
                    storage_key = %existing.storage_key,
                    "Instant upload, content already stored"
                );
                return Ok(InitUploadResponse::InstantUpload {
                    instant_upload: true,
                    identifier: existing.storage_key,
                });
            }
            tracing::warn!(
                source_image_id = %existing.id,
                storage_key = %existing.storage_key,
                "Image record exists but its object is missing, uploading again"
            );
        }

        let mut session = UploadSession::new(
            request.file_name,
            file_hash,
            request.total_size,
            request.chunk_size,
            PathBuf::new(),
        );
        session.temp_dir = self
            .config
            .scratch_dir
            .join(session.session_id.to_string());

        tokio::fs::create_dir_all(&session.temp_dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create scratch directory: {}", e)))?;

        let session_id = session.session_id;
        let total_chunks = session.total_chunks;
        let chunk_size = session.chunk_size;
        let temp_dir = session.temp_dir.clone();

        if !self
            .sessions
            .try_insert(session, self.config.max_concurrent_sessions)
            .await?
        {
            remove_scratch(&temp_dir).await;
            return Err(AppError::TemporaryFailure(
                "Too many concurrent upload sessions".to_string(),
            ));
        }

        tracing::info!(
            session_id = %session_id,
            total_size = request.total_size,
            total_chunks,
            chunk_size,
            "Started chunked upload session"
        );

        Ok(InitUploadResponse::Session {
            session_id,
            total_chunks,
            chunk_size,
        })
    }

    /// Store chunk `index`. Re-sending an index replaces the earlier bytes.
    #[tracing::instrument(skip(self, data), fields(chunk_len = data.len()))]
    pub async fn upload_chunk(
        &self,
        session_id: Uuid,
        index: u32,
        data: Bytes,
    ) -> Result<ChunkUploadResponse, AppError> {
        let session = self.get_session(session_id).await?;

        if session.is_processing {
            return Err(AppError::Conflict(format!(
                "Upload session {} is already being completed",
                session_id
            )));
        }
        if index >= session.total_chunks {
            return Err(AppError::InvalidInput(format!(
                "Chunk index {} out of range (total chunks: {})",
                index, session.total_chunks
            )));
        }
        if data.is_empty() {
            return Err(AppError::InvalidInput("Chunk must not be empty".to_string()));
        }
        let limit = session.chunk_size + self.config.chunk_size_tolerance;
        if data.len() as u64 > limit {
            return Err(AppError::PayloadTooLarge(format!(
                "Chunk of {} bytes exceeds declared chunk size {}",
                data.len(),
                session.chunk_size
            )));
        }

        match tokio::time::timeout(
            CHUNK_IO_TIMEOUT,
            write_chunk(&session.temp_dir, index, &data),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(AppError::Internal(format!(
                    "Failed to persist chunk {}: {}",
                    index, e
                )))
            }
            Err(_) => {
                return Err(AppError::TemporaryFailure(format!(
                    "Timed out persisting chunk {}",
                    index
                )))
            }
        }

        let updated = self
            .sessions
            .mark_chunk_received(session_id, index)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Upload session not found: {}", session_id))
            })?;

        tracing::debug!(
            session_id = %session_id,
            index,
            received = updated.received_count(),
            total = updated.total_chunks,
            "Chunk received"
        );

        Ok(ChunkUploadResponse {
            received_count: updated.received_count(),
            total_chunks: updated.total_chunks,
        })
    }

    pub async fn progress(&self, session_id: Uuid) -> Result<UploadProgress, AppError> {
        Ok(self.get_session(session_id).await?.progress())
    }

    /// Accept completion and merge in the background.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, session_id: Uuid) -> Result<CompletionHandle, AppError> {
        let session = match self.sessions.claim_for_completion(session_id).await? {
            SessionClaim::Claimed(session) => session,
            SessionClaim::NotFound => {
                return Err(AppError::NotFound(format!(
                    "Upload session not found: {}",
                    session_id
                )))
            }
            SessionClaim::Incomplete { missing } => {
                return Err(AppError::InvalidInput(format!(
                    "Missing {} chunk(s), first missing index {}",
                    missing.len(),
                    missing.first().copied().unwrap_or_default()
                )))
            }
            SessionClaim::AlreadyProcessing => {
                return Err(AppError::Conflict(format!(
                    "Upload session {} is already being completed",
                    session_id
                )))
            }
        };

        self.sessions.remove(session_id).await?;

        let (tx, rx) = oneshot::channel();
        let manager = self.clone();
        tokio::spawn(async move {
            let temp_dir = session.temp_dir.clone();
            let result = manager.merge(session).await;
            remove_scratch(&temp_dir).await;

            match &result {
                Ok(image) => tracing::info!(
                    session_id = %session_id,
                    source_image_id = %image.id,
                    "Chunked upload completed"
                ),
                Err(e) => {
                    let _span = tracing::warn_span!("upload_merge", session_id = %session_id)
                        .entered();
                    e.report("Chunked upload failed");
                }
            }
            let _ = tx.send(result);
        });

        Ok(CompletionHandle {
            response: CompleteUploadResponse {
                accepted: true,
                session_id,
            },
            outcome: rx,
        })
    }

    async fn merge(&self, session: UploadSession) -> Result<SourceImage, AppError> {
        let mut merged = BytesMut::with_capacity(session.total_size as usize);
        let mut hasher = Sha256::new();

        for index in 0..session.total_chunks {
            let data = tokio::fs::read(chunk_path(&session.temp_dir, index))
                .await
                .map_err(|e| {
                    AppError::Internal(format!("Failed to read chunk {}: {}", index, e))
                })?;
            hasher.update(&data);
            merged.extend_from_slice(&data);
        }

        let actual = hex::encode(hasher.finalize());
        if actual != session.file_hash {
            return Err(AppError::IntegrityFailure {
                expected: session.file_hash,
                actual,
            });
        }

        let data = merged.freeze();
        let extension = extension_of(&session.file_name);
        let storage_key = original_key(&actual, extension.as_deref());
        let content_type = content_type_for(&session.file_name);

        self.storage
            .save(&storage_key, data.clone(), content_type)
            .await?;

        let image = self
            .sources
            .create(NewSourceImage {
                file_name: session.file_name,
                content_type: content_type.to_string(),
                content_hash: actual,
                storage_key,
                file_size: data.len() as i64,
            })
            .await?;

        self.dispatcher.produce_all(&image).await;

        if image.width.is_none() {
            self.read_dimensions(&image, data).await;
        }

        Ok(image)
    }

    async fn read_dimensions(&self, image: &SourceImage, data: Bytes) {
        let encoder = self.encoder.clone();
        let sources = self.sources.clone();
        let image_id = image.id;

        let accepted = self
            .pool
            .submit_detached("read_dimensions", async move {
                let (width, height) = match encoder.read_dimensions(data).await {
                    Ok(dimensions) => dimensions,
                    Err(e) => {
                        // dimensions stay unknown; nothing to retry for bad input
                        AppError::from(e).report("Dimension read failed");
                        return Ok(());
                    }
                };
                sources
                    .set_dimensions(image_id, width as i32, height as i32)
                    .await?;
                tracing::debug!(source_image_id = %image_id, width, height, "Dimensions recorded");
                Ok(())
            })
            .await;

        if !accepted {
            tracing::debug!(source_image_id = %image_id, "Dimension read skipped, pool busy");
        }
    }

    /// Remove sessions older than the expiry together with their scratch
    /// files. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, AppError> {
        let expiry = chrono::Duration::from_std(self.config.session_expiry)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.sweep_created_before(Utc::now() - expiry).await
    }

    pub async fn sweep_created_before(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let expired = self.sessions.remove_expired(cutoff).await?;
        for session in &expired {
            remove_scratch(&session.temp_dir).await;
            tracing::info!(
                session_id = %session.session_id,
                received = session.received_count(),
                total = session.total_chunks,
                "Expired upload session removed"
            );
        }

        let stray = self.sweep_stray_scratch(cutoff).await;
        Ok(expired.len() + stray)
    }

    /// Remove session directories under the scratch root that no live session
    /// owns and that have not been written since `cutoff`. These are left by
    /// a restart or by a merge cut short at shutdown.
    async fn sweep_stray_scratch(&self, cutoff: chrono::DateTime<Utc>) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.config.scratch_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(
                    path = %self.config.scratch_dir.display(),
                    error = %e,
                    "Failed to list scratch directory"
                );
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read scratch directory entry");
                    break;
                }
            };

            let Some(session_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            match self.sessions.get(session_id).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Session lookup failed during sweep");
                    continue;
                }
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => chrono::DateTime::<Utc>::from(modified),
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Scratch entry has no mtime");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            remove_scratch(&entry.path()).await;
            removed += 1;
            tracing::info!(session_id = %session_id, "Stray upload scratch directory removed");
        }
        removed
    }

    async fn get_session(&self, session_id: Uuid) -> Result<UploadSession, AppError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload session not found: {}", session_id)))
    }
}

fn chunk_path(temp_dir: &Path, index: u32) -> PathBuf {
    temp_dir.join(format!("chunk_{:06}", index))
}

/// Write to a unique temporary name then rename over the final one, so a
/// concurrent re-send of the same index never leaves a torn file.
async fn write_chunk(temp_dir: &Path, index: u32, data: &[u8]) -> std::io::Result<()> {
    let final_path = chunk_path(temp_dir, index);
    let tmp_path = temp_dir.join(format!(".chunk_{:06}.{}.tmp", index, Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp_path, data).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp_path, &final_path).await
}

async fn remove_scratch(temp_dir: &Path) {
    if temp_dir.as_os_str().is_empty() {
        return;
    }
    match tokio::fs::remove_dir_all(temp_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %temp_dir.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}
