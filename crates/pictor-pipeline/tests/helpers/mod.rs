//! Test helpers: an in-memory pipeline wired the way the server wires it.
//!
//! Run from workspace root: `cargo test -p pictor-pipeline`.

#![allow(dead_code)]

pub mod encoder;
pub mod fixtures;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

use pictor_core::models::{
    content_type_for, extension_of, Derivative, DerivativeStatus, NewSourceImage, SourceImage,
};
use pictor_core::{PipelineSettings, StaticSettingsProvider, UploadConfig};
use pictor_db::{
    DerivativeRepository, InMemoryDerivativeRepository, InMemorySourceImageRepository,
    SourceImageRepository,
};
use pictor_pipeline::{
    DerivativeContext, DerivativeDispatcher, DerivativeService, ImageReader,
    InMemoryUploadSessionRepository, OrphanScanner, QueuedDerivatives, RetryScanner,
    SubmitPolicy, UploadSessionManager,
};
use pictor_processing::ImageEncoder;
use pictor_storage::keys::original_key;
use pictor_storage::{MemoryStorage, Storage};
use pictor_worker::{PoolTask, TaskPool, TaskPoolConfig};

use encoder::{Behaviour, FakeEncoder};

pub struct Harness {
    pub derivatives: InMemoryDerivativeRepository,
    pub sources: InMemorySourceImageRepository,
    pub storage: MemoryStorage,
    pub encoder: Arc<dyn ImageEncoder>,
    pub pool: Arc<TaskPool>,
    pub settings: StaticSettingsProvider,
    pub dispatcher: Arc<DerivativeDispatcher>,
    pub ctx: DerivativeContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_encoder(Arc::new(FakeEncoder::new(Behaviour::Succeed)), 2, 64)
    }

    pub fn with_encoder(encoder: Arc<dyn ImageEncoder>, workers: usize, capacity: usize) -> Self {
        let settings = PipelineSettings {
            thumbnail_sizes: vec![150, 300],
            ..PipelineSettings::default()
        };
        Self::build(encoder, workers, capacity, settings)
    }

    pub fn build(
        encoder: Arc<dyn ImageEncoder>,
        workers: usize,
        capacity: usize,
        settings: PipelineSettings,
    ) -> Self {
        let derivatives = InMemoryDerivativeRepository::new();
        let sources = InMemorySourceImageRepository::new();
        let storage = MemoryStorage::new();
        let pool = TaskPool::new(TaskPoolConfig {
            workers,
            queue_capacity: capacity,
            shutdown_grace: Duration::from_secs(5),
        });
        let settings = StaticSettingsProvider::new(settings);

        let ctx = DerivativeContext {
            derivatives: Arc::new(derivatives.clone()),
            storage: Arc::new(storage.clone()),
            encoder: encoder.clone(),
            pool: pool.clone(),
            settings: Arc::new(settings.clone()),
            submit: SubmitPolicy {
                attempts: 2,
                delay: Duration::from_millis(5),
                block_timeout: Duration::from_millis(200),
            },
            queued: Arc::new(QueuedDerivatives::new()),
        };
        let dispatcher = Arc::new(DerivativeDispatcher::new(ctx.clone()));

        Self {
            derivatives,
            sources,
            storage,
            encoder,
            pool,
            settings,
            dispatcher,
            ctx,
        }
    }

    pub fn derivative_repo(&self) -> Arc<dyn DerivativeRepository> {
        Arc::new(self.derivatives.clone())
    }

    pub fn source_repo(&self) -> Arc<dyn SourceImageRepository> {
        Arc::new(self.sources.clone())
    }

    pub fn object_store(&self) -> Arc<dyn Storage> {
        Arc::new(self.storage.clone())
    }

    /// Store an original and register it.
    pub async fn add_source(&self, file_name: &str, data: Bytes) -> SourceImage {
        let hash = fixtures::sha256_hex(&data);
        let extension = extension_of(file_name);
        let storage_key = original_key(&hash, extension.as_deref());
        self.storage
            .save(&storage_key, data.clone(), content_type_for(file_name))
            .await
            .unwrap();
        self.sources
            .create(NewSourceImage {
                file_name: file_name.to_string(),
                content_type: content_type_for(file_name).to_string(),
                content_hash: hash,
                storage_key,
                file_size: data.len() as i64,
            })
            .await
            .unwrap()
    }

    pub fn retry_scanner(&self) -> RetryScanner {
        RetryScanner::new(
            self.derivative_repo(),
            self.source_repo(),
            self.dispatcher.clone(),
            Arc::new(self.settings.clone()),
        )
    }

    pub fn orphan_scanner(&self) -> OrphanScanner {
        OrphanScanner::new(
            self.derivative_repo(),
            self.source_repo(),
            self.dispatcher.clone(),
            Arc::new(self.settings.clone()),
        )
    }

    pub fn service(&self) -> DerivativeService {
        DerivativeService::new(
            self.derivative_repo(),
            self.source_repo(),
            self.dispatcher.clone(),
            Arc::new(self.settings.clone()),
        )
    }

    pub fn reader(&self, fetch_timeout: Duration) -> ImageReader {
        ImageReader::new(
            self.source_repo(),
            self.derivative_repo(),
            self.object_store(),
            self.dispatcher.clone(),
            self.pool.clone(),
            64,
            fetch_timeout,
        )
    }

    pub fn upload_manager(&self, config: UploadConfig) -> UploadSessionManager {
        self.upload_manager_with(InMemoryUploadSessionRepository::new(), config)
    }

    pub fn upload_manager_with(
        &self,
        sessions: InMemoryUploadSessionRepository,
        config: UploadConfig,
    ) -> UploadSessionManager {
        UploadSessionManager::new(
            Arc::new(sessions),
            self.source_repo(),
            self.object_store(),
            self.dispatcher.clone(),
            self.pool.clone(),
            self.encoder.clone(),
            config,
        )
    }

    pub async fn derivative(&self, id: Uuid) -> Derivative {
        self.derivatives.get(id).await.unwrap().expect("derivative exists")
    }

    /// Poll until the derivative reaches `status`.
    pub async fn wait_for_status(&self, id: Uuid, status: DerivativeStatus) -> Derivative {
        for _ in 0..400 {
            let d = self.derivative(id).await;
            if d.status == status {
                return d;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("derivative {} never reached {}", id, status);
    }

    /// Occupy `workers` pool workers until the returned gate is released.
    pub async fn block_workers(&self, workers: usize) -> WorkerGate {
        let gate = Arc::new(Semaphore::new(0));
        for _ in 0..workers {
            assert!(
                self.pool
                    .submit_blocking(
                        Box::new(Blocker { gate: gate.clone() }),
                        Duration::from_secs(1)
                    )
                    .await
            );
        }
        while self.pool.queued() > 0 {
            tokio::task::yield_now().await;
        }
        WorkerGate { gate, workers }
    }

    /// Top the queue up with no-op tasks until it is full.
    pub async fn fill_queue(&self) {
        while self.pool.queued() < self.pool.capacity() {
            assert!(
                self.pool
                    .try_submit_with_retry(Box::new(Noop), 1, Duration::ZERO)
                    .await
            );
        }
    }
}

pub struct WorkerGate {
    gate: Arc<Semaphore>,
    workers: usize,
}

impl WorkerGate {
    pub fn release(&self) {
        self.gate.add_permits(self.workers);
    }
}

/// Upload limits small enough for in-test payloads.
pub fn small_upload_config(scratch: &TempDir) -> UploadConfig {
    UploadConfig {
        scratch_dir: scratch.path().to_path_buf(),
        min_chunk_size: 16,
        max_chunk_size: 1024 * 1024,
        max_chunk_count: 10_000,
        max_file_size: 64 * 1024 * 1024,
        max_concurrent_sessions: 8,
        chunk_size_tolerance: 8,
        ..UploadConfig::default()
    }
}

struct Blocker {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl PoolTask for Blocker {
    fn name(&self) -> &str {
        "blocker"
    }

    async fn execute(self: Box<Self>) -> anyhow::Result<()> {
        let _permit = self.gate.acquire().await?;
        Ok(())
    }
}

struct Noop;

#[async_trait]
impl PoolTask for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}
