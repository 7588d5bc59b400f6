use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use pictor_core::{PoolConfig, SettingsProvider};
use pictor_db::DerivativeRepository;
use pictor_processing::ImageEncoder;
use pictor_storage::Storage;
use pictor_worker::TaskPool;

/// How producers hand tasks to the pool.
#[derive(Debug, Clone, Copy)]
pub struct SubmitPolicy {
    pub attempts: u32,
    pub delay: Duration,
    /// Upper bound for callers that wait for queue space instead of dropping.
    pub block_timeout: Duration,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for SubmitPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            attempts: config.submit_attempts,
            delay: config.submit_retry_delay,
            block_timeout: config.submit_timeout,
        }
    }
}

/// Derivatives with a task sitting in the pool queue.
///
/// An id is added before submission and removed when the task starts, so
/// repeated requests for a derivative that is still waiting do not stack up
/// duplicate tasks behind it.
#[derive(Debug, Default)]
pub struct QueuedDerivatives {
    ids: Mutex<HashSet<Uuid>>,
}

impl QueuedDerivatives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a task for `id` is already queued.
    pub async fn try_mark(&self, id: Uuid) -> bool {
        self.ids.lock().await.insert(id)
    }

    pub async fn clear(&self, id: Uuid) {
        self.ids.lock().await.remove(&id);
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.ids.lock().await.contains(&id)
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Everything a producer or derivative task needs.
#[derive(Clone)]
pub struct DerivativeContext {
    pub derivatives: Arc<dyn DerivativeRepository>,
    pub storage: Arc<dyn Storage>,
    pub encoder: Arc<dyn ImageEncoder>,
    pub pool: Arc<TaskPool>,
    pub settings: Arc<dyn SettingsProvider>,
    pub submit: SubmitPolicy,
    pub queued: Arc<QueuedDerivatives>,
}
