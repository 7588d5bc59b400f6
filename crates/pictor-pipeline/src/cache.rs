//! Read-through cache with stampede protection.
//!
//! On a miss every concurrent caller for the same key awaits one shared
//! backing fetch. The wait is bounded: a caller that runs out of time gets
//! [`AppError::TemporaryFailure`] and the shared fetch is dropped from the
//! in-flight table, so the next caller starts a fresh one.
//!
//! A successful value is written to the store by a detached pool task. The
//! in-flight entry stays until that write lands, so late arrivals reuse the
//! finished fetch instead of starting another one. Failures are never cached.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use pictor_core::AppError;
use pictor_worker::TaskPool;

/// Backing source consulted on a miss.
#[async_trait]
pub trait CacheLoader<V>: Send + Sync {
    async fn load(&self, key: &str) -> Result<V, AppError>;
}

/// Where cached values live.
#[async_trait]
pub trait CacheStore<V>: Send + Sync {
    async fn get(&self, key: &str) -> Option<V>;
    async fn put(&self, key: String, value: V);
    async fn remove(&self, key: &str);
}

/// Bounded in-process store with least-recently-used eviction.
pub struct LruCacheStore<V> {
    inner: Mutex<LruCache<String, V>>,
}

impl<V> LruCacheStore<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> CacheStore<V> for LruCacheStore<V> {
    async fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().await.get(key).cloned()
    }

    async fn put(&self, key: String, value: V) {
        self.inner.lock().await.put(key, value);
    }

    async fn remove(&self, key: &str) {
        self.inner.lock().await.pop(key);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Backing fetches started.
    pub fetches: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    timeouts: AtomicU64,
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, Arc<AppError>>>>;

struct Inflight<V> {
    generation: u64,
    fetch: SharedFetch<V>,
    /// Set by the first caller to see the result; it schedules the store write.
    populating: Arc<AtomicBool>,
}

type InflightTable<V> = Arc<Mutex<HashMap<String, Inflight<V>>>>;

pub struct ReadThroughCache<V> {
    name: &'static str,
    store: Arc<dyn CacheStore<V>>,
    loader: Arc<dyn CacheLoader<V>>,
    pool: Arc<TaskPool>,
    fetch_timeout: Duration,
    inflight: InflightTable<V>,
    next_generation: AtomicU64,
    counters: Counters,
}

impl<V> ReadThroughCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        store: Arc<dyn CacheStore<V>>,
        loader: Arc<dyn CacheLoader<V>>,
        pool: Arc<TaskPool>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            name,
            store,
            loader,
            pool,
            fetch_timeout,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<V, AppError> {
        if let Some(value) = self.store.get(key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let (generation, fetch, populating) = self.join_or_start(key).await;

        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.forget(key, generation).await;
                tracing::warn!(
                    cache = self.name,
                    key = %key,
                    timeout_ms = self.fetch_timeout.as_millis() as u64,
                    "Backing fetch timed out"
                );
                Err(AppError::TemporaryFailure(format!(
                    "Timed out loading {} from {}",
                    key, self.name
                )))
            }
            Ok(Err(e)) => {
                self.forget(key, generation).await;
                Err(rebuild_error(&e))
            }
            Ok(Ok(value)) => {
                if !populating.swap(true, Ordering::AcqRel) {
                    self.schedule_population(key, generation, value.clone())
                        .await;
                }
                Ok(value)
            }
        }
    }

    /// Drop `key` from the store and abandon any in-flight fetch for it.
    pub async fn invalidate(&self, key: &str) {
        self.inflight.lock().await.remove(key);
        self.store.remove(key).await;
        tracing::debug!(cache = self.name, key = %key, "Cache entry invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    async fn join_or_start(&self, key: &str) -> (u64, SharedFetch<V>, Arc<AtomicBool>) {
        let mut inflight = self.inflight.lock().await;
        if let Some(entry) = inflight.get(key) {
            return (
                entry.generation,
                entry.fetch.clone(),
                entry.populating.clone(),
            );
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let loader = self.loader.clone();
        let owned_key = key.to_string();
        let fetch = async move { loader.load(&owned_key).await.map_err(Arc::new) }
            .boxed()
            .shared();
        let populating = Arc::new(AtomicBool::new(false));

        inflight.insert(
            key.to_string(),
            Inflight {
                generation,
                fetch: fetch.clone(),
                populating: populating.clone(),
            },
        );
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cache = self.name, key = %key, generation, "Backing fetch started");

        (generation, fetch, populating)
    }

    /// Remove the in-flight entry if it still belongs to `generation`.
    async fn forget(&self, key: &str, generation: u64) {
        let mut inflight = self.inflight.lock().await;
        if inflight.get(key).map(|e| e.generation) == Some(generation) {
            inflight.remove(key);
        }
    }

    async fn schedule_population(&self, key: &str, generation: u64, value: V) {
        let store = self.store.clone();
        let inflight = self.inflight.clone();
        let owned_key = key.to_string();

        let accepted = self
            .pool
            .submit_detached("cache_populate", async move {
                let mut inflight = inflight.lock().await;
                // Skip if the entry was invalidated or replaced meanwhile
                if inflight.get(&owned_key).map(|e| e.generation) == Some(generation) {
                    store.put(owned_key.clone(), value).await;
                    inflight.remove(&owned_key);
                }
                Ok(())
            })
            .await;

        if !accepted {
            tracing::debug!(cache = self.name, key = %key, "Cache population skipped, pool busy");
            self.forget(key, generation).await;
        }
    }
}

/// Shared fetch results hand out one error to many callers.
fn rebuild_error(err: &AppError) -> AppError {
    match err {
        AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
        AppError::TemporaryFailure(msg) => AppError::TemporaryFailure(msg.clone()),
        AppError::Storage(msg) => AppError::Storage(msg.clone()),
        AppError::InvalidInput(msg) => AppError::InvalidInput(msg.clone()),
        other => AppError::Internal(other.to_string()),
    }
}
