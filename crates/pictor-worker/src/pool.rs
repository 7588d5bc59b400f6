//! Task pool: fixed workers, bounded queue, submission policies, drain on shutdown.
//!
//! Shutdown: [`TaskPool::shutdown`] stops accepting work, lets the workers
//! finish everything already queued, and waits for them up to the configured
//! grace period. Workers still busy after that are aborted.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use pictor_core::PoolConfig;

use crate::task::{DetachedTask, PoolTask};

#[derive(Clone, Debug)]
pub struct TaskPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl From<&PoolConfig> for TaskPoolConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Counters since the pool started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub accepted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

enum Message {
    Run(Box<dyn PoolTask>),
    Stop,
}

pub struct TaskPool {
    sender: mpsc::Sender<Message>,
    accepting: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    config: TaskPoolConfig,
}

impl TaskPool {
    /// Start `config.workers` workers on the current runtime.
    pub fn new(config: TaskPoolConfig) -> Arc<Self> {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel::<Message>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    Self::worker_loop(worker_id, receiver, counters).await;
                })
            })
            .collect();

        tracing::info!(
            max_workers = workers,
            queue_capacity = capacity,
            "Task pool started"
        );

        Arc::new(Self {
            sender,
            accepting: AtomicBool::new(true),
            workers: Mutex::new(handles),
            counters,
            config,
        })
    }

    async fn worker_loop(
        worker_id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
        counters: Arc<Counters>,
    ) {
        loop {
            let message = receiver.lock().await.recv().await;
            let task = match message {
                Some(Message::Run(task)) => task,
                Some(Message::Stop) | None => break,
            };

            let name = task.name().to_string();
            tracing::trace!(worker_id, task = %name, "Task picked up");

            match AssertUnwindSafe(task.execute()).catch_unwind().await {
                Ok(Ok(())) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(worker_id, task = %name, error = %e, "Pool task failed");
                }
                Err(_) => {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(worker_id, task = %name, "Pool task panicked");
                }
            }
        }

        tracing::debug!(worker_id, "Pool worker stopped");
    }

    fn enqueue(&self, task: Box<dyn PoolTask>) -> Result<(), Option<Box<dyn PoolTask>>> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(None);
        }
        match self.sender.try_send(Message::Run(task)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(Message::Run(task))) => Err(Some(task)),
            Err(_) => Err(None),
        }
    }

    /// Non-blocking enqueue, retried `attempts` times with `delay` between
    /// tries while the queue is full. Returns false if the task was dropped.
    pub async fn try_submit_with_retry(
        &self,
        task: Box<dyn PoolTask>,
        attempts: u32,
        delay: Duration,
    ) -> bool {
        let name = task.name().to_string();
        let attempts = attempts.max(1);
        let mut pending = task;

        for attempt in 1..=attempts {
            match self.enqueue(pending) {
                Ok(()) => {
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(Some(task)) => {
                    pending = task;
                    if attempt < attempts {
                        tracing::debug!(task = %name, attempt, "Task queue full, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(None) => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task = %name, "Task pool is shut down, task discarded");
                    return false;
                }
            }
        }

        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            task = %name,
            attempts,
            "Task queue still full after retries, task discarded"
        );
        false
    }

    /// Wait up to `timeout` for queue space. Returns whether the task was accepted.
    pub async fn submit_blocking(&self, task: Box<dyn PoolTask>, timeout: Duration) -> bool {
        let name = task.name().to_string();
        if !self.accepting.load(Ordering::Acquire) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task = %name, "Task pool is shut down, task rejected");
            return false;
        }

        match self.sender.send_timeout(Message::Run(task), timeout).await {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for task queue space"
                );
                false
            }
        }
    }

    /// Submit fire-and-forget work. Dropped (and logged) if the queue is full.
    pub async fn submit_detached<F>(&self, name: &'static str, future: F) -> bool
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.try_submit_with_retry(Box::new(DetachedTask::new(name, future)), 1, Duration::ZERO)
            .await
    }

    /// Tasks currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting tasks, drain the queue, and wait for workers within the
    /// grace period. Returns true if every worker exited in time.
    pub async fn shutdown(&self) -> bool {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return true;
        }
        tracing::info!(queued = self.queued(), "Initiating task pool shutdown");

        let mut handles = std::mem::take(&mut *self.workers.lock().await);
        let grace = self.config.shutdown_grace;

        let drain = async {
            // Stop markers queue behind pending work, so each worker exits
            // only once everything before them has run.
            for _ in 0..handles.len() {
                if self.sender.send(Message::Stop).await.is_err() {
                    break;
                }
            }
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        };

        let drained = tokio::time::timeout(grace, drain).await.is_ok();
        if drained {
            tracing::info!("Task pool stopped");
            return true;
        }

        for handle in &handles {
            handle.abort();
        }
        tracing::warn!(
            grace_secs = grace.as_secs(),
            "Task pool did not drain within grace period, workers aborted"
        );
        false
    }
}
