//! Units of work accepted by the pool.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;

/// An opaque unit of work. The pool only knows how to run it.
#[async_trait]
pub trait PoolTask: Send + 'static {
    /// Short label used in logs.
    fn name(&self) -> &str {
        "task"
    }

    async fn execute(self: Box<Self>) -> Result<()>;
}

/// Fire-and-forget work (cache writes, dimension reads) wrapped so it runs
/// under the same backpressure and shutdown drain as derivative tasks.
pub struct DetachedTask {
    name: &'static str,
    future: BoxFuture<'static, Result<()>>,
}

impl DetachedTask {
    pub fn new<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            future: Box::pin(future),
        }
    }
}

#[async_trait]
impl PoolTask for DetachedTask {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(self: Box<Self>) -> Result<()> {
        self.future.await
    }
}
