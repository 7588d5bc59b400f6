//! Bounded task pool
//!
//! A fixed set of workers drains a queue of bounded capacity. Producers
//! choose how to react when it is full: retry a few times then drop
//! ([`TaskPool::try_submit_with_retry`]) or wait up to a deadline
//! ([`TaskPool::submit_blocking`]).

pub mod pool;
pub mod task;

pub use pool::{PoolStats, TaskPool, TaskPoolConfig};
pub use task::{DetachedTask, PoolTask};
