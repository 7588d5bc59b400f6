//! Pictor Pipeline
//!
//! The background half of the service:
//!
//! - producers that create derivative records and queue encode tasks
//! - the derivative task that claims, encodes, stores and completes
//! - retry and orphan scanners that reconcile failed or stuck records
//! - a read-through cache with single-flight fetches
//! - resumable chunked uploads that feed new originals into the producers

pub mod cache;
pub mod context;
pub mod orphan_scanner;
pub mod producer;
pub mod reader;
pub mod retry_scanner;
pub mod scanner;
pub mod service;
pub mod task;
pub mod upload;

pub use cache::{CacheLoader, CacheStats, CacheStore, LruCacheStore, ReadThroughCache};
pub use context::{DerivativeContext, QueuedDerivatives, SubmitPolicy};
pub use orphan_scanner::OrphanScanner;
pub use producer::{DerivativeDispatcher, DerivativeProducer, DispatchOutcome, Submission};
pub use reader::{ImageContent, ImageReader};
pub use retry_scanner::RetryScanner;
pub use scanner::{spawn_periodic, PeriodicJob, ScanReport};
pub use service::DerivativeService;
pub use task::{DerivativeTask, TaskOutcome};
pub use upload::{
    CompletionHandle, InMemoryUploadSessionRepository, SessionClaim, SessionSweeper,
    UploadSessionManager, UploadSessionRepository,
};
