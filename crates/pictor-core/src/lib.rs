//! Pictor Core Library
//!
//! Domain models, error types, configuration and pipeline settings shared by
//! every Pictor crate.

pub mod config;
pub mod error;
pub mod models;
pub mod settings;
pub mod storage_types;
pub mod task_error;

// Re-export commonly used types
pub use config::{Config, PoolConfig, UploadConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use settings::{PipelineSettings, SettingsProvider, StaticSettingsProvider};
pub use storage_types::StorageBackend;
pub use task_error::{TaskError, TaskResultExt};
