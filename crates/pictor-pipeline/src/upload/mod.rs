//! Resumable chunked uploads

pub mod manager;
pub mod repository;
pub mod sweeper;

pub use manager::{CompletionHandle, UploadSessionManager};
pub use repository::{InMemoryUploadSessionRepository, SessionClaim, UploadSessionRepository};
pub use sweeper::SessionSweeper;
