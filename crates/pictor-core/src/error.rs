//! Error types module
//!
//! All caller-facing failures are unified under [`AppError`]. Each variant
//! self-describes its machine code, retryability and log level through
//! [`ErrorMetadata`], so background jobs can report an error without
//! matching on variants themselves.
//!
//! `NotFound` and `TemporaryFailure` are separate: the first is a definitive
//! answer, the second means "try again" and must never be cached.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

use crate::task_error::TaskError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected errors like validation failures
    Debug,
    /// Recoverable issues like a full queue
    Warn,
    /// Unexpected failures
    Error,
}

pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "TEMPORARY_FAILURE")
    fn error_code(&self) -> &'static str;

    /// Whether the caller may retry the same request
    fn is_recoverable(&self) -> bool;

    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Temporary failure: {0}")]
    TemporaryFailure(String),

    #[error("Task failed permanently: {0}")]
    PermanentTaskFailure(String),

    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed errors that were wrapped on their way through anyhow
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(err) => AppError::InternalWithSource {
                message: err.to_string(),
                source: err,
            },
        }
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        if err.is_permanent() {
            AppError::PermanentTaskFailure(err.to_string())
        } else {
            AppError::TemporaryFailure(err.to_string())
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

/// Static metadata for each variant: (error_code, recoverable, log_level).
fn app_error_static_metadata(err: &AppError) -> (&'static str, bool, LogLevel) {
    match err {
        AppError::Database(_) => ("DATABASE_ERROR", true, LogLevel::Error),
        AppError::Storage(_) => ("STORAGE_ERROR", true, LogLevel::Error),
        AppError::NotFound(_) => ("NOT_FOUND", false, LogLevel::Debug),
        AppError::TemporaryFailure(_) => ("TEMPORARY_FAILURE", true, LogLevel::Warn),
        AppError::PermanentTaskFailure(_) => ("PERMANENT_TASK_FAILURE", false, LogLevel::Warn),
        AppError::IntegrityFailure { .. } => ("INTEGRITY_FAILURE", false, LogLevel::Warn),
        AppError::InvalidInput(_) => ("INVALID_INPUT", false, LogLevel::Debug),
        AppError::PayloadTooLarge(_) => ("PAYLOAD_TOO_LARGE", false, LogLevel::Debug),
        AppError::Conflict(_) => ("CONFLICT", false, LogLevel::Debug),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => {
            ("INTERNAL_ERROR", true, LogLevel::Error)
        }
    }
}

impl AppError {
    /// Get the error type name for detailed error responses
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::Storage(_) => "Storage",
            AppError::NotFound(_) => "NotFound",
            AppError::TemporaryFailure(_) => "TemporaryFailure",
            AppError::PermanentTaskFailure(_) => "PermanentTaskFailure",
            AppError::IntegrityFailure { .. } => "IntegrityFailure",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::PayloadTooLarge(_) => "PayloadTooLarge",
            AppError::Conflict(_) => "Conflict",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, AppError::TemporaryFailure(_))
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }

    /// Log at the level the variant asks for, with its code and cause chain.
    pub fn report(&self, context: &str) {
        let error_type = self.error_type();
        let code = self.error_code();
        let details = self.detailed_message();
        match self.log_level() {
            LogLevel::Debug => {
                tracing::debug!(error = %details, error_type, code, context, "Error occurred");
            }
            LogLevel::Warn => {
                tracing::warn!(error = %details, error_type, code, context, "Error occurred");
            }
            LogLevel::Error => {
                tracing::error!(error = %details, error_type, code, context, "Error occurred");
            }
        }
    }
}

impl ErrorMetadata for AppError {
    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).2
    }
}
