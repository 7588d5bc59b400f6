//! Derivative task error types
//!
//! An encode or store step reports whether retrying could help. Permanent
//! failures (corrupt or unsupported input) are still recorded as `failed`
//! and counted against the retry ceiling; the flag only tells the worker how
//! to log and label them.

use std::fmt;

#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    permanent: bool,
}

impl TaskError {
    /// Input that will never succeed, e.g. an undecodable image.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            permanent: true,
        }
    }

    /// Storage hiccups, timeouts, anything that may pass on the next attempt.
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            permanent: false,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }

    /// Returns true if `err` wraps a permanent [`TaskError`].
    pub fn is_permanent_error(err: &anyhow::Error) -> bool {
        err.downcast_ref::<TaskError>()
            .map(|te| te.is_permanent())
            .unwrap_or(false)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    /// Untyped errors are assumed transient
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

/// Extension trait for Result to mark errors as permanent
pub trait TaskResultExt<T> {
    fn permanent(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn permanent(self) -> Result<T, TaskError> {
        self.map_err(|e| TaskError::permanent(e.into()))
    }
}
