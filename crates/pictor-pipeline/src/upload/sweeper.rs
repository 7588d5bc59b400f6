use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::scanner::{PeriodicJob, ScanReport};

use super::manager::UploadSessionManager;

/// Periodically drops upload sessions past their expiry, completed or not.
pub struct SessionSweeper {
    manager: Arc<UploadSessionManager>,
}

impl SessionSweeper {
    pub fn new(manager: Arc<UploadSessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl PeriodicJob for SessionSweeper {
    fn name(&self) -> &'static str {
        "upload_session_sweeper"
    }

    async fn interval(&self) -> Duration {
        self.manager.config().sweep_interval
    }

    async fn run_once(&self) -> Result<ScanReport> {
        let removed = self.manager.sweep_expired().await?;
        Ok(ScanReport {
            found: removed,
            handled: removed,
            ..ScanReport::default()
        })
    }
}
