//! Pipeline settings
//!
//! Producers and scanners poll a [`SettingsProvider`] on every pass instead of
//! capturing values at start-up, so an operator can flip a derivative off or
//! widen a scan interval without restarting workers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::models::{DerivativeFormat, DerivativeKind, MAX_RETRY_BACKOFF};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub webp_enabled: bool,
    /// Lossy quality, 0-100.
    pub webp_quality: f32,
    pub thumbnails_enabled: bool,
    /// Longest edge in pixels, one derivative per entry.
    pub thumbnail_sizes: Vec<u32>,
    pub thumbnail_quality: u8,
    /// Automatic retry ceiling for failed derivatives.
    pub max_retries: i32,
    pub retry_base_backoff: Duration,
    pub retry_backoff_cap: Duration,
    pub retry_scan_interval: Duration,
    pub retry_batch_size: i64,
    pub orphan_scan_interval: Duration,
    /// A `processing` record untouched for longer than this is an orphan.
    pub orphan_stale_after: Duration,
    pub orphan_batch_size: i64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            webp_enabled: true,
            webp_quality: 80.0,
            thumbnails_enabled: true,
            thumbnail_sizes: vec![150, 300, 600],
            thumbnail_quality: 85,
            max_retries: 3,
            retry_base_backoff: Duration::from_secs(30),
            retry_backoff_cap: MAX_RETRY_BACKOFF,
            retry_scan_interval: Duration::from_secs(60),
            retry_batch_size: 100,
            orphan_scan_interval: Duration::from_secs(5 * 60),
            orphan_stale_after: Duration::from_secs(10 * 60),
            orphan_batch_size: 100,
        }
    }
}

impl PipelineSettings {
    /// Formats the producer of `kind` should currently generate.
    pub fn target_formats(&self, kind: DerivativeKind) -> Vec<DerivativeFormat> {
        match kind {
            DerivativeKind::Conversion if self.webp_enabled => vec![DerivativeFormat::Webp],
            DerivativeKind::Thumbnail if self.thumbnails_enabled => self
                .thumbnail_sizes
                .iter()
                .map(|px| DerivativeFormat::Thumbnail(*px))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_enabled(&self, format: DerivativeFormat) -> bool {
        match format {
            DerivativeFormat::Webp => self.webp_enabled,
            DerivativeFormat::Thumbnail(_) => self.thumbnails_enabled,
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !(0.0..=100.0).contains(&self.webp_quality) {
            return Err(anyhow::anyhow!("WEBP_QUALITY must be between 0 and 100"));
        }
        if self.thumbnail_quality == 0 || self.thumbnail_quality > 100 {
            return Err(anyhow::anyhow!("THUMBNAIL_QUALITY must be between 1 and 100"));
        }
        if self.thumbnail_sizes.contains(&0) {
            return Err(anyhow::anyhow!("THUMBNAIL_SIZES must be positive"));
        }
        if self.max_retries < 0 {
            return Err(anyhow::anyhow!("DERIVATIVE_MAX_RETRIES must not be negative"));
        }
        if self.retry_scan_interval.is_zero() || self.orphan_scan_interval.is_zero() {
            return Err(anyhow::anyhow!("Scan intervals must be greater than zero"));
        }
        if self.retry_batch_size <= 0 || self.orphan_batch_size <= 0 {
            return Err(anyhow::anyhow!("Scan batch sizes must be greater than zero"));
        }
        Ok(())
    }
}

/// Source of the current [`PipelineSettings`].
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn current(&self) -> PipelineSettings;
}

/// In-process settings holder that can be updated at runtime.
#[derive(Clone, Default)]
pub struct StaticSettingsProvider {
    inner: Arc<RwLock<PipelineSettings>>,
}

impl StaticSettingsProvider {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PipelineSettings),
    {
        let mut guard = self.inner.write().await;
        f(&mut guard);
        tracing::info!(
            webp_enabled = guard.webp_enabled,
            thumbnails_enabled = guard.thumbnails_enabled,
            max_retries = guard.max_retries,
            "Pipeline settings updated"
        );
    }
}

#[async_trait]
impl SettingsProvider for StaticSettingsProvider {
    async fn current(&self) -> PipelineSettings {
        self.inner.read().await.clone()
    }
}
