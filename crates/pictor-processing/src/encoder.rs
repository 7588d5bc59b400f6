use async_trait::async_trait;
use bytes::Bytes;

use pictor_core::models::DerivativeFormat;
use pictor_core::{PipelineSettings, TaskError};

/// Quality knobs taken from the settings snapshot at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeSettings {
    pub webp_quality: f32,
    pub thumbnail_quality: u8,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for EncodeSettings {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            webp_quality: settings.webp_quality,
            thumbnail_quality: settings.thumbnail_quality,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Turns original bytes into a derivative.
///
/// Undecodable or unsupported input must be reported with
/// [`TaskError::permanent`]; anything else is treated as transient.
#[async_trait]
pub trait ImageEncoder: Send + Sync {
    async fn encode(
        &self,
        source: Bytes,
        format: DerivativeFormat,
        settings: EncodeSettings,
    ) -> Result<EncodedImage, TaskError>;

    /// Width and height of an original.
    async fn read_dimensions(&self, source: Bytes) -> Result<(u32, u32), TaskError>;
}
