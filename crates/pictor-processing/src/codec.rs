//! Default encoder backed by the `image` and `webp` crates.
//!
//! Decoding and encoding are CPU bound and run on the blocking thread pool.

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;

use pictor_core::models::DerivativeFormat;
use pictor_core::{TaskError, TaskResultExt};

use crate::encoder::{EncodeSettings, EncodedImage, ImageEncoder};

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateEncoder;

impl ImageCrateEncoder {
    pub fn new() -> Self {
        Self
    }

    fn decode(data: &[u8]) -> Result<DynamicImage, TaskError> {
        let reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .permanent()?;
        reader.decode().permanent()
    }

    fn encode_webp(img: &DynamicImage, quality: f32) -> Result<EncodedImage, TaskError> {
        let (width, height) = img.dimensions();
        let rgba_img = img.to_rgba8();

        let encoder = webp::Encoder::from_rgba(&rgba_img, width, height);
        let webp_data = encoder.encode(quality.clamp(0.0, 100.0));

        Ok(EncodedImage {
            bytes: Bytes::copy_from_slice(&webp_data),
            width,
            height,
        })
    }

    /// Fit within a `max_edge` square keeping the aspect ratio. Smaller
    /// originals are not upscaled.
    fn encode_thumbnail(
        img: &DynamicImage,
        max_edge: u32,
        quality: u8,
    ) -> Result<EncodedImage, TaskError> {
        let (width, height) = img.dimensions();
        let resized = if width.max(height) > max_edge {
            img.thumbnail(max_edge, max_edge)
        } else {
            img.clone()
        };

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
        let (width, height) = rgb.dimensions();

        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
        rgb.write_with_encoder(encoder)
            .map_err(|e| TaskError::transient(anyhow::anyhow!("JPEG encoding failed: {}", e)))?;

        Ok(EncodedImage {
            bytes: Bytes::from(buffer),
            width,
            height,
        })
    }

    fn encode_sync(
        data: &[u8],
        format: DerivativeFormat,
        settings: EncodeSettings,
    ) -> Result<EncodedImage, TaskError> {
        let img = Self::decode(data)?;
        match format {
            DerivativeFormat::Webp => Self::encode_webp(&img, settings.webp_quality),
            DerivativeFormat::Thumbnail(max_edge) => {
                Self::encode_thumbnail(&img, max_edge, settings.thumbnail_quality)
            }
        }
    }
}

#[async_trait]
impl ImageEncoder for ImageCrateEncoder {
    #[tracing::instrument(skip(self, source), fields(source_len = source.len()))]
    async fn encode(
        &self,
        source: Bytes,
        format: DerivativeFormat,
        settings: EncodeSettings,
    ) -> Result<EncodedImage, TaskError> {
        let encoded =
            tokio::task::spawn_blocking(move || Self::encode_sync(&source, format, settings))
                .await
                .map_err(|e| TaskError::transient(anyhow::anyhow!("Encoder task failed: {}", e)))??;

        tracing::debug!(
            format = %format,
            width = encoded.width,
            height = encoded.height,
            output_len = encoded.len(),
            "Derivative encoded"
        );
        Ok(encoded)
    }

    async fn read_dimensions(&self, source: Bytes) -> Result<(u32, u32), TaskError> {
        tokio::task::spawn_blocking(move || {
            let reader = ImageReader::new(Cursor::new(&source[..]))
                .with_guessed_format()
                .permanent()?;
            reader.into_dimensions().permanent()
        })
        .await
        .map_err(|e| TaskError::transient(anyhow::anyhow!("Dimension task failed: {}", e)))?
    }
}
