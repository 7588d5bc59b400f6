//! Pictor Processing
//!
//! Encoding of derivatives from original image bytes. The pipeline only sees
//! the [`ImageEncoder`] trait; [`ImageCrateEncoder`] is the default backend.

#[cfg(feature = "image")]
pub mod codec;
pub mod encoder;

#[cfg(feature = "image")]
pub use codec::ImageCrateEncoder;
pub use encoder::{EncodeSettings, EncodedImage, ImageEncoder};
