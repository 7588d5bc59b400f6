//! Data models for the derivative pipeline
//!
//! Derivative records and their lifecycle, stored originals, and the
//! ephemeral chunked-upload sessions that produce them.

mod derivative;
mod source_image;
mod upload;

pub use derivative::*;
pub use source_image::*;
pub use upload::*;
