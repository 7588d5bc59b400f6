//! Shared key generation for storage backends.

use pictor_core::models::DerivativeFormat;
use uuid::Uuid;

use crate::{StorageError, StorageResult};

/// Content-addressed key for an original: `originals/{hash[0..2]}/{hash}.{ext}`.
pub fn original_key(content_hash: &str, extension: Option<&str>) -> String {
    let prefix: String = content_hash.chars().take(2).collect();
    match extension {
        Some(ext) if !ext.is_empty() => format!("originals/{}/{}.{}", prefix, content_hash, ext),
        _ => format!("originals/{}/{}", prefix, content_hash),
    }
}

/// Key for one attempt at producing a derivative. The attempt id keeps a
/// late worker from overwriting the artifact of a fresher attempt.
pub fn derivative_key(source_image_id: Uuid, format: DerivativeFormat, attempt_id: Uuid) -> String {
    format!(
        "derivatives/{}/{}-{}.{}",
        source_image_id,
        format,
        attempt_id,
        format.extension()
    )
}

/// Reject keys that could escape the storage root.
pub fn validate_key(storage_key: &str) -> StorageResult<()> {
    if storage_key.is_empty() || storage_key.contains("..") || storage_key.starts_with('/') {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}
