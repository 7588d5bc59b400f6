use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored original image. Derivatives are produced from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SourceImage {
    pub id: Uuid,
    pub file_name: String,
    pub content_type: String,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub content_hash: String,
    pub storage_key: String,
    pub file_size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to register a freshly stored original.
#[derive(Debug, Clone)]
pub struct NewSourceImage {
    pub file_name: String,
    pub content_type: String,
    pub content_hash: String,
    pub storage_key: String,
    pub file_size: i64,
}

impl SourceImage {
    /// File extension derived from the original name, lowercased.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.file_name)
    }
}

pub fn extension_of(file_name: &str) -> Option<String> {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Guess a content type from a file name. Unknown extensions map to
/// `application/octet-stream`.
pub fn content_type_for(file_name: &str) -> &'static str {
    match extension_of(file_name).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
