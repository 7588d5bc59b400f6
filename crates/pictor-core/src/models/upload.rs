use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

/// `ceil(total_size / chunk_size)`. Zero when `chunk_size` is zero.
pub fn compute_total_chunks(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Live state of a resumable upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: Uuid,
    pub file_name: String,
    /// Client-declared hex SHA-256 of the whole file.
    pub file_hash: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: BTreeSet<u32>,
    pub temp_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub is_processing: bool,
}

impl UploadSession {
    pub fn new(
        file_name: String,
        file_hash: String,
        total_size: u64,
        chunk_size: u64,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            file_name,
            file_hash,
            total_size,
            chunk_size,
            total_chunks: compute_total_chunks(total_size, chunk_size) as u32,
            received_chunks: BTreeSet::new(),
            temp_dir,
            created_at: Utc::now(),
            is_processing: false,
        }
    }

    pub fn received_count(&self) -> u32 {
        self.received_chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    /// Declared length of chunk `index`; only the last chunk may be short.
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size;
        self.total_size.saturating_sub(start).min(self.chunk_size)
    }

    /// Bytes received so far, using declared chunk lengths.
    pub fn uploaded_bytes(&self) -> u64 {
        self.received_chunks
            .iter()
            .map(|i| self.expected_chunk_len(*i))
            .sum()
    }

    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_at < cutoff
    }

    pub fn progress(&self) -> UploadProgress {
        let uploaded_bytes = self.uploaded_bytes();
        let progress_percent = if self.total_size == 0 {
            100.0
        } else {
            uploaded_bytes as f64 / self.total_size as f64 * 100.0
        };
        UploadProgress {
            session_id: self.session_id,
            received_count: self.received_count(),
            total_chunks: self.total_chunks,
            uploaded_bytes,
            total_size: self.total_size,
            progress_percent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_hash: String,
    pub total_size: u64,
    pub chunk_size: u64,
}

/// Either a session to upload into, or an immediate hit on existing content.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum InitUploadResponse {
    Session {
        session_id: Uuid,
        total_chunks: u32,
        chunk_size: u64,
    },
    InstantUpload {
        instant_upload: bool,
        identifier: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChunkUploadResponse {
    pub received_count: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompleteUploadResponse {
    pub accepted: bool,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadProgress {
    pub session_id: Uuid,
    pub received_count: u32,
    pub total_chunks: u32,
    pub uploaded_bytes: u64,
    pub total_size: u64,
    pub progress_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession::new(
            "a.png".to_string(),
            "00".to_string(),
            total_size,
            chunk_size,
            PathBuf::from("/tmp/none"),
        )
    }

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(compute_total_chunks(10_485_761, 1_048_576), 11);
        assert_eq!(compute_total_chunks(9_437_185, 1_048_576), 10);
        assert_eq!(compute_total_chunks(1_048_576, 1_048_576), 1);
        assert_eq!(compute_total_chunks(1, 1_048_576), 1);
        assert_eq!(compute_total_chunks(5, 0), 0);
    }

    #[test]
    fn last_chunk_is_short() {
        let s = session(9_437_185, 1_048_576);
        assert_eq!(s.total_chunks, 10);
        assert_eq!(s.expected_chunk_len(0), 1_048_576);
        assert_eq!(s.expected_chunk_len(9), 1);
        assert_eq!(s.expected_chunk_len(10), 0);
    }

    #[test]
    fn progress_and_completion() {
        let mut s = session(2_500, 1_000);
        assert_eq!(s.missing_chunks(), vec![0, 1, 2]);
        s.received_chunks.insert(2);
        s.received_chunks.insert(0);
        assert!(!s.is_complete());
        assert_eq!(s.uploaded_bytes(), 1_500);
        assert_eq!(s.progress().progress_percent, 60.0);
        s.received_chunks.insert(1);
        assert!(s.is_complete());
    }

    #[test]
    fn init_response_shapes() {
        let instant = InitUploadResponse::InstantUpload {
            instant_upload: true,
            identifier: "originals/ab/abc.png".to_string(),
        };
        let json = serde_json::to_value(&instant).unwrap();
        assert_eq!(json["instant_upload"], true);
        assert_eq!(json["identifier"], "originals/ab/abc.png");

        let id = Uuid::new_v4();
        let created = InitUploadResponse::Session {
            session_id: id,
            total_chunks: 3,
            chunk_size: 1_048_576,
        };
        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json["total_chunks"], 3);
        assert_eq!(json["session_id"], id.to_string());
    }
}
