//! Represents an in-flight chunked upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted state of one chunked upload, from initiation until the chunks
/// have been reassembled into a stored upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ChunkedUpload {
    /// Opaque identifier handed back to the client as the resume handle.
    pub upload_id: String,

    /// Identifier of the artifact this upload will become.
    pub file_id: String,

    /// Subdirectory of the chunk root holding this upload's chunks.
    pub upload_dir: String,

    /// Declared total length in bytes. Fixed at initiation.
    pub total_size: i64,

    /// Bytes persisted so far; the offset the next chunk must claim.
    #[sqlx(rename = "upload_offset")]
    pub offset: i64,

    /// Number of chunks persisted so far.
    pub last_chunk: i64,

    /// Filename declared by the first chunk.
    pub upload_name: Option<String>,

    /// Set once `offset == total_size`.
    pub upload_complete: bool,

    /// Uploading principal, `None` for anonymous uploads.
    pub owner: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ChunkedUpload {
    /// A fresh record with nothing received yet.
    pub fn new(
        upload_id: impl Into<String>,
        file_id: impl Into<String>,
        total_size: i64,
        owner: Option<String>,
    ) -> Self {
        let upload_id = upload_id.into();
        let now = Utc::now();
        Self {
            upload_dir: upload_id.clone(),
            upload_id,
            file_id: file_id.into(),
            total_size,
            offset: 0,
            last_chunk: 0,
            upload_name: None,
            upload_complete: false,
            owner,
            created_at: now,
            updated_at: now,
        }
    }

    /// Index the next accepted chunk will be stored under (1-based).
    pub fn next_chunk(&self) -> i64 {
        self.last_chunk + 1
    }

    /// Bytes still expected before the upload is complete.
    pub fn remaining(&self) -> i64 {
        self.total_size - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_empty() {
        let record = ChunkedUpload::new("abc", "def", 10, None);
        assert_eq!(record.upload_dir, "abc");
        assert_eq!(record.offset, 0);
        assert_eq!(record.last_chunk, 0);
        assert_eq!(record.next_chunk(), 1);
        assert_eq!(record.remaining(), 10);
        assert!(record.upload_name.is_none());
        assert!(!record.upload_complete);
    }
}
