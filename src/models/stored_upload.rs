//! Represents a completed upload produced by reassembling chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A reassembled artifact. Stores its metadata, not the content bytes, which
/// live on disk under the artifact root.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredUpload {
    /// Upload id the artifact was produced from.
    pub upload_id: String,

    /// Artifact identifier; also the on-disk filename.
    pub file_id: String,

    /// Filename declared by the client.
    pub upload_name: String,

    /// Uploading principal, if any.
    pub owner: Option<String>,

    /// Size in bytes as written.
    pub size_bytes: i64,

    /// MD5 checksum of the content.
    pub etag: String,

    pub stored_at: DateTime<Utc>,
}
