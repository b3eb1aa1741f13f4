//! Persistence for [`ChunkedUpload`] records in SQLite.

use crate::{
    models::chunked_upload::ChunkedUpload,
    services::chunked_upload::{UploadError, UploadResult},
};
use sqlx::SqlitePool;
use std::sync::Arc;

const RECORD_COLUMNS: &str = "upload_id, file_id, upload_dir, total_size, upload_offset, \
     last_chunk, upload_name, upload_complete, owner, created_at, updated_at";

#[derive(Clone)]
pub struct UploadRecords {
    db: Arc<SqlitePool>,
}

impl UploadRecords {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, record: &ChunkedUpload) -> UploadResult<()> {
        sqlx::query(
            "INSERT INTO chunked_uploads (
                upload_id, file_id, upload_dir, total_size, upload_offset, last_chunk,
                upload_name, upload_complete, owner, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.upload_id)
        .bind(&record.file_id)
        .bind(&record.upload_dir)
        .bind(record.total_size)
        .bind(record.offset)
        .bind(record.last_chunk)
        .bind(&record.upload_name)
        .bind(record.upload_complete)
        .bind(&record.owner)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, upload_id: &str) -> UploadResult<Option<ChunkedUpload>> {
        let query = format!(
            "SELECT {} FROM chunked_uploads WHERE upload_id = ?",
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, ChunkedUpload>(&query)
            .bind(upload_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(record)
    }

    /// Like [`fetch`](Self::fetch), but a missing record is `UnknownUpload`.
    pub async fn get(&self, upload_id: &str) -> UploadResult<ChunkedUpload> {
        self.fetch(upload_id)
            .await?
            .ok_or_else(|| UploadError::UnknownUpload(upload_id.to_string()))
    }

    /// Persist the state after one accepted chunk.
    ///
    /// The update only applies while the stored offset and chunk count still
    /// equal those of `previous`, so two writers racing on the same expected
    /// offset cannot both commit. Returns `false` when the row had moved on.
    pub async fn commit_chunk(
        &self,
        previous: &ChunkedUpload,
        updated: &ChunkedUpload,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE chunked_uploads
             SET upload_offset = ?, last_chunk = ?, upload_name = ?,
                 upload_complete = ?, updated_at = ?
             WHERE upload_id = ? AND upload_offset = ? AND last_chunk = ?",
        )
        .bind(updated.offset)
        .bind(updated.last_chunk)
        .bind(&updated.upload_name)
        .bind(updated.upload_complete)
        .bind(updated.updated_at)
        .bind(&previous.upload_id)
        .bind(previous.offset)
        .bind(previous.last_chunk)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, upload_id: &str) -> UploadResult<bool> {
        let result = sqlx::query("DELETE FROM chunked_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
