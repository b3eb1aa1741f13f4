//! Turns the chunks of a completed upload into a stored artifact.

use crate::{
    models::{chunked_upload::ChunkedUpload, stored_upload::StoredUpload},
    services::{
        artifact_store::{ArtifactStore, NewArtifact},
        chunk_store::{ChunkStore, ChunkStoreError},
        chunked_upload::{UploadError, UploadResult},
        upload_records::UploadRecords,
    },
};
use futures::future::join_all;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Reassembler {
    chunks: ChunkStore,
    artifacts: ArtifactStore,
    records: UploadRecords,
}

impl Reassembler {
    pub fn new(chunks: ChunkStore, artifacts: ArtifactStore, records: UploadRecords) -> Self {
        Self {
            chunks,
            artifacts,
            records,
        }
    }

    /// Concatenate chunks `1..=last_chunk` in order, store the result and
    /// clean up.
    ///
    /// Any failure before the size check passes leaves the chunks and the
    /// record untouched so the upload can be inspected and reassembled again.
    pub async fn complete(&self, record: &ChunkedUpload) -> UploadResult<StoredUpload> {
        if !record.upload_complete {
            error!(
                "attempt to store an incomplete upload with id <{}>",
                record.upload_id
            );
            return Err(UploadError::IncompleteUpload(record.upload_id.clone()));
        }
        let upload_name = record
            .upload_name
            .as_deref()
            .ok_or_else(|| UploadError::IncompleteUpload(record.upload_id.clone()))?;

        let area = self.chunks.area(&record.upload_dir).await?;

        let mut data = Vec::with_capacity(usize::try_from(record.total_size).unwrap_or(0));
        for index in 1..=record.last_chunk {
            match self.chunks.read_chunk(&area, &record.file_id, index).await {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(ChunkStoreError::ChunkNotFound { index }) => {
                    error!(
                        "chunk file not found for chunk <{}> of upload <{}>",
                        index, record.upload_id
                    );
                    return Err(UploadError::ChunkMissing {
                        upload_id: record.upload_id.clone(),
                        index,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        let stored = self
            .artifacts
            .store(NewArtifact {
                upload_id: &record.upload_id,
                file_id: &record.file_id,
                upload_name,
                owner: record.owner.as_deref(),
                data: &data,
            })
            .await?;

        let actual = match self.artifacts.stored_size(&stored).await? {
            Some(size) => i64::try_from(size).unwrap_or(i64::MAX),
            None => {
                error!("stored artifact for upload <{}> not found", record.upload_id);
                0
            }
        };
        if actual != record.total_size {
            error!(
                "stored artifact for upload <{}> is {} bytes, expected {}",
                record.upload_id, actual, record.total_size
            );
            return Err(UploadError::SizeVerificationFailed {
                expected: record.total_size,
                actual,
            });
        }

        self.records.delete(&record.upload_id).await?;

        let deletions = (1..=record.last_chunk)
            .map(|index| self.chunks.delete_chunk(&area, &record.file_id, index));
        for (index, result) in (1..=record.last_chunk).zip(join_all(deletions).await) {
            if let Err(err) = result {
                warn!(
                    "failed to delete chunk {} of upload <{}>: {}",
                    index, record.upload_id, err
                );
            }
        }
        if let Err(err) = self.chunks.remove_area(&area).await {
            warn!(
                "failed to remove chunk directory for upload <{}>: {}",
                record.upload_id, err
            );
        }

        info!(
            "upload <{}> reassembled from {} chunks into {} ({} bytes)",
            record.upload_id, record.last_chunk, stored.file_id, stored.size_bytes
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    struct Fixture {
        _chunk_dir: tempfile::TempDir,
        _artifact_dir: tempfile::TempDir,
        chunks: ChunkStore,
        artifacts: ArtifactStore,
        records: UploadRecords,
        reassembler: Reassembler,
    }

    async fn fixture() -> Fixture {
        let db = db::test_pool().await;
        let chunk_dir = tempfile::tempdir().unwrap();
        let artifact_dir = tempfile::tempdir().unwrap();
        let chunks = ChunkStore::new(chunk_dir.path());
        let artifacts = ArtifactStore::new(db.clone(), artifact_dir.path());
        let records = UploadRecords::new(db);
        let reassembler = Reassembler::new(chunks.clone(), artifacts.clone(), records.clone());
        Fixture {
            _chunk_dir: chunk_dir,
            _artifact_dir: artifact_dir,
            chunks,
            artifacts,
            records,
            reassembler,
        }
    }

    /// A record that has received `parts` as consecutive chunks.
    async fn staged(fx: &Fixture, parts: &[&[u8]]) -> ChunkedUpload {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut record = ChunkedUpload::new("u1", "f1", total as i64, Some("bob".into()));
        let area = fx.chunks.create_upload_area(&record.upload_dir).await.unwrap();
        for (i, part) in parts.iter().enumerate() {
            fx.chunks
                .write_chunk(&area, &record.file_id, i as i64 + 1, part)
                .await
                .unwrap();
        }
        record.offset = total as i64;
        record.last_chunk = parts.len() as i64;
        record.upload_name = Some("a.txt".into());
        record.upload_complete = true;
        fx.records.insert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn complete_concatenates_in_order_and_cleans_up() {
        let fx = fixture().await;
        let record = staged(&fx, &[b"abc", b"", b"defg", b"hij"]).await;

        let stored = fx.reassembler.complete(&record).await.unwrap();
        assert_eq!(stored.size_bytes, 10);
        assert_eq!(stored.upload_name, "a.txt");
        assert_eq!(stored.owner.as_deref(), Some("bob"));

        let path = fx.artifacts.artifact_path("u1", "f1").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abcdefghij");

        assert!(fx.records.fetch("u1").await.unwrap().is_none());
        let area = fx.chunks.area("u1").await.unwrap();
        for index in 1..=4 {
            assert!(!fx.chunks.chunk_exists(&area, "f1", index).await.unwrap());
        }
    }

    #[tokio::test]
    async fn incomplete_record_is_refused() {
        let fx = fixture().await;
        let mut record = staged(&fx, &[b"abc"]).await;
        record.upload_complete = false;

        let err = fx.reassembler.complete(&record).await.unwrap_err();
        assert!(matches!(err, UploadError::IncompleteUpload(_)));
        assert!(fx.artifacts.fetch("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_chunk_is_named_and_nothing_is_deleted() {
        let fx = fixture().await;
        let record = staged(&fx, &[b"ab", b"cd", b"ef"]).await;
        let area = fx.chunks.area("u1").await.unwrap();
        std::fs::remove_file(area.path().join("f1_2")).unwrap();

        let err = fx.reassembler.complete(&record).await.unwrap_err();
        assert!(matches!(err, UploadError::ChunkMissing { index: 2, .. }));

        assert!(fx.records.fetch("u1").await.unwrap().is_some());
        assert!(fx.chunks.chunk_exists(&area, "f1", 1).await.unwrap());
        assert!(fx.chunks.chunk_exists(&area, "f1", 3).await.unwrap());
        assert!(fx.artifacts.fetch("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn size_mismatch_keeps_chunks() {
        let fx = fixture().await;
        let record = staged(&fx, &[b"abcde", b"fghij"]).await;
        let area = fx.chunks.area("u1").await.unwrap();
        std::fs::write(area.path().join("f1_1"), b"abc").unwrap();

        let err = fx.reassembler.complete(&record).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::SizeVerificationFailed {
                expected: 10,
                actual: 8
            }
        ));
        assert!(fx.records.fetch("u1").await.unwrap().is_some());
        assert!(fx.chunks.chunk_exists(&area, "f1", 1).await.unwrap());
        assert!(fx.chunks.chunk_exists(&area, "f1", 2).await.unwrap());
    }
}
