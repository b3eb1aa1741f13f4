//! src/services/artifact_store.rs
//!
//! ArtifactStore: final home of reassembled uploads. Payloads are written
//! beneath `base_path/{upload_id}/{file_id}` and described by a row in the
//! `stored_uploads` table.

use crate::{
    models::stored_upload::StoredUpload,
    services::{
        chunk_store::{confine, ensure_plain_component, probe_writable},
        chunked_upload::{UploadError, UploadResult},
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Everything needed to record a completed upload.
#[derive(Debug)]
pub struct NewArtifact<'a> {
    pub upload_id: &'a str,
    pub file_id: &'a str,
    pub upload_name: &'a str,
    pub owner: Option<&'a str>,
    pub data: &'a [u8],
}

#[derive(Clone)]
pub struct ArtifactStore {
    db: Arc<SqlitePool>,

    /// Base directory on disk where artifact payloads are stored.
    base_path: PathBuf,
}

impl ArtifactStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    async fn canonical_base(&self) -> UploadResult<PathBuf> {
        fs::canonicalize(&self.base_path).await.map_err(|err| {
            UploadError::StorageUnavailable(format!(
                "artifact root {}: {}",
                self.base_path.display(),
                err
            ))
        })
    }

    /// Write, read back and remove a probe file in the base path.
    pub async fn check_writable(&self) -> UploadResult<()> {
        let root = self.canonical_base().await?;
        probe_writable(&root).await?;
        Ok(())
    }

    /// Location of an artifact, confined to the base path.
    pub async fn artifact_path(&self, upload_id: &str, file_id: &str) -> UploadResult<PathBuf> {
        ensure_plain_component(upload_id)?;
        ensure_plain_component(file_id)?;
        let root = self.canonical_base().await?;
        Ok(confine(&root, &root.join(upload_id).join(file_id))?)
    }

    /// Write the artifact durably and record it.
    ///
    /// - Writes to a temporary file, fsyncs, then renames into place.
    /// - Upserts the metadata row, so an administrative retry of the same
    ///   upload replaces the previous attempt.
    /// - Removes the payload again if the row cannot be written.
    pub async fn store(&self, artifact: NewArtifact<'_>) -> UploadResult<StoredUpload> {
        let file_path = self
            .artifact_path(artifact.upload_id, artifact.file_id)
            .await?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            UploadError::StorageUnavailable("artifact path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(artifact.data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        let etag = format!("{:x}", md5::compute(artifact.data));
        let insert_result = sqlx::query_as::<_, StoredUpload>(
            r#"
            INSERT INTO stored_uploads (
                upload_id, file_id, upload_name, owner, size_bytes, etag, stored_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(upload_id) DO UPDATE SET
                file_id = excluded.file_id,
                upload_name = excluded.upload_name,
                owner = excluded.owner,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                stored_at = excluded.stored_at
            RETURNING upload_id, file_id, upload_name, owner, size_bytes, etag, stored_at
            "#,
        )
        .bind(artifact.upload_id)
        .bind(artifact.file_id)
        .bind(artifact.upload_name)
        .bind(artifact.owner)
        .bind(artifact.data.len() as i64)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(stored) => {
                debug!(
                    "stored artifact {} ({} bytes) at {}",
                    stored.file_id,
                    stored.size_bytes,
                    file_path.display()
                );
                Ok(stored)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(UploadError::Database(err))
            }
        }
    }

    /// Size of the payload on disk, or `None` if it is missing.
    pub async fn stored_size(&self, stored: &StoredUpload) -> UploadResult<Option<u64>> {
        let path = self.artifact_path(&stored.upload_id, &stored.file_id).await?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(UploadError::Io(err)),
        }
    }

    pub async fn fetch(&self, upload_id: &str) -> UploadResult<Option<StoredUpload>> {
        let stored = sqlx::query_as::<_, StoredUpload>(
            "SELECT upload_id, file_id, upload_name, owner, size_bytes, etag, stored_at
             FROM stored_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn test_store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = ArtifactStore::new(db::test_pool().await, dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn store_writes_payload_and_row() {
        let (_dir, store) = test_store().await;
        let stored = store
            .store(NewArtifact {
                upload_id: "u1",
                file_id: "f1",
                upload_name: "a.txt",
                owner: Some("alice"),
                data: b"0123456789",
            })
            .await
            .unwrap();

        assert_eq!(stored.size_bytes, 10);
        assert_eq!(stored.upload_name, "a.txt");
        assert_eq!(stored.etag, "781e5e245d69b566979b86e28d23f2c7");
        assert_eq!(store.stored_size(&stored).await.unwrap(), Some(10));

        let path = store.artifact_path("u1", "f1").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"0123456789");

        let fetched = store.fetch("u1").await.unwrap().unwrap();
        assert_eq!(fetched.owner.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn storing_again_replaces_previous_attempt() {
        let (_dir, store) = test_store().await;
        let artifact = |data: &'static [u8]| NewArtifact {
            upload_id: "u1",
            file_id: "f1",
            upload_name: "a.txt",
            owner: None,
            data,
        };
        store.store(artifact(b"short")).await.unwrap();
        let stored = store.store(artifact(b"longer data")).await.unwrap();

        assert_eq!(stored.size_bytes, 11);
        assert_eq!(store.stored_size(&stored).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn check_writable_probes_base_path() {
        let (dir, store) = test_store().await;
        store.check_writable().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let gone = ArtifactStore::new(db::test_pool().await, dir.path().join("absent"));
        assert!(matches!(
            gone.check_writable().await,
            Err(UploadError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn crafted_ids_are_rejected() {
        let (_dir, store) = test_store().await;
        assert!(store.artifact_path("../u1", "f1").await.is_err());
        assert!(store.artifact_path("u1", "../../f1").await.is_err());
    }
}
