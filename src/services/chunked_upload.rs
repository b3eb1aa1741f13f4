//! src/services/chunked_upload.rs
//!
//! ChunkedUploadService: the resumable upload protocol. A client declares
//! the total length of an upload, sends it as offset-addressed chunks in
//! strict order, and may ask for the offset to resume from at any time. Once
//! the last byte arrives the chunks are reassembled into a stored upload.
//!
//! Appends to one upload are serialized by a per-upload lock held across the
//! read-validate-write-commit sequence. Across processes the record commit is
//! a compare-and-swap on the stored offset: each attempt stages its chunk
//! under a private name and only the winner promotes it.

use crate::{
    models::{chunked_upload::ChunkedUpload, stored_upload::StoredUpload},
    services::{
        artifact_store::ArtifactStore,
        chunk_store::{ChunkStore, ChunkStoreError, StagedChunk, UploadArea},
        reassembler::Reassembler,
        upload_records::UploadRecords,
    },
};
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("chunk upload is missing required metadata")]
    MissingMetadata,
    #[error("upload length changed from {expected} to {claimed}")]
    SizeMismatch { expected: i64, claimed: i64 },
    #[error("upload name `{claimed}` does not match `{expected}`")]
    NameMismatch { expected: String, claimed: String },
    #[error("offset {claimed} does not match stored offset {expected}")]
    OffsetMismatch { expected: i64, claimed: i64 },
    #[error("chunk payload is not a byte sequence: {0}")]
    UnsupportedPayload(String),
    #[error("chunk of {length} bytes at offset {offset} overruns upload length {total}")]
    ChunkExceedsTotal { offset: i64, length: i64, total: i64 },
    #[error("upload `{0}` has already received all of its data")]
    UploadAlreadyComplete(String),
    #[error("upload `{0}` has not received all of its data")]
    ReassemblyNotReady(String),
    #[error("upload `{0}` not found")]
    UnknownUpload(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage for upload `{upload_id}` is inconsistent: {reason}")]
    StorageInconsistent { upload_id: String, reason: String },
    #[error("chunk {index} of upload `{upload_id}` is missing")]
    ChunkMissing { upload_id: String, index: i64 },
    #[error("stored artifact is {actual} bytes, expected {expected}")]
    SizeVerificationFailed { expected: i64, actual: i64 },
    #[error("attempt to reassemble incomplete upload `{0}`")]
    IncompleteUpload(String),
    #[error(transparent)]
    ChunkStore(#[from] ChunkStoreError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Body of an append request, classified once by the transport.
#[derive(Debug, Clone)]
pub enum ChunkPayload {
    Binary(Bytes),
    Text(String),
    /// A body that is not raw data, e.g. a JSON document or form.
    Unsupported(String),
}

impl ChunkPayload {
    fn into_bytes(self) -> UploadResult<Bytes> {
        match self {
            Self::Binary(bytes) => Ok(bytes),
            Self::Text(text) => Ok(Bytes::from(text)),
            Self::Unsupported(kind) => Err(UploadError::UnsupportedPayload(kind)),
        }
    }
}

/// Client-claimed metadata and data for one chunk. Every field the client
/// may omit is optional so that omission is reported, not assumed.
#[derive(Debug, Clone)]
pub struct AppendChunk {
    pub offset: Option<i64>,
    pub total_size: Option<i64>,
    pub upload_name: Option<String>,
    pub payload: ChunkPayload,
}

/// One async mutex per upload id. An entry lives only while some task
/// holds or waits for it.
#[derive(Clone, Default)]
struct UploadLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl UploadLocks {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(&self, upload_id: &str) -> UploadLockGuard {
        let lock = self
            .entries()
            .entry(upload_id.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        UploadLockGuard {
            locks: self.clone(),
            upload_id: upload_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries().len()
    }
}

struct UploadLockGuard {
    locks: UploadLocks,
    upload_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UploadLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut entries = self.locks.entries();
        // The map and this guard are the last two owners: nobody is waiting.
        let idle = entries
            .get(&self.upload_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
        if idle {
            entries.remove(&self.upload_id);
        }
    }
}

#[derive(Clone)]
pub struct ChunkedUploadService {
    /// Shared SQLite connection pool used for upload records.
    pub db: Arc<SqlitePool>,

    pub chunks: ChunkStore,

    pub artifacts: ArtifactStore,

    records: UploadRecords,
    reassembler: Reassembler,
    locks: UploadLocks,
}

impl ChunkedUploadService {
    pub fn new(db: Arc<SqlitePool>, chunks: ChunkStore, artifacts: ArtifactStore) -> Self {
        let records = UploadRecords::new(db.clone());
        let reassembler = Reassembler::new(chunks.clone(), artifacts.clone(), records.clone());
        Self {
            db,
            chunks,
            artifacts,
            records,
            reassembler,
            locks: UploadLocks::default(),
        }
    }

    /// Start a chunked upload of `total_size` bytes and return its id.
    ///
    /// The chunk directory is created before the record, so a storage failure
    /// leaves no record behind.
    pub async fn initiate(
        &self,
        total_size: Option<i64>,
        owner: Option<String>,
    ) -> UploadResult<String> {
        let total_size = match total_size {
            Some(size) if size > 0 => size,
            _ => return Err(UploadError::MissingMetadata),
        };

        let upload_id = new_id();
        let file_id = new_id();

        let area = self
            .chunks
            .create_upload_area(&upload_id)
            .await
            .map_err(|err| {
                error!("unable to create chunk storage dir: {}", err);
                UploadError::StorageUnavailable(err.to_string())
            })?;

        let record = ChunkedUpload::new(upload_id.clone(), file_id, total_size, owner);
        if let Err(err) = self.records.insert(&record).await {
            if let Err(cleanup) = self.chunks.remove_area(&area).await {
                warn!("failed to remove chunk dir after insert error: {}", cleanup);
            }
            return Err(err);
        }

        info!(
            "new chunked upload <{}> with total length {} bytes",
            upload_id, total_size
        );
        Ok(upload_id)
    }

    /// Append the next chunk of `upload_id` and echo the id back.
    ///
    /// Either the chunk blob is written and the record advanced, or the
    /// record is left exactly as it was and the same chunk may be retried.
    pub async fn append_chunk(&self, upload_id: &str, chunk: AppendChunk) -> UploadResult<String> {
        let _guard = self.locks.acquire(upload_id).await;
        self.append_locked(upload_id, chunk)
            .await
            .map(|record| record.upload_id)
    }

    async fn append_locked(
        &self,
        upload_id: &str,
        chunk: AppendChunk,
    ) -> UploadResult<ChunkedUpload> {
        let record = self.records.get(upload_id).await?;

        let (Some(offset), Some(total_size), Some(upload_name)) =
            (chunk.offset, chunk.total_size, chunk.upload_name)
        else {
            return Err(UploadError::MissingMetadata);
        };
        if upload_name.is_empty() {
            return Err(UploadError::MissingMetadata);
        }

        if total_size != record.total_size {
            return Err(UploadError::SizeMismatch {
                expected: record.total_size,
                claimed: total_size,
            });
        }

        if record.last_chunk > 0 && record.upload_name.as_deref() != Some(upload_name.as_str()) {
            return Err(UploadError::NameMismatch {
                expected: record.upload_name.clone().unwrap_or_default(),
                claimed: upload_name,
            });
        }

        debug!(
            "handling chunk <{}> for upload <{}> with name <{}>, length <{}>, offset <{}>",
            record.next_chunk(),
            upload_id,
            upload_name,
            total_size,
            offset
        );

        if offset != record.offset {
            error!(
                "offset provided by client <{}> doesn't match the stored offset <{}> for upload <{}>",
                offset, record.offset, upload_id
            );
            return Err(UploadError::OffsetMismatch {
                expected: record.offset,
                claimed: offset,
            });
        }

        let data = chunk.payload.into_bytes()?;

        if record.upload_complete {
            return Err(UploadError::UploadAlreadyComplete(upload_id.to_string()));
        }
        let length = i64::try_from(data.len()).unwrap_or(i64::MAX);
        if length > record.remaining() {
            return Err(UploadError::ChunkExceedsTotal {
                offset,
                length,
                total: record.total_size,
            });
        }

        let area = self.existing_area(&record).await?;
        let index = record.next_chunk();
        let staged = self
            .chunks
            .stage_chunk(&area, &record.file_id, index, &data)
            .await?;

        let mut updated = record.clone();
        updated.upload_name = Some(upload_name);
        updated.last_chunk = index;
        updated.offset += length;
        updated.upload_complete = updated.offset == updated.total_size;
        updated.updated_at = Utc::now();

        // Only the writer that wins the record commit may promote its chunk.
        match self.records.commit_chunk(&record, &updated).await {
            Ok(true) => {}
            Ok(false) => {
                self.discard_staged(upload_id, &staged).await;
                let current = self.records.get(upload_id).await?;
                warn!(
                    "upload <{}> advanced to offset {} while chunk {} was being written",
                    upload_id, current.offset, index
                );
                return Err(UploadError::OffsetMismatch {
                    expected: current.offset,
                    claimed: offset,
                });
            }
            Err(err) => {
                self.discard_staged(upload_id, &staged).await;
                return Err(err);
            }
        }

        if let Err(err) = self.chunks.promote_chunk(&staged).await {
            error!(
                "failed to promote chunk {} of upload <{}>: {}",
                index, upload_id, err
            );
            self.discard_staged(upload_id, &staged).await;
            match self.records.commit_chunk(&updated, &record).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    "upload <{}> moved on before chunk {} could be rolled back",
                    upload_id, index
                ),
                Err(rollback) => error!(
                    "failed to roll back upload <{}> after chunk {}: {}",
                    upload_id, index, rollback
                ),
            }
            return Err(err.into());
        }

        if updated.upload_complete {
            self.reassembler.complete(&updated).await?;
        }
        Ok(updated)
    }

    /// Offset the client should resume from.
    ///
    /// Also checks that the chunk directory and every chunk counted so far
    /// are still on disk, so a resumed upload cannot later fail reassembly on
    /// a chunk that was already gone.
    pub async fn query_resume_offset(&self, upload_id: &str) -> UploadResult<i64> {
        let record = self.records.get(upload_id).await?;
        let area = self.existing_area(&record).await?;

        for index in 1..=record.last_chunk {
            if !self
                .chunks
                .chunk_exists(&area, &record.file_id, index)
                .await?
            {
                return Err(UploadError::StorageInconsistent {
                    upload_id: upload_id.to_string(),
                    reason: format!("chunk {} is missing", index),
                });
            }
        }

        debug!(
            "upload <{}> resumes at offset {} after {} chunks",
            upload_id, record.offset, record.last_chunk
        );
        Ok(record.offset)
    }

    /// Re-run reassembly for an upload that received all of its data but
    /// failed to be stored.
    pub async fn retry_reassembly(&self, upload_id: &str) -> UploadResult<StoredUpload> {
        let _guard = self.locks.acquire(upload_id).await;
        match self.records.get(upload_id).await {
            Ok(record) if !record.upload_complete => {
                Err(UploadError::ReassemblyNotReady(upload_id.to_string()))
            }
            Ok(record) => {
                info!("retrying reassembly of upload <{}>", upload_id);
                self.reassembler.complete(&record).await
            }
            Err(err) => Err(err),
        }
    }

    /// The upload's chunk directory, which must still exist.
    async fn existing_area(&self, record: &ChunkedUpload) -> UploadResult<UploadArea> {
        let inconsistent = |reason: String| UploadError::StorageInconsistent {
            upload_id: record.upload_id.clone(),
            reason,
        };
        let area = match self.chunks.area(&record.upload_dir).await {
            Ok(area) => area,
            Err(ChunkStoreError::RootUnavailable(root)) => {
                return Err(UploadError::StorageUnavailable(root));
            }
            Err(err) => return Err(inconsistent(err.to_string())),
        };
        if !self.chunks.area_exists(&area).await {
            return Err(inconsistent("chunk directory is missing".into()));
        }
        Ok(area)
    }

    async fn discard_staged(&self, upload_id: &str, staged: &StagedChunk) {
        if let Err(err) = self.chunks.discard_chunk(staged).await {
            warn!(
                "failed to discard staged chunk of upload <{}>: {}",
                upload_id, err
            );
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
