//! src/services/chunk_store.rs
//!
//! ChunkStore: on-disk staging area for chunked uploads. Every upload owns a
//! single directory directly beneath the configured chunk root, and each
//! accepted chunk is one blob in it named `{file_id}_{index}`.
//!
//! Every path is built from an id and confined to the root: the id must be a
//! single plain path component, the joined path is normalized and
//! prefix-checked against the canonical root, and an existing directory is
//! canonicalized again so a symlink cannot redirect writes elsewhere.

use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("chunk root `{0}` is not available")]
    RootUnavailable(String),
    #[error("`{0}` resolves outside the storage root")]
    PathEscapesRoot(String),
    #[error("upload area `{0}` already exists")]
    AreaExists(String),
    #[error("upload area `{0}` does not exist")]
    AreaNotFound(String),
    #[error("chunk {index} not found")]
    ChunkNotFound { index: i64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ChunkStoreResult<T> = Result<T, ChunkStoreError>;

/// Handle on one upload's chunk directory. Only obtainable through
/// [`ChunkStore::area`] or [`ChunkStore::create_upload_area`], so the path it
/// carries has always passed the root confinement check.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadArea {
    upload_dir: String,
    path: PathBuf,
}

impl UploadArea {
    pub fn upload_dir(&self) -> &str {
        &self.upload_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A chunk written under a private name, awaiting promotion or discard.
#[derive(Debug)]
pub struct StagedChunk {
    index: i64,
    path: PathBuf,
    final_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    /// Base directory beneath which every upload area lives.
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical form of the root. Fails if the root is missing or is not a
    /// directory.
    async fn canonical_root(&self) -> ChunkStoreResult<PathBuf> {
        let unavailable = || ChunkStoreError::RootUnavailable(self.root.display().to_string());
        let root = fs::canonicalize(&self.root).await.map_err(|err| {
            debug!("cannot resolve chunk root {}: {}", self.root.display(), err);
            unavailable()
        })?;
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(root),
            _ => Err(unavailable()),
        }
    }

    /// Resolve the area for `upload_dir` without creating it.
    pub async fn area(&self, upload_dir: &str) -> ChunkStoreResult<UploadArea> {
        ensure_plain_component(upload_dir)?;
        let root = self.canonical_root().await?;
        let path = confine(&root, &root.join(upload_dir))?;

        match fs::canonicalize(&path).await {
            Ok(real) if !real.starts_with(&root) || real == root => {
                return Err(ChunkStoreError::PathEscapesRoot(upload_dir.to_string()));
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(ChunkStoreError::Io(err)),
        }

        Ok(UploadArea {
            upload_dir: upload_dir.to_string(),
            path,
        })
    }

    /// Create the area for `upload_dir`. Creation is exclusive: an existing
    /// directory is an error, never reused.
    pub async fn create_upload_area(&self, upload_dir: &str) -> ChunkStoreResult<UploadArea> {
        let area = self.area(upload_dir).await?;
        match fs::create_dir(&area.path).await {
            Ok(()) => {
                debug!("created upload area {}", area.path.display());
                Ok(area)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(ChunkStoreError::AreaExists(upload_dir.to_string()))
            }
            Err(err) => Err(ChunkStoreError::Io(err)),
        }
    }

    pub async fn area_exists(&self, area: &UploadArea) -> bool {
        fs::metadata(&area.path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    fn chunk_path(area: &UploadArea, file_id: &str, index: i64) -> ChunkStoreResult<PathBuf> {
        ensure_plain_component(file_id)?;
        Ok(area.path.join(chunk_file_name(file_id, index)))
    }

    /// Write the bytes of chunk `index` under a name private to this attempt.
    ///
    /// The staged file is fsynced but invisible to readers until
    /// [`ChunkStore::promote_chunk`] renames it over the final name. Two
    /// writers racing for the same index never touch each other's file.
    pub async fn stage_chunk(
        &self,
        area: &UploadArea,
        file_id: &str,
        index: i64,
        data: &[u8],
    ) -> ChunkStoreResult<StagedChunk> {
        let final_path = Self::chunk_path(area, file_id, index)?;
        if !self.area_exists(area).await {
            return Err(ChunkStoreError::AreaNotFound(area.upload_dir.clone()));
        }

        let path = area.path.join(format!(
            ".stage-{}-{}",
            chunk_file_name(file_id, index),
            Uuid::new_v4().simple()
        ));
        if let Err(err) = write_synced(&path, data).await {
            let _ = fs::remove_file(&path).await;
            return Err(ChunkStoreError::Io(err));
        }

        debug!(
            "staged chunk {} ({} bytes) at {}",
            index,
            data.len(),
            path.display()
        );
        Ok(StagedChunk {
            index,
            path,
            final_path,
        })
    }

    /// Move a staged chunk to its final name, replacing any previous blob.
    pub async fn promote_chunk(&self, staged: &StagedChunk) -> ChunkStoreResult<()> {
        fs::rename(&staged.path, &staged.final_path).await?;
        debug!(
            "promoted chunk {} to {}",
            staged.index,
            staged.final_path.display()
        );
        Ok(())
    }

    /// Drop a staged chunk that will not be promoted.
    pub async fn discard_chunk(&self, staged: &StagedChunk) -> ChunkStoreResult<()> {
        match fs::remove_file(&staged.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ChunkStoreError::Io(err)),
        }
    }

    /// Stage and promote in one step.
    #[cfg(test)]
    pub async fn write_chunk(
        &self,
        area: &UploadArea,
        file_id: &str,
        index: i64,
        data: &[u8],
    ) -> ChunkStoreResult<()> {
        let staged = self.stage_chunk(area, file_id, index, data).await?;
        if let Err(err) = self.promote_chunk(&staged).await {
            let _ = self.discard_chunk(&staged).await;
            return Err(err);
        }
        Ok(())
    }

    /// Write, read back and remove a probe file in the root.
    pub async fn check_writable(&self) -> ChunkStoreResult<()> {
        let root = self.canonical_root().await?;
        probe_writable(&root).await?;
        Ok(())
    }

    pub async fn read_chunk(
        &self,
        area: &UploadArea,
        file_id: &str,
        index: i64,
    ) -> ChunkStoreResult<Vec<u8>> {
        let path = Self::chunk_path(area, file_id, index)?;
        fs::read(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ChunkStoreError::ChunkNotFound { index }
            } else {
                ChunkStoreError::Io(err)
            }
        })
    }

    pub async fn chunk_exists(
        &self,
        area: &UploadArea,
        file_id: &str,
        index: i64,
    ) -> ChunkStoreResult<bool> {
        Ok(self.chunk_size(area, file_id, index).await?.is_some())
    }

    /// Size of chunk `index`, or `None` if it is not present.
    pub async fn chunk_size(
        &self,
        area: &UploadArea,
        file_id: &str,
        index: i64,
    ) -> ChunkStoreResult<Option<u64>> {
        let path = Self::chunk_path(area, file_id, index)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ChunkStoreError::Io(err)),
        }
    }

    /// Delete chunk `index`. Deleting a missing chunk is not an error.
    pub async fn delete_chunk(
        &self,
        area: &UploadArea,
        file_id: &str,
        index: i64,
    ) -> ChunkStoreResult<()> {
        let path = Self::chunk_path(area, file_id, index)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed chunk {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ChunkStoreError::Io(err)),
        }
    }

    /// Remove the area directory if it is empty. Returns whether it was
    /// removed.
    pub async fn remove_area(&self, area: &UploadArea) -> ChunkStoreResult<bool> {
        match fs::remove_dir(&area.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => Ok(false),
            Err(err) => Err(ChunkStoreError::Io(err)),
        }
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Round-trip a small file through `dir` to prove it is writable.
pub(crate) async fn probe_writable(dir: &Path) -> io::Result<()> {
    let path = dir.join(format!(".probe-{}", Uuid::new_v4().simple()));
    let written = write_synced(&path, b"probe").await;
    let read_back = match written {
        Ok(()) => fs::read(&path).await,
        Err(err) => Err(err),
    };
    let _ = fs::remove_file(&path).await;
    match read_back {
        Ok(bytes) if bytes == b"probe" => Ok(()),
        Ok(_) => Err(io::Error::other("probe file content mismatch")),
        Err(err) => Err(err),
    }
}

/// Stable blob name for chunk `index` of artifact `file_id`.
pub fn chunk_file_name(file_id: &str, index: i64) -> String {
    format!("{}_{}", file_id, index)
}

/// Accept only names that are exactly one ordinary path component.
///
/// Rejects empty names, separators, `.`/`..`, absolute paths, hidden names
/// (which would clash with temporary files) and control characters.
pub(crate) fn ensure_plain_component(name: &str) -> ChunkStoreResult<()> {
    let reject = || ChunkStoreError::PathEscapesRoot(name.to_string());
    if name.is_empty() || name.starts_with('.') {
        return Err(reject());
    }
    if name
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
    {
        return Err(reject());
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(()),
        _ => Err(reject()),
    }
}

/// Lexically normalize `candidate` and require it to sit strictly beneath
/// `root`. Nothing is clamped: an escaping path is an error.
pub(crate) fn confine(root: &Path, candidate: &Path) -> ChunkStoreResult<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    if normalized.starts_with(root) && normalized != root {
        Ok(normalized)
    } else {
        Err(ChunkStoreError::PathEscapesRoot(
            candidate.display().to_string(),
        ))
    }
}
