//! Durable progress of migration jobs.
//!
//! # Storage Format
//!
//! ```text
//! checkpoints/
//!   ├── weekly-2024.bin       # bincode MigrationCheckpoint
//!   └── default.bin
//! ```
//!
//! Files are replaced atomically (write to temp, then rename), so a crash
//! while saving leaves the previous checkpoint intact.

use crate::error::{Error, Result};
use crate::types::{now_ms, PagingState};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Progress of one migration job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub job_id: String,
    /// Rows copied so far, over every run of the job.
    pub last_offset: u64,
    /// Where the next page starts; `None` before the first page.
    pub paging_state: Option<PagingState>,
    /// Whether bucket records have been copied.
    pub buckets_copied: bool,
    /// Whether every row has been copied.
    pub completed: bool,
    pub updated_at_ms: u64,
}

impl MigrationCheckpoint {
    /// Checkpoint of a job that has not started.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            last_offset: 0,
            paging_state: None,
            buckets_copied: false,
            completed: false,
            updated_at_ms: now_ms(),
        }
    }
}

/// Trait for checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Load the checkpoint of a job.
    async fn load(&self, job_id: &str) -> Result<Option<MigrationCheckpoint>>;

    /// Save (create or replace) a checkpoint.
    async fn save(&self, checkpoint: &MigrationCheckpoint) -> Result<()>;

    /// Forget a job's progress.
    async fn remove(&self, job_id: &str) -> Result<()>;
}

/// In-memory checkpoint store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, MigrationCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, job_id: &str) -> Result<Option<MigrationCheckpoint>> {
        Ok(self.checkpoints.read().get(job_id).cloned())
    }

    async fn save(&self, checkpoint: &MigrationCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .insert(checkpoint.job_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<()> {
        self.checkpoints.write().remove(job_id);
        Ok(())
    }
}

/// File-based checkpoint store, one bincode file per job.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `base_dir`, creating the directory.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to create {}: {}", base_dir.display(), e)))?;

        Ok(Self { base_dir })
    }

    fn checkpoint_path(&self, job_id: &str) -> Result<PathBuf> {
        let valid = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Checkpoint(format!("invalid job id {job_id:?}")));
        }
        Ok(self.base_dir.join(format!("{job_id}.bin")))
    }

    async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to create temp file: {}", e)))?;
        file.write_all(content)
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to write temp file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to sync temp file: {}", e)))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to rename checkpoint: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, job_id: &str) -> Result<Option<MigrationCheckpoint>> {
        let path = self.checkpoint_path(job_id)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Checkpoint(format!("failed to open checkpoint: {}", e))),
        };

        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to read checkpoint: {}", e)))?;
        let checkpoint = bincode::deserialize(&content)
            .map_err(|e| Error::Checkpoint(format!("corrupt checkpoint {}: {}", path.display(), e)))?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &MigrationCheckpoint) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.job_id)?;
        let content = bincode::serialize(checkpoint)
            .map_err(|e| Error::Checkpoint(format!("failed to serialize checkpoint: {}", e)))?;
        self.atomic_write(&path, &content).await?;

        tracing::debug!(
            job_id = %checkpoint.job_id,
            last_offset = checkpoint.last_offset,
            completed = checkpoint.completed,
            "Saved migration checkpoint"
        );
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<()> {
        let path = self.checkpoint_path(job_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Checkpoint(format!("failed to remove checkpoint: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn checkpoint() -> MigrationCheckpoint {
        MigrationCheckpoint {
            last_offset: 2000,
            paging_state: Some(PagingState(Bytes::from_static(b"\x01\x02\x03"))),
            buckets_copied: true,
            ..MigrationCheckpoint::new("weekly")
        }
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load("weekly").await.unwrap().is_none());

        store.save(&checkpoint()).await.unwrap();
        assert_eq!(store.load("weekly").await.unwrap(), Some(checkpoint()));

        store.remove("weekly").await.unwrap();
        assert!(store.load("weekly").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCheckpointStore::new(dir.path()).await.unwrap();
            store.save(&checkpoint()).await.unwrap();
        }

        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        assert_eq!(store.load("weekly").await.unwrap(), Some(checkpoint()));
        assert!(!dir.path().join("weekly.tmp").exists());

        store.remove("weekly").await.unwrap();
        store.remove("weekly").await.unwrap();
        assert!(store.load("weekly").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_bad_job_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        let err = store.load("../escape").await.unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[tokio::test]
    async fn test_file_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("weekly.bin"), b"\xff").await.unwrap();
        assert!(matches!(store.load("weekly").await, Err(Error::Checkpoint(_))));
    }
}
