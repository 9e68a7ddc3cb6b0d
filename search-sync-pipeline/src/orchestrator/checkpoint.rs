//! Migration checkpoint persistence.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use search_sync_shared::MigrationCursor;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::OrchestratorError;

/// Where the cursor of a running migration is kept between pages.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The saved cursor, if any.
    async fn load(&self) -> Result<Option<MigrationCursor>, OrchestratorError>;

    /// Persist the cursor after a committed page.
    async fn save(&self, cursor: &MigrationCursor) -> Result<(), OrchestratorError>;

    /// Forget the cursor once a migration completes.
    async fn clear(&self) -> Result<(), OrchestratorError>;
}

/// Checkpoints held in memory. Survive orchestrator restarts within a process only.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    cursor: Mutex<Option<MigrationCursor>>,
    saves: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self) -> Result<Option<MigrationCursor>, OrchestratorError> {
        Ok(self.cursor.lock().await.clone())
    }

    async fn save(&self, cursor: &MigrationCursor) -> Result<(), OrchestratorError> {
        *self.cursor.lock().await = Some(cursor.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), OrchestratorError> {
        *self.cursor.lock().await = None;
        Ok(())
    }
}

/// Checkpoints written as JSON to a file.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<MigrationCursor>, OrchestratorError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, cursor: &MigrationCursor) -> Result<(), OrchestratorError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(cursor)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(path = %self.path.display(), pages = cursor.pages, "Saved migration checkpoint");
        Ok(())
    }

    async fn clear(&self) -> Result<(), OrchestratorError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested").join("migration.json"));

        assert_eq!(store.load().await.unwrap(), None);

        let mut cursor = MigrationCursor::start();
        cursor.advance(Some("L42".to_string()), 42, 1);
        store.save(&cursor).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(cursor));
        assert!(!store.temp_path().exists());

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FileCheckpointStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(OrchestratorError::CheckpointError(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = InMemoryCheckpointStore::new();
        let cursor = MigrationCursor::start();

        store.save(&cursor).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cursor));
        assert_eq!(store.save_count(), 1);

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
