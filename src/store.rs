//! Write-once storage for finalized investigations.

use crate::model::{InvestigationId, InvestigationResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A result with this id has already been saved
    #[error("Investigation '{0}' already stored")]
    AlreadyExists(InvestigationId),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keyed storage of finalized investigation results.
///
/// Each id is written exactly once; a second `save` for the same id fails
/// with [`StoreError::AlreadyExists`] and leaves the stored result untouched.
#[async_trait]
pub trait InvestigationStore: Send + Sync {
    async fn save(&self, result: Arc<InvestigationResult>) -> Result<(), StoreError>;

    async fn get(&self, id: &InvestigationId) -> Result<Option<Arc<InvestigationResult>>, StoreError>;

    /// All stored ids, sorted.
    async fn ids(&self) -> Result<Vec<InvestigationId>, StoreError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    results: RwLock<HashMap<InvestigationId, Arc<InvestigationResult>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InvestigationStore for MemoryStore {
    async fn save(&self, result: Arc<InvestigationResult>) -> Result<(), StoreError> {
        let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
        if results.contains_key(&result.id) {
            return Err(StoreError::AlreadyExists(result.id));
        }
        results.insert(result.id, result);
        Ok(())
    }

    async fn get(&self, id: &InvestigationId) -> Result<Option<Arc<InvestigationResult>>, StoreError> {
        let results = self.results.read().unwrap_or_else(PoisonError::into_inner);
        Ok(results.get(id).cloned())
    }

    async fn ids(&self) -> Result<Vec<InvestigationId>, StoreError> {
        let results = self.results.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = results.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

// ============================================================================
// JSON files
// ============================================================================

/// One pretty-printed `<id>.json` file per investigation under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Opens (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &InvestigationId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl InvestigationStore for JsonFileStore {
    async fn save(&self, result: Arc<InvestigationResult>) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(result.as_ref())?;
        let path = self.path_for(&result.id);

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(result.id));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&body).await?;
        file.flush().await?;

        debug!(investigation_id = %result.id, path = %path.display(), "Investigation persisted");
        Ok(())
    }

    async fn get(&self, id: &InvestigationId) -> Result<Option<Arc<InvestigationResult>>, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(Arc::new(serde_json::from_slice(&bytes)?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn ids(&self) -> Result<Vec<InvestigationId>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Foreign json files in the directory are not ours
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<InvestigationId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InvestigationRequest, ModuleOutcome, TargetKind};
    use serde_json::json;

    fn result() -> Arc<InvestigationResult> {
        let request = InvestigationRequest::new(TargetKind::Email, "a@b.com", 1).unwrap();
        let mut result = InvestigationResult::new(InvestigationId::new(), request);
        result.per_module_results.insert(
            "email".into(),
            ModuleOutcome::Success { data: json!({"breaches": 2}), elapsed_ms: 12 },
        );
        Arc::new(result)
    }

    #[tokio::test]
    async fn test_memory_store_is_write_once() {
        let store = MemoryStore::new();
        let first = result();

        store.save(first.clone()).await.unwrap();
        let err = store.save(first.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == first.id));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&first.id).await.unwrap().unwrap().id, first.id);
        assert!(store.get(&InvestigationId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("db")).unwrap();
        let saved = result();

        store.save(saved.clone()).await.unwrap();
        assert!(store.dir().join(format!("{}.json", saved.id)).exists());

        let loaded = store.get(&saved.id).await.unwrap().unwrap();
        assert_eq!(loaded.as_ref(), saved.as_ref());
        assert_eq!(store.ids().await.unwrap(), vec![saved.id]);
    }

    #[tokio::test]
    async fn test_json_store_rejects_second_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let saved = result();

        store.save(saved.clone()).await.unwrap();
        assert!(matches!(
            store.save(saved.clone()).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_json_store_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hi").unwrap();

        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.ids().await.unwrap().is_empty());
    }
}
