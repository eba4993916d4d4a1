//! Engine state persistence.
//!
//! The engine is in-memory; a `StateStore` captures and restores the whole of
//! it as an `EngineSnapshot`. The server loads a snapshot at startup and
//! writes one on shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::{EmergencyStop, EntityNode, QuotaEngine, UsageRecord};
use crate::types::{Error, Result};

/// Current snapshot layout version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable image of all engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub entities: Vec<EntityNode>,
    pub usage: Vec<UsageRecord>,
    pub stops: Vec<EmergencyStop>,
}

/// Where snapshots live.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<EngineSnapshot>>;
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// JSON file store. Writes go to a sibling temp file and are renamed into
/// place, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<EngineSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::storage(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            Error::storage(format!("decoding {}: {e}", self.path.display()))
        })?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("creating {}: {e}", parent.display())))?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::storage(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::storage(format!("renaming into {}: {e}", self.path.display())))?;
        Ok(())
    }
}

/// Restore `engine` from `store`. Returns false when the store was empty.
pub async fn load_into(engine: &QuotaEngine, store: &dyn StateStore) -> Result<bool> {
    match store.load().await? {
        Some(snapshot) => {
            engine.restore(snapshot)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Snapshot `engine` into `store`.
pub async fn persist(engine: &QuotaEngine, store: &dyn StateStore) -> Result<()> {
    let snapshot = engine.snapshot();
    let entities = snapshot.entities.len();
    store.save(&snapshot).await?;
    tracing::info!(entities, "engine_state_saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{QuotaUpdate, ResourceDimension::Workflows};
    use crate::types::{ActorId, EngineConfig, EntityId};

    fn populated() -> QuotaEngine {
        let engine = QuotaEngine::new(EngineConfig::default());
        engine
            .create_organization(
                &ActorId::must("admin"),
                &EntityId::must("acme"),
                &QuotaUpdate::new().with(Workflows, 10),
            )
            .unwrap();
        engine
            .authorize(&EntityId::must("acme"), Workflows, 3)
            .unwrap()
            .into_result()
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("engine.json"));
        let engine = populated();

        persist(&engine, &store).await.unwrap();
        assert!(!store.temp_path().exists());

        let restored = QuotaEngine::new(EngineConfig::default());
        assert!(load_into(&restored, &store).await.unwrap());
        assert_eq!(
            restored
                .get_current_usage(&EntityId::must("acme"), Workflows)
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        let engine = QuotaEngine::new(EngineConfig::default());
        assert!(!load_into(&engine, &store).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = JsonFileStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut store = MockStateStore::new();
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(Error::storage("disk full")));

        let err = persist(&populated(), &store).await.unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_loaded_snapshot_is_validated() {
        let mut snapshot = populated().snapshot();
        snapshot.version = 99;
        let mut store = MockStateStore::new();
        store
            .expect_load()
            .returning(move || Ok(Some(snapshot.clone())));

        let engine = QuotaEngine::new(EngineConfig::default());
        let err = load_into(&engine, &store).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
