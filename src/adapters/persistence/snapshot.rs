//! Snapshot Store - Atomic JSON Store Persistence
//!
//! Saves store snapshots to `store.json` using atomic writes
//! (write to tmp file, then rename). This guarantees crash safety
//! and prevents partial writes from corrupting state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, instrument};

use super::memory::StoreSnapshot;

/// Atomic JSON snapshot store for crash recovery.
///
/// State is written to a temporary file first, then atomically
/// renamed to `store.json`. The file is always either the old or the
/// new version, never a partial write.
pub struct SnapshotStore {
    /// Path to store.json.
    path: PathBuf,
    /// Temporary path for atomic writes.
    tmp_path: PathBuf,
}

impl SnapshotStore {
    /// Create a snapshot store in the given data directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .context("Failed to create data directory")?;

        Ok(Self {
            path: dir.join("store.json"),
            tmp_path: dir.join("store.json.tmp"),
        })
    }

    /// Save a snapshot atomically (tmp → rename).
    #[instrument(skip(self, snapshot), fields(head = snapshot.head_sequence))]
    pub async fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot).context("Failed to serialize snapshot")?;

        fs::write(&self.tmp_path, &json)
            .await
            .context("Failed to write tmp snapshot file")?;

        fs::rename(&self.tmp_path, &self.path)
            .await
            .context("Failed to rename snapshot file")?;

        info!(
            path = %self.path.display(),
            markets = snapshot.markets.len(),
            trades = snapshot.ledger.len(),
            "Store snapshot saved"
        );

        Ok(())
    }

    /// Load the most recent snapshot.
    ///
    /// Returns `None` if no snapshot exists (first startup).
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            info!("No snapshot found, starting fresh");
            return Ok(None);
        }

        let json = fs::read(&self.path)
            .await
            .context("Failed to read snapshot file")?;

        let snapshot: StoreSnapshot =
            serde_json::from_slice(&json).context("Failed to parse snapshot JSON")?;

        info!(
            markets = snapshot.markets.len(),
            accounts = snapshot.accounts.len(),
            head = snapshot.head_sequence,
            "Store snapshot loaded"
        );

        Ok(Some(snapshot))
    }

    /// Check if the data directory is writable.
    pub async fn is_healthy(&self) -> bool {
        let probe = self.path.with_extension("health_check");
        let result = fs::write(&probe, b"ok").await;
        let _ = fs::remove_file(&probe).await;
        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::persistence::MemoryStore;
    use crate::domain::Market;
    use crate::ports::store::MarketStore;

    #[tokio::test]
    async fn test_load_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(store.is_healthy().await);
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotStore::new(dir.path()).await.unwrap();

        let memory = MemoryStore::new();
        let market = Market::new(
            "m1",
            "Who wins?",
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            25.0,
        )
        .unwrap();
        memory.create_market(market).await.unwrap();
        memory.ensure_account(&"carol".to_string(), 500.0).await.unwrap();

        let snapshot = memory.snapshot();
        snapshots.save(&snapshot).await.unwrap();
        let loaded = snapshots.load().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!dir.path().join("store.json.tmp").exists());
    }
}
