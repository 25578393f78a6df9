use async_trait::async_trait;
use chrono::{DateTime, Utc};
use models::AccountSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, SyncError};

/// Repository trait for per-account settlement snapshots and the run marker.
/// This abstraction allows swapping between file-based and in-memory storage.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, account_id: &str) -> Result<Option<AccountSnapshot>>;
    /// Persists `snapshot`; its transient scratch is never written.
    async fn save_snapshot(&self, account_id: &str, snapshot: &AccountSnapshot) -> Result<()>;
    async fn last_success(&self) -> Result<Option<DateTime<Utc>>>;
    async fn mark_success(&self, at: DateTime<Utc>) -> Result<()>;
}

/// File-name-safe form of an id. ASCII letters, digits and `-` pass through,
/// every other byte becomes `_XX` (hex), so distinct ids never share a file.
pub(crate) fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02X}"));
        }
    }
    stem
}

#[derive(Debug, Serialize, Deserialize)]
struct LastSuccess {
    last_success_date: DateTime<Utc>,
}

/// File-based implementation: `data_<account>.json` per account plus
/// `last_success.json`, all inside one state directory.
pub struct FileSnapshotStore {
    state_dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    fn snapshot_path(&self, account_id: &str) -> PathBuf {
        self.state_dir.join(format!("data_{}.json", file_stem(account_id)))
    }

    fn marker_path(&self) -> PathBuf {
        self.state_dir.join("last_success.json")
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, path: &Path, content: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_snapshot(&self, account_id: &str) -> Result<Option<AccountSnapshot>> {
        let path = self.snapshot_path(account_id);
        let Some(content) = self.read_optional(&path).await? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| SyncError::Snapshot(format!("{}: {e}", path.display())))?;
        Ok(Some(snapshot))
    }

    async fn save_snapshot(&self, account_id: &str, snapshot: &AccountSnapshot) -> Result<()> {
        let mut stored = snapshot.clone();
        stored.clear_scratch();
        let content = serde_json::to_string_pretty(&stored)?;
        self.write(&self.snapshot_path(account_id), content).await
    }

    async fn last_success(&self) -> Result<Option<DateTime<Utc>>> {
        let path = self.marker_path();
        let Some(content) = self.read_optional(&path).await? else {
            return Ok(None);
        };
        let marker: LastSuccess = serde_json::from_str(&content)
            .map_err(|e| SyncError::Snapshot(format!("{}: {e}", path.display())))?;
        Ok(Some(marker.last_success_date))
    }

    async fn mark_success(&self, at: DateTime<Utc>) -> Result<()> {
        let content = serde_json::to_string_pretty(&LastSuccess { last_success_date: at })?;
        self.write(&self.marker_path(), content).await
    }
}

/// In-memory implementation, handy for embedding and tests.
#[derive(Default, Clone)]
pub struct MemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<String, AccountSnapshot>>>,
    last_success: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_snapshot(self, account_id: &str, snapshot: AccountSnapshot) -> Self {
        self.snapshots.write().await.insert(account_id.to_string(), snapshot);
        self
    }

    pub async fn with_last_success(self, at: DateTime<Utc>) -> Self {
        *self.last_success.write().await = Some(at);
        self
    }

    pub async fn snapshot(&self, account_id: &str) -> Option<AccountSnapshot> {
        self.snapshots.read().await.get(account_id).cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_snapshot(&self, account_id: &str) -> Result<Option<AccountSnapshot>> {
        Ok(self.snapshot(account_id).await)
    }

    async fn save_snapshot(&self, account_id: &str, snapshot: &AccountSnapshot) -> Result<()> {
        let mut stored = snapshot.clone();
        stored.clear_scratch();
        self.snapshots.write().await.insert(account_id.to_string(), stored);
        Ok(())
    }

    async fn last_success(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.last_success.read().await)
    }

    async fn mark_success(&self, at: DateTime<Utc>) -> Result<()> {
        *self.last_success.write().await = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn file_store_round_trips_without_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("state"));

        assert!(store.load_snapshot("card/1").await.unwrap().is_none());
        assert!(store.last_success().await.unwrap().is_none());

        let mut snapshot = AccountSnapshot::default();
        snapshot.fields.insert("balance".to_string(), json!(120.5));
        snapshot.currency_movements = Some(json!([{"amount": 3}]));
        store.save_snapshot("card/1", &snapshot).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("state").join("data_card_2F1.json")).unwrap();
        assert!(!raw.contains("currency_movements"));

        let loaded = store.load_snapshot("card/1").await.unwrap().unwrap();
        assert_eq!(loaded.fields["balance"], json!(120.5));
        assert!(loaded.currency_movements.is_none());

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        store.mark_success(at).await.unwrap();
        assert_eq!(store.last_success().await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn lookalike_account_ids_keep_separate_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        for id in ["card/1", "card_1", "card 1"] {
            let mut snapshot = AccountSnapshot::default();
            snapshot.fields.insert("owner".to_string(), json!(id));
            store.save_snapshot(id, &snapshot).await.unwrap();
        }

        for id in ["card/1", "card_1", "card 1"] {
            let loaded = store.load_snapshot(id).await.unwrap().unwrap();
            assert_eq!(loaded.fields["owner"], json!(id));
        }
        assert!(store.load_snapshot("card-1").await.unwrap().is_none());
    }

    #[test]
    fn file_stems_escape_everything_but_letters_digits_and_dashes() {
        assert_eq!(file_stem("card-1"), "card-1");
        assert_eq!(file_stem("card/1"), "card_2F1");
        assert_eq!(file_stem("card_1"), "card_5F1");
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data_acc.json"), "[1,").unwrap();
        let store = FileSnapshotStore::new(dir.path());

        let err = store.load_snapshot("acc").await.unwrap_err();
        assert!(matches!(err, SyncError::Snapshot(_)));
    }

    #[tokio::test]
    async fn memory_store_strips_scratch() {
        let store = MemorySnapshotStore::new();
        let snapshot = AccountSnapshot {
            currency_movements: Some(json!([])),
            ..Default::default()
        };
        store.save_snapshot("acc", &snapshot).await.unwrap();
        assert!(store.snapshot("acc").await.unwrap().currency_movements.is_none());
    }
}
