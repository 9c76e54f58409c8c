//! Trigger snapshots of the last successful run of each step

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::StoreError;

/// What a step looked like the last time it succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Trigger values of that run
    pub triggers: Vec<String>,
    /// Small named results a step wants to keep (never secrets)
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// When the run finished
    pub applied_at: DateTime<Utc>,
}

impl StepRecord {
    /// Record for a run finishing now
    #[must_use]
    pub fn new(triggers: Vec<String>) -> Self {
        Self {
            triggers,
            outputs: BTreeMap::new(),
            applied_at: Utc::now(),
        }
    }

    /// Attach a named output
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// Exclusive hold on one store key, released on drop
pub type KeyGuard = OwnedMutexGuard<()>;

/// One async lock per key
///
/// Entries are never removed; a deployment touches a bounded set of keys.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    /// Wait for exclusive use of `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Keyed store of step snapshots
///
/// Keys are step ids such as `vault/install`. Each call is atomic on its
/// own. A caller that loads a snapshot, acts on it and records the result
/// holds [`TriggerStore::lock`] for the key across the whole cycle, so two
/// engines or bootstraps sharing one store never both act on the same key.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Wait for exclusive use of `key` among everyone sharing this store
    async fn lock(&self, key: &str) -> KeyGuard;

    /// Last snapshot for `key`
    async fn load(&self, key: &str) -> Result<Option<StepRecord>, StoreError>;

    /// Replace the snapshot for `key`
    async fn record(&self, key: &str, record: StepRecord) -> Result<(), StoreError>;

    /// Forget `key`
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store, used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryTriggerStore {
    records: RwLock<HashMap<String, StepRecord>>,
    locks: KeyLocks,
}

impl MemoryTriggerStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether nothing has been recorded
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn lock(&self, key: &str) -> KeyGuard {
        self.locks.lock(key).await
    }

    async fn load(&self, key: &str) -> Result<Option<StepRecord>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn record(&self, key: &str, record: StepRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

/// JSON file store
///
/// The whole map is rewritten on every change through a temporary file and
/// a rename, so a crash leaves either the old or the new state.
#[derive(Debug)]
pub struct FileTriggerStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, StepRecord>>,
    locks: KeyLocks,
}

impl FileTriggerStore {
    /// Open the store at `path`, starting empty if the file does not exist
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be read, or
    /// `StoreError::Corrupt` if it is not a valid state file
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(format!("{}: {e}", path.display()))),
        };

        debug!(path = %path.display(), records = records.len(), "opened trigger store");

        Ok(Self {
            path,
            records: Mutex::new(records),
            locks: KeyLocks::default(),
        })
    }

    /// Location of the state file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, StepRecord>) -> Result<(), StoreError> {
        let io = |e: std::io::Error| StoreError::Io(format!("{}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }

        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl TriggerStore for FileTriggerStore {
    async fn lock(&self, key: &str) -> KeyGuard {
        self.locks.lock(key).await
    }

    async fn load(&self, key: &str) -> Result<Option<StepRecord>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn record(&self, key: &str, record: StepRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let previous = records.insert(key.to_string(), record);
        if let Err(e) = self.persist(&records).await {
            // Keep memory in line with what is on disk
            match previous {
                Some(previous) => records.insert(key.to_string(), previous),
                None => records.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.remove(key).is_some() {
            self.persist(&records).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryTriggerStore::new();
        assert!(store.load("vault/install").await.unwrap().is_none());

        let record = StepRecord::new(vec!["abc".into()]);
        store.record("vault/install", record.clone()).await.unwrap();

        assert_eq!(store.load("vault/install").await.unwrap(), Some(record));
        store.remove("vault/install").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/triggers.json");

        let store = FileTriggerStore::open(&path).await.unwrap();
        let record = StepRecord::new(vec!["abc".into(), "/opt/vault/x".into()])
            .with_output("state", "complete");
        store.record("vault/copy:x", record.clone()).await.unwrap();
        drop(store);

        let reopened = FileTriggerStore::open(&path).await.unwrap();
        assert_eq!(reopened.load("vault/copy:x").await.unwrap(), Some(record));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triggers.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileTriggerStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_key_lock_is_exclusive_per_key() {
        let store = Arc::new(MemoryTriggerStore::new());
        let held = store.lock("vault/bootstrap").await;

        // Other keys are unaffected
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.lock("vault/install"),
        )
        .await;
        assert!(other.is_ok());

        let waiter = tokio::spawn({
            let store = store.clone();
            async move {
                let _guard = store.lock("vault/bootstrap").await;
                store.load("vault/bootstrap").await.unwrap()
            }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        store
            .record("vault/bootstrap", StepRecord::new(vec![]).with_output("state", "attempted"))
            .await
            .unwrap();
        drop(held);

        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen.outputs["state"], "attempted");
    }
}
