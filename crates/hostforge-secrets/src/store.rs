//! Versioned key/value secret stores

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::SecretStoreError;

/// Latest version of a stored entry
#[derive(Clone, PartialEq, Eq)]
pub struct VersionedEntry {
    /// Version number assigned by the store, starting at 1
    pub version: u64,
    /// Key/value pairs of that version
    pub data: BTreeMap<String, String>,
}

impl fmt::Debug for VersionedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedEntry")
            .field("version", &self.version)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A secret store with mounts of versioned entries
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create `mount` if it does not exist
    async fn ensure_mount(&self, mount: &str, description: &str) -> Result<(), SecretStoreError>;

    /// Latest version of `entry`, `None` if it was never written
    async fn read_latest(
        &self,
        mount: &str,
        entry: &str,
    ) -> Result<Option<VersionedEntry>, SecretStoreError>;

    /// Write a new version of `entry` and return its number
    async fn write(
        &self,
        mount: &str,
        entry: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<u64, SecretStoreError>;
}

type Versions = Vec<BTreeMap<String, String>>;

/// In-process store for tests and local runs
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    mounts: Mutex<HashMap<String, HashMap<String, Versions>>>,
    unavailable: AtomicBool,
}

impl MemorySecretStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `SecretStoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of versions written to `entry`
    pub async fn versions(&self, mount: &str, entry: &str) -> usize {
        self.mounts
            .lock()
            .await
            .get(mount)
            .and_then(|m| m.get(entry))
            .map_or(0, Vec::len)
    }

    /// Whether `mount` exists
    pub async fn has_mount(&self, mount: &str) -> bool {
        self.mounts.lock().await.contains_key(mount)
    }

    fn check_available(&self) -> Result<(), SecretStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SecretStoreError::Unavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn ensure_mount(&self, mount: &str, _description: &str) -> Result<(), SecretStoreError> {
        self.check_available()?;
        self.mounts
            .lock()
            .await
            .entry(mount.to_string())
            .or_default();
        Ok(())
    }

    async fn read_latest(
        &self,
        mount: &str,
        entry: &str,
    ) -> Result<Option<VersionedEntry>, SecretStoreError> {
        self.check_available()?;
        let mounts = self.mounts.lock().await;
        let versions = mounts
            .get(mount)
            .ok_or_else(|| SecretStoreError::MountNotFound(mount.to_string()))?
            .get(entry);

        Ok(versions.and_then(|v| {
            v.last().map(|data| VersionedEntry {
                version: v.len() as u64,
                data: data.clone(),
            })
        }))
    }

    async fn write(
        &self,
        mount: &str,
        entry: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<u64, SecretStoreError> {
        self.check_available()?;
        let mut mounts = self.mounts.lock().await;
        let versions = mounts
            .get_mut(mount)
            .ok_or_else(|| SecretStoreError::MountNotFound(mount.to_string()))?
            .entry(entry.to_string())
            .or_default();
        versions.push(data.clone());
        Ok(versions.len() as u64)
    }
}
