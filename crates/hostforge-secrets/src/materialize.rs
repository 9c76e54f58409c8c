//! Writing a secret bundle to the store

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::bundle::SecretBundle;
use crate::error::MaterializeError;
use crate::store::SecretStore;

/// Where the bundle is kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretLayout {
    /// KV v2 mount path
    pub mount: String,
    /// Description used when creating the mount
    pub description: String,
    /// Entry name inside the mount
    pub entry: String,
}

impl Default for SecretLayout {
    fn default() -> Self {
        Self {
            mount: "vault".to_string(),
            description: "Vault related secrets".to_string(),
            entry: "keys".to_string(),
        }
    }
}

/// Reference to a stored secret; safe to print and persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedSecret {
    /// Mount path
    pub mount: String,
    /// Entry name
    pub entry: String,
    /// Version holding the bundle
    pub version: u64,
}

impl OwnedSecret {
    /// API path of the entry, `<mount>/data/<entry>`
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/data/{}", self.mount, self.entry)
    }
}

/// Outcome of a successful materialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// Stored secret
    pub secret: OwnedSecret,
    /// Whether a new version was written
    pub written: bool,
}

/// Store `bundle` under `layout`
///
/// Ensures the mount exists and writes a new version unless the latest one
/// already holds exactly this bundle.
///
/// # Errors
/// Returns a `MaterializeError` carrying the bundle back to the caller when
/// any store call fails.
#[instrument(skip(store, bundle), fields(mount = %layout.mount, entry = %layout.entry))]
pub async fn materialize(
    store: &dyn SecretStore,
    bundle: SecretBundle,
    layout: &SecretLayout,
) -> Result<Materialized, MaterializeError> {
    let data = bundle.to_entry();

    if let Err(e) = store.ensure_mount(&layout.mount, &layout.description).await {
        return Err(MaterializeError::new(e, bundle));
    }

    let latest = match store.read_latest(&layout.mount, &layout.entry).await {
        Ok(latest) => latest,
        Err(e) => return Err(MaterializeError::new(e, bundle)),
    };

    let secret = |version| OwnedSecret {
        mount: layout.mount.clone(),
        entry: layout.entry.clone(),
        version,
    };

    if let Some(latest) = latest
        && latest.data == data
    {
        info!(version = latest.version, "secret bundle already stored");
        return Ok(Materialized {
            secret: secret(latest.version),
            written: false,
        });
    }

    match store.write(&layout.mount, &layout.entry, &data).await {
        Ok(version) => {
            info!(version, "secret bundle stored");
            Ok(Materialized {
                secret: secret(version),
                written: true,
            })
        }
        Err(e) => Err(MaterializeError::new(e, bundle)),
    }
}
