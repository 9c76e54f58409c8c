//! Random values created on the first run and reused afterwards
//!
//! Values live in a JSON file readable only by the owner. Reusing them keeps
//! rendered artifacts, and so their fingerprints, stable across runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::info;

use crate::config::GeneratedSpec;

/// Generated values by name
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GeneratedValues {
    values: BTreeMap<String, String>,
}

impl std::fmt::Debug for GeneratedValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedValues")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GeneratedValues {
    /// Load `path` and create whatever `specs` names that is missing
    ///
    /// Existing values are kept even if their configured length changed.
    /// Values no longer configured are dropped.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or written
    pub fn load_or_create(path: &Path, specs: &BTreeMap<String, GeneratedSpec>) -> Result<Self> {
        let mut stored: BTreeMap<String, String> = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .wrap_err_with(|| format!("invalid generated values file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("failed to read {}", path.display()));
            }
        };

        let before = stored.len();
        stored.retain(|name, _| specs.contains_key(name));
        let mut changed = stored.len() != before;

        for (name, spec) in specs {
            if !stored.contains_key(name) {
                info!(name = %name, length = spec.length(), "generating value");
                stored.insert(name.clone(), random_value(spec.length()));
                changed = true;
            }
        }

        if changed {
            write_private(path, &serde_json::to_vec_pretty(&stored)?)?;
        }

        Ok(Self { values: stored })
    }

    /// Value by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Every value by name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of values
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no values
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn random_value(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let tmp: PathBuf = path.with_extension("json.tmp");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .wrap_err_with(|| format!("failed to write {}", tmp.display()))?;
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path).wrap_err_with(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
