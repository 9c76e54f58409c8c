//! One-time initialization of the secret service
//!
//! Progress is kept in the trigger store under `<component>/bootstrap` with
//! an output named `state`:
//!
//! - `attempted`: the script may have run but no bundle was recovered. The
//!   service is possibly initialized, so the script is never run again.
//! - `extracted`: the bundle was recovered but not stored. It waits in the
//!   rescue file and the next run only retries storing it.
//! - `complete`: the bundle is stored; `mount`, `entry` and `version` name it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{error, info, instrument, warn};

use hostforge_core::{DEFAULT_INSTALL_TIMEOUT, StepRecord, TriggerStore};
use hostforge_exec::RemoteExecutor;

use crate::bundle::SecretBundle;
use crate::error::{BootstrapError, SecretStoreError};
use crate::extract::extract_bundle;
use crate::materialize::{OwnedSecret, SecretLayout, materialize};
use crate::store::SecretStore;

/// Opens the secret store once the root token is known
pub type StoreConnector =
    Arc<dyn Fn(&SecretBundle) -> Result<Arc<dyn SecretStore>, SecretStoreError> + Send + Sync>;

const STATE: &str = "state";
const ATTEMPTED: &str = "attempted";
const EXTRACTED: &str = "extracted";
const COMPLETE: &str = "complete";

/// Runs the initialization script at most once and stores its secrets
pub struct SecretBootstrap {
    component: String,
    script: String,
    timeout: Duration,
    layout: SecretLayout,
    rescue_path: PathBuf,
    executor: Arc<dyn RemoteExecutor>,
    state: Arc<dyn TriggerStore>,
    connect: StoreConnector,
}

impl std::fmt::Debug for SecretBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBootstrap")
            .field("component", &self.component)
            .field("timeout", &self.timeout)
            .field("layout", &self.layout)
            .field("rescue_path", &self.rescue_path)
            .field("executor", &self.executor.executor_type())
            .finish_non_exhaustive()
    }
}

impl SecretBootstrap {
    /// Bootstrap for `component` running `script` through `executor`
    ///
    /// The rescue file defaults to `<component>-secrets.rescue.json` in the
    /// working directory.
    pub fn new(
        component: impl Into<String>,
        script: impl Into<String>,
        executor: Arc<dyn RemoteExecutor>,
        state: Arc<dyn TriggerStore>,
        connect: StoreConnector,
    ) -> Self {
        let component = component.into();
        let rescue_path = PathBuf::from(format!("{component}-secrets.rescue.json"));
        Self {
            component,
            script: script.into(),
            timeout: DEFAULT_INSTALL_TIMEOUT,
            layout: SecretLayout::default(),
            rescue_path,
            executor,
            state,
            connect,
        }
    }

    /// Limit the script run time
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Store the bundle somewhere other than `vault/keys`
    #[must_use]
    pub fn layout(mut self, layout: SecretLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Where an unstored bundle is kept between runs
    #[must_use]
    pub fn rescue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rescue_path = path.into();
        self
    }

    /// Component this bootstrap belongs to
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    fn state_key(&self) -> String {
        format!("{}/bootstrap", self.component)
    }

    /// Run, resume or confirm the bootstrap
    ///
    /// # Errors
    /// See `BootstrapError`. After `Extraction` or `InitFailed` every later
    /// call fails with `PreviouslyAttempted` until the state is cleared by
    /// hand. After `Materialize` the bundle is in the rescue file and a later
    /// call retries storing it without running the script.
    ///
    /// Bootstraps sharing a state store take turns on the component's key,
    /// so a concurrent call sees the state the first one left behind.
    #[instrument(skip(self), fields(component = %self.component))]
    pub async fn run(&self) -> Result<OwnedSecret, BootstrapError> {
        let key = self.state_key();
        let _guard = self.state.lock(&key).await;

        if let Some(record) = self.state.load(&key).await? {
            return match record.outputs.get(STATE).map(String::as_str) {
                Some(COMPLETE) => {
                    let secret = owned_secret(&record)?;
                    info!(path = %secret.path(), version = secret.version, "secrets already stored");
                    Ok(secret)
                }
                Some(EXTRACTED) => {
                    info!(rescue = %self.rescue_path.display(), "retrying storage of rescued secrets");
                    let bundle = self.read_rescue().await?;
                    self.store(bundle).await
                }
                Some(ATTEMPTED) => Err(BootstrapError::PreviouslyAttempted {
                    component: self.component.clone(),
                }),
                Some(other) => Err(BootstrapError::CorruptState(format!(
                    "{key}: unknown state {other}"
                ))),
                None => Err(BootstrapError::CorruptState(format!("{key}: missing state"))),
            };
        }

        self.state
            .record(&key, StepRecord::new(Vec::new()).with_output(STATE, ATTEMPTED))
            .await?;

        info!(timeout = ?self.timeout, "running bootstrap script");
        let result = match self
            .executor
            .run_with_timeout(&self.script, self.timeout)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                if e.before_execution() {
                    self.state.remove(&key).await?;
                }
                error!(error = %e, "bootstrap script could not run");
                return Err(e.into());
            }
        };

        if !result.success() {
            error!(status = result.status, "bootstrap script failed");
            return Err(BootstrapError::InitFailed {
                status: result.status,
            });
        }

        let bundle = extract_bundle(&result.combined_output()).inspect_err(|e| {
            error!(error = %e, "could not recover secrets from bootstrap output");
        })?;
        info!("secret bundle recovered");

        self.store(bundle).await
    }

    async fn store(&self, bundle: SecretBundle) -> Result<OwnedSecret, BootstrapError> {
        let key = self.state_key();

        let outcome = match (self.connect)(&bundle) {
            Ok(store) => materialize(store.as_ref(), bundle, &self.layout)
                .await
                .map_err(|e| e.into_parts()),
            Err(e) => Err((e, bundle)),
        };

        match outcome {
            Ok(materialized) => {
                let secret = materialized.secret;
                self.state
                    .record(
                        &key,
                        StepRecord::new(Vec::new())
                            .with_output(STATE, COMPLETE)
                            .with_output("mount", secret.mount.clone())
                            .with_output("entry", secret.entry.clone())
                            .with_output("version", secret.version.to_string()),
                    )
                    .await?;
                self.discard_rescue().await;
                Ok(secret)
            }
            Err((source, bundle)) => {
                warn!(error = %source, "secret store rejected bundle, keeping rescue copy");
                self.write_rescue(&bundle).await?;
                self.state
                    .record(&key, StepRecord::new(Vec::new()).with_output(STATE, EXTRACTED))
                    .await?;
                Err(BootstrapError::Materialize {
                    source,
                    rescue: self.rescue_path.clone(),
                })
            }
        }
    }

    async fn write_rescue(&self, bundle: &SecretBundle) -> Result<(), BootstrapError> {
        use std::os::unix::fs::PermissionsExt;

        let path = &self.rescue_path;
        let rescue_err = |message: String| BootstrapError::Rescue {
            path: path.clone(),
            message,
        };

        let bytes =
            serde_json::to_vec_pretty(&bundle.to_entry()).map_err(|e| rescue_err(e.to_string()))?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| rescue_err(e.to_string()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .await
            .map_err(|e| rescue_err(e.to_string()))?;
        // An existing file keeps its old mode on open
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| rescue_err(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| rescue_err(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| rescue_err(e.to_string()))?;

        Ok(())
    }

    async fn read_rescue(&self) -> Result<SecretBundle, BootstrapError> {
        let path = &self.rescue_path;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| BootstrapError::Rescue {
                path: path.clone(),
                message: e.to_string(),
            })?;
        serde_json::from_slice::<BTreeMap<String, String>>(&bytes)
            .ok()
            .and_then(|entry| SecretBundle::from_entry(&entry))
            .ok_or_else(|| BootstrapError::Rescue {
                path: path.clone(),
                message: "not a complete secret bundle".to_string(),
            })
    }

    async fn discard_rescue(&self) {
        match tokio::fs::remove_file(&self.rescue_path).await {
            Ok(()) => info!(rescue = %self.rescue_path.display(), "removed rescue file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(rescue = %self.rescue_path.display(), error = %e, "could not remove rescue file"),
        }
    }

    /// Location of the rescue file
    #[must_use]
    pub fn rescue_file(&self) -> &Path {
        &self.rescue_path
    }
}

fn owned_secret(record: &StepRecord) -> Result<OwnedSecret, BootstrapError> {
    let field = |name: &str| {
        record
            .outputs
            .get(name)
            .cloned()
            .ok_or_else(|| BootstrapError::CorruptState(format!("completed bootstrap lacks {name}")))
    };
    let version = field("version")?
        .parse()
        .map_err(|_| BootstrapError::CorruptState("version is not a number".to_string()))?;
    Ok(OwnedSecret {
        mount: field("mount")?,
        entry: field("entry")?,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_secret_from_record() {
        let record = StepRecord::new(Vec::new())
            .with_output(STATE, COMPLETE)
            .with_output("mount", "vault")
            .with_output("entry", "keys")
            .with_output("version", "2");

        let secret = owned_secret(&record).unwrap();
        assert_eq!(secret.path(), "vault/data/keys");
        assert_eq!(secret.version, 2);
    }

    #[test]
    fn test_owned_secret_rejects_bad_version() {
        let record = StepRecord::new(Vec::new())
            .with_output("mount", "vault")
            .with_output("entry", "keys")
            .with_output("version", "two");

        assert!(matches!(
            owned_secret(&record),
            Err(BootstrapError::CorruptState(_))
        ));
    }
}
