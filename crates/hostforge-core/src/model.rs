//! Steps, artifacts and template inputs

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use futures::future::join_all;
use serde::{Serialize, Serializer};

use crate::deferred::{Deferred, DeferredError};

/// Kind of remote operation a step performs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    /// Idempotent environment setup
    Prepare,
    /// Transfer of one named artifact
    Copy(String),
    /// Create script on first run, update script afterwards
    InstallOrUpdate,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Prepare => f.write_str("prepare"),
            StepKind::Copy(artifact) => write!(f, "copy:{artifact}"),
            StepKind::InstallOrUpdate => f.write_str("install"),
        }
    }
}

/// Identifies one step of one component, e.g. `vault/copy:docker-compose.yml`
///
/// The display form doubles as the key under which trigger snapshots are
/// stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId {
    /// Owning component
    pub component: String,
    /// Step kind
    pub kind: StepKind,
}

impl StepId {
    /// Create a step id
    pub fn new(component: impl Into<String>, kind: StepKind) -> Self {
        Self {
            component: component.into(),
            kind,
        }
    }

    /// Prepare step of `component`
    pub fn prepare(component: impl Into<String>) -> Self {
        Self::new(component, StepKind::Prepare)
    }

    /// Copy step for `artifact` of `component`
    pub fn copy(component: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::new(component, StepKind::Copy(artifact.into()))
    }

    /// Install step of `component`
    pub fn install(component: impl Into<String>) -> Self {
        Self::new(component, StepKind::InstallOrUpdate)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.component, self.kind)
    }
}

impl Serialize for StepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One field of a template input record
#[derive(Debug, Clone)]
pub enum Input {
    /// Known at build time
    Value(serde_json::Value),
    /// Resolved while the deployment runs
    Deferred(Deferred<serde_json::Value>),
}

impl From<serde_json::Value> for Input {
    fn from(value: serde_json::Value) -> Self {
        Input::Value(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Input::Value(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Input::Value(serde_json::Value::String(value))
    }
}

impl From<Deferred<serde_json::Value>> for Input {
    fn from(value: Deferred<serde_json::Value>) -> Self {
        Input::Deferred(value)
    }
}

/// Named inputs a template is rendered with
#[derive(Debug, Clone, Default)]
pub struct InputRecord {
    fields: BTreeMap<String, Input>,
}

impl InputRecord {
    /// Empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Input>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Builder form of `insert`
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Input>) -> Self {
        self.insert(key, value);
        self
    }

    /// Copy every field of `other` that is not set here
    pub fn merge_missing(&mut self, other: &InputRecord) {
        for (key, value) in &other.fields {
            self.fields
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Field names
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Wait for every deferred field and build the JSON record
    ///
    /// # Errors
    /// Returns the first field (by name) that failed to resolve
    pub async fn resolve(&self) -> Result<serde_json::Value, (String, DeferredError)> {
        let pending = self.fields.iter().map(|(key, input)| async move {
            let value = match input {
                Input::Value(value) => Ok(value.clone()),
                Input::Deferred(deferred) => deferred.get().await,
            };
            (key.clone(), value)
        });

        let mut record = serde_json::Map::new();
        for (key, value) in join_all(pending).await {
            match value {
                Ok(value) => {
                    record.insert(key, value);
                }
                Err(err) => return Err((key, err)),
            }
        }
        Ok(serde_json::Value::Object(record))
    }
}

/// Where an artifact's bytes come from
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    /// A local file transferred as-is
    Static(PathBuf),
    /// Bytes held in memory
    Bytes(Vec<u8>),
    /// A template rendered with an input record
    Template {
        /// Template name registered with the renderer
        template: String,
        /// Inputs for the template
        inputs: InputRecord,
    },
}

/// A named file destined for the remote host
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Logical name, unique within its component
    pub name: String,
    /// Content source
    pub source: ArtifactSource,
    /// Absolute path on the remote host
    pub destination: PathBuf,
    /// Permission bits
    pub mode: u32,
}

impl Artifact {
    /// Default permission bits for transferred files
    pub const DEFAULT_MODE: u32 = 0o644;

    /// Artifact copied from a local file
    pub fn file(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Static(path.into()),
            destination: destination.into(),
            mode: Self::DEFAULT_MODE,
        }
    }

    /// Artifact with in-memory contents
    pub fn bytes(
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Bytes(bytes.into()),
            destination: destination.into(),
            mode: Self::DEFAULT_MODE,
        }
    }

    /// Artifact rendered from a template
    pub fn template(
        name: impl Into<String>,
        template: impl Into<String>,
        inputs: InputRecord,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Template {
                template: template.into(),
                inputs,
            },
            destination: destination.into(),
            mode: Self::DEFAULT_MODE,
        }
    }

    /// Set permission bits
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_id_display() {
        assert_eq!(StepId::prepare("docker").to_string(), "docker/prepare");
        assert_eq!(
            StepId::copy("vault", "docker-compose.yml").to_string(),
            "vault/copy:docker-compose.yml"
        );
        assert_eq!(StepId::install("frr").to_string(), "frr/install");
    }

    #[tokio::test]
    async fn test_resolve_waits_for_deferred_fields() {
        let (resolver, password) = Deferred::pair();
        let record = InputRecord::new()
            .with("domain", "vpn.example.org")
            .with("admin_password", password);

        resolver.resolve(json!("s3cret"));

        let value = record.resolve().await.unwrap();
        assert_eq!(
            value,
            json!({ "domain": "vpn.example.org", "admin_password": "s3cret" })
        );
    }

    #[tokio::test]
    async fn test_resolve_reports_failed_field() {
        let (resolver, address) = Deferred::<serde_json::Value>::pair();
        let record = InputRecord::new().with("address", address);

        resolver.fail("instance creation failed");

        let (field, err) = record.resolve().await.unwrap_err();
        assert_eq!(field, "address");
        assert!(matches!(err, DeferredError::Failed(_)));
    }

    #[test]
    fn test_merge_missing_keeps_existing() {
        let mut record = InputRecord::new().with("domain", "a.example.org");
        record.merge_missing(
            &InputRecord::new()
                .with("domain", "b.example.org")
                .with("email", "ops@example.org"),
        );
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["domain", "email"]);
    }
}
