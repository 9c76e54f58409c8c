//! Local staging area for rendered artifacts

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::RenderError;
use crate::fingerprint::{Fingerprint, fingerprint};

/// An artifact written to the staging directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    /// Location of the staged copy
    pub path: PathBuf,
    /// Fingerprint of the staged bytes
    pub fingerprint: Fingerprint,
    /// Size in bytes
    pub len: usize,
}

/// Directory holding the last rendered copy of every artifact
///
/// Artifacts land at `<component>/<artifact>`. A component name is a single
/// path segment; an artifact name may contain `/` and is staged in
/// subdirectories. Files are left in place after a deployment for
/// inspection.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Use `root` as the staging directory, creating it if needed
    ///
    /// # Errors
    /// Returns `RenderError::Io` if the directory cannot be created
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, RenderError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| RenderError::io(&root, &e))?;
        Ok(Self { root })
    }

    /// Staging directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a staged artifact is written to
    ///
    /// # Errors
    /// Returns `RenderError::InvalidName` if the component is not a single
    /// path segment or the artifact would escape the component directory
    pub fn path_for(&self, component: &str, artifact: &str) -> Result<PathBuf, RenderError> {
        let component_path = Path::new(component);
        if !matches!(
            component_path.components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        ) {
            return Err(RenderError::InvalidName(component.to_string()));
        }

        let artifact_path = Path::new(artifact);
        let mut segments = artifact_path.components().peekable();
        if segments.peek().is_none() || !segments.all(|c| matches!(c, Component::Normal(_))) {
            return Err(RenderError::InvalidName(format!("{component}/{artifact}")));
        }

        Ok(self.root.join(component_path).join(artifact_path))
    }

    /// Write `bytes` and return their fingerprint
    ///
    /// # Errors
    /// Returns `RenderError::InvalidName` for names that cannot be staged and
    /// `RenderError::Io` if the file cannot be written
    pub async fn stage(
        &self,
        component: &str,
        artifact: &str,
        bytes: &[u8],
    ) -> Result<StagedArtifact, RenderError> {
        let path = self.path_for(component, artifact)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RenderError::io(parent, &e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| RenderError::io(&path, &e))?;
        let fingerprint = fingerprint(bytes);

        debug!(
            component,
            artifact,
            fingerprint = fingerprint.short(),
            "staged artifact"
        );

        Ok(StagedArtifact {
            path,
            fingerprint,
            len: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_names_and_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path().join("outputs")).await.unwrap();

        let staged = staging
            .stage("vault", "docker-compose.yml", b"services: {}\n")
            .await
            .unwrap();

        assert_eq!(staged.path, dir.path().join("outputs/vault/docker-compose.yml"));
        assert_eq!(staged.fingerprint, fingerprint(b"services: {}\n"));
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"services: {}\n");
    }

    #[tokio::test]
    async fn test_nested_artifact_names_get_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path()).await.unwrap();

        let nested = staging
            .stage("frr", "etc/frr.conf", b"router bgp 65000\n")
            .await
            .unwrap();
        let flat = staging
            .stage("frr", "etc_frr.conf", b"hostname edge\n")
            .await
            .unwrap();

        assert_eq!(nested.path, dir.path().join("frr/etc/frr.conf"));
        assert_eq!(flat.path, dir.path().join("frr/etc_frr.conf"));
        assert_eq!(std::fs::read(&nested.path).unwrap(), b"router bgp 65000\n");
    }

    #[tokio::test]
    async fn test_underscores_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path()).await.unwrap();

        let first = staging.stage("a_b", "c", b"FIRST").await.unwrap();
        let second = staging.stage("a", "b_c", b"SECOND").await.unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"FIRST");
        assert_eq!(std::fs::read(&second.path).unwrap(), b"SECOND");
    }

    #[tokio::test]
    async fn test_rejects_names_that_leave_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path()).await.unwrap();

        for (component, artifact) in [
            ("a/b", "c"),
            ("..", "c"),
            ("", "c"),
            ("a", "../c"),
            ("a", "/etc/passwd"),
            ("a", ""),
        ] {
            let err = staging.stage(component, artifact, b"x").await.unwrap_err();
            assert!(
                matches!(err, RenderError::InvalidName(_)),
                "{component}/{artifact}: {err}"
            );
        }
    }
}
