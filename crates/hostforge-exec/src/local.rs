//! Local command execution using `tokio::process`

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, instrument};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::RemoteExecutor;

/// Local command executor
///
/// Executes scripts on the local machine. Copies land under `root` when one
/// is set, which turns absolute remote paths into paths inside a sandbox
/// directory.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    root: Option<PathBuf>,
}

impl LocalExecutor {
    /// Create a new local executor writing copies to their literal paths
    #[must_use]
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Create a local executor that places copies below `root`
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Map a remote destination onto the local filesystem
    fn local_path(&self, destination: &Path) -> PathBuf {
        match &self.root {
            Some(root) => root.join(destination.strip_prefix("/").unwrap_or(destination)),
            None => destination.to_path_buf(),
        }
    }

    #[instrument(skip(self, script), level = "debug")]
    async fn execute(&self, script: &str) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(root) = &self.root {
            command.current_dir(root);
        }

        let child = command
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let duration = start.elapsed();

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(status = status, duration = ?duration, "local script completed");

        if !output.status.success() {
            error!(status = status, "local script failed");
        }

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(&self, script: &str) -> Result<CommandResult, ExecError> {
        self.execute(script).await
    }

    async fn run_with_timeout(
        &self,
        script: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        match timeout(timeout_duration, self.execute(script)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "local script timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    #[instrument(skip(self, contents), fields(destination = %destination.display()))]
    async fn copy(
        &self,
        contents: &[u8],
        destination: &Path,
        mode: u32,
    ) -> Result<(), ExecError> {
        use std::os::unix::fs::PermissionsExt;

        let target = self.local_path(destination);
        let copy_failed = |e: std::io::Error| ExecError::CopyFailed {
            destination: destination.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(copy_failed)?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(copy_failed)?;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(copy_failed)?;

        debug!(bytes = contents.len(), "copied file locally");
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let executor = LocalExecutor::new();
        let result = executor.run("echo hello").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let executor = LocalExecutor::new();
        let result = executor.run("exit 42").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 42);
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let executor = LocalExecutor::new();
        let result = executor
            .run_with_timeout("sleep 5", Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_copy_lands_under_root() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::with_root(dir.path());

        executor
            .copy(b"services: {}\n", Path::new("/opt/vault/docker-compose.yml"), 0o600)
            .await
            .unwrap();

        let written = dir.path().join("opt/vault/docker-compose.yml");
        assert_eq!(std::fs::read(&written).unwrap(), b"services: {}\n");
        let mode = std::fs::metadata(&written).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
