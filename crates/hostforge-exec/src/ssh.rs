//! SSH command execution using russh crate

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use crate::error::ExecError;
use crate::result::{CommandResult, ConnectionSpec};
use crate::traits::RemoteExecutor;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Freshly provisioned hosts have no known_hosts entry yet
        Ok(true)
    }
}

/// SSH command executor
///
/// Manages one SSH session per target host. The connection is established on
/// first use and every script or copy gets its own channel.
pub struct SshExecutor {
    /// Connection configuration
    spec: ConnectionSpec,
    /// Decoded private key
    key: Arc<PrivateKey>,
    /// SSH session (initialized on first use)
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("spec", &self.spec)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the key cannot be resolved
    pub fn new(spec: ConnectionSpec) -> Result<Self, ExecError> {
        let key = spec
            .key
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            spec,
            key: Arc::new(key),
            session: Mutex::new(None),
        })
    }

    /// Get connection spec
    pub fn connection(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// Connect to the remote host
    #[instrument(skip(self), fields(host = %self.spec.host))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.is_some() {
            return Ok(());
        }

        info!(
            host = %self.spec.host,
            port = self.spec.port,
            user = %self.spec.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());

        let mut session = client::connect(
            config,
            (&self.spec.host[..], self.spec.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.spec.user,
                PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "public key authentication failed".to_string(),
            ));
        }

        info!(host = %self.spec.host, "SSH connected and authenticated");

        *session_lock = Some(session);
        Ok(())
    }

    /// Execute a command, optionally streaming `stdin` into it
    async fn execute_remote(
        &self,
        cmd: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, ExecError> {
        let mut session_lock = self.session.lock().await;
        let session = session_lock.as_mut().ok_or(ExecError::NotConnected)?;

        let start = Instant::now();

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        if let Some(data) = stdin {
            channel
                .data(data)
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            channel
                .eof()
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
        }

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = exit_status.cast_signed();
                }
                Some(ChannelMsg::Eof) | None => break,
                _ => {}
            }
        }

        let duration = start.elapsed();
        debug!(status = status, duration = ?duration, "remote command completed");

        Ok(CommandResult {
            status,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration,
        })
    }

    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.spec.host, "SSH disconnected");
        }
        Ok(())
    }
}

/// Quote a value for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell command that atomically installs stdin at `destination`
fn copy_command(destination: &Path, mode: u32) -> String {
    let dest = destination.display().to_string();
    let tmp = format!("{dest}.hostforge-tmp");
    let parent = destination
        .parent()
        .map_or_else(|| "/".to_string(), |p| p.display().to_string());
    format!(
        "mkdir -p {parent} && cat > {tmp} && chmod {mode:o} {tmp} && mv -f {tmp} {dest}",
        parent = shell_quote(&parent),
        tmp = shell_quote(&tmp),
        dest = shell_quote(&dest),
    )
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, script), fields(host = %self.spec.host))]
    async fn run(&self, script: &str) -> Result<CommandResult, ExecError> {
        self.connect().await?;
        self.execute_remote(script, None).await
    }

    #[instrument(skip(self, script), fields(host = %self.spec.host))]
    async fn run_with_timeout(
        &self,
        script: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        // Connection setup is not part of the script budget
        self.connect().await?;

        match timeout(timeout_duration, self.execute_remote(script, None)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "remote script timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    #[instrument(skip(self, contents), fields(host = %self.spec.host, destination = %destination.display()))]
    async fn copy(
        &self,
        contents: &[u8],
        destination: &Path,
        mode: u32,
    ) -> Result<(), ExecError> {
        self.connect().await?;

        let result = self
            .execute_remote(&copy_command(destination, mode), Some(contents))
            .await?;

        if !result.success() {
            return Err(ExecError::CopyFailed {
                destination: destination.display().to_string(),
                message: format!("exit {}: {}", result.status, result.stderr.trim()),
            });
        }

        debug!(bytes = contents.len(), "copied file over SSH");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        // Only a hint: a held lock reads as disconnected
        self.session
            .try_lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_copy_command_uses_temp_file_and_mode() {
        let cmd = copy_command(Path::new("/opt/vault/config/vault-config.hcl"), 0o640);

        assert!(cmd.starts_with("mkdir -p '/opt/vault/config'"));
        assert!(cmd.contains("cat > '/opt/vault/config/vault-config.hcl.hostforge-tmp'"));
        assert!(cmd.contains("chmod 640 "));
        assert!(cmd.ends_with("'/opt/vault/config/vault-config.hcl'"));
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_roundtrip() {
        let spec = ConnectionSpec::new(
            "127.0.0.1",
            "root",
            crate::keys::KeySource::Env("HOSTFORGE_TEST_SSH_KEY".to_string()),
        );
        let executor = SshExecutor::new(spec).unwrap();
        let result = executor.run("echo ok").await.unwrap();
        assert_eq!(result.stdout.trim(), "ok");
    }
}
