//! Remote executor trait

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::CommandResult;

/// Executes scripts and places files on one target host.
///
/// Implementations report the exit status of a script in the returned
/// `CommandResult`; transport problems are `ExecError`s. Deciding whether a
/// script should run at all is left to the caller.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell script on the target
    async fn run(&self, script: &str) -> Result<CommandResult, ExecError>;

    /// Run a shell script, giving up after `timeout`
    async fn run_with_timeout(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Write `contents` to `destination` with the given permission bits
    async fn copy(&self, contents: &[u8], destination: &Path, mode: u32)
    -> Result<(), ExecError>;

    /// Whether a session to the target is currently open
    fn is_connected(&self) -> bool {
        true
    }

    /// Short name used in logs
    fn executor_type(&self) -> &'static str;
}
