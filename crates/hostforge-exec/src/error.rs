//! Error types for hostforge-exec

use std::time::Duration;

use thiserror::Error;

/// Errors from running scripts or placing files on the target
///
/// A script that runs and exits non-zero is not an error at this layer; it
/// comes back as a `CommandResult` and only becomes `CommandFailed` through
/// `CommandResult::into_success`.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Target host unreachable
    #[error("connection to target failed: {0}")]
    ConnectionFailed(String),

    /// Target rejected the key
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Script exited with a non-zero status
    #[error("script exited with status {status}: {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Script exceeded its time limit; it may still be running remotely
    #[error("script timed out after {timeout:?}")]
    Timeout {
        /// Limit that was exceeded
        timeout: Duration,
    },

    /// Private key could not be loaded
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Local shell could not be started
    #[error("failed to spawn shell: {0}")]
    SpawnError(String),

    /// Session or channel broke while a script was running
    #[error("channel I/O error: {0}")]
    IoError(String),

    /// File transfer failed
    #[error("copy to {destination} failed: {message}")]
    CopyFailed {
        /// Remote destination path
        destination: String,
        /// Failure detail
        message: String,
    },

    /// No session to the target
    #[error("not connected")]
    NotConnected,
}

impl ExecError {
    /// Whether the failure happened before any script could start
    ///
    /// Such failures leave the target untouched, so even one-shot scripts
    /// can be attempted again.
    #[must_use]
    pub fn before_execution(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_)
                | ExecError::AuthenticationFailed(_)
                | ExecError::SshKeyError(_)
                | ExecError::SpawnError(_)
                | ExecError::NotConnected
        )
    }

    /// Exit status when the failure came from the remote script itself
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_before_execution() {
        assert!(ExecError::ConnectionFailed("refused".into()).before_execution());
        assert!(ExecError::NotConnected.before_execution());
        assert!(
            !ExecError::Timeout {
                timeout: Duration::from_secs(1)
            }
            .before_execution()
        );
        assert!(!ExecError::IoError("reset".into()).before_execution());
    }
}
