//! Error types for hostforge-secrets
//!
//! Messages in this module never include secret material or raw bootstrap
//! output.

use std::path::PathBuf;

use thiserror::Error;

use hostforge_core::{FailureKind, StepFailure, StoreError};
use hostforge_exec::ExecError;

use crate::bundle::SecretBundle;

/// Bootstrap output did not contain a valid secret bundle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// No start marker in the output
    #[error("start marker not found")]
    MissingStartMarker,

    /// No end marker in the output
    #[error("end marker not found")]
    MissingEndMarker,

    /// Last end marker precedes the last start marker
    #[error("end marker appears before start marker")]
    EndBeforeStart,

    /// A complete marker pair appears before the last one
    #[error("output contains more than one marker block")]
    AmbiguousMarkers,

    /// Block between the markers is not valid YAML
    #[error("token block is not valid YAML (line {line:?}, column {column:?})")]
    Malformed {
        /// 1-based line within the block, if known
        line: Option<usize>,
        /// 1-based column, if known
        column: Option<usize>,
    },

    /// Block is valid YAML but not a mapping
    #[error("token block is not a mapping")]
    NotAMapping,

    /// `root_token` absent or not a string
    #[error("root_token missing or not a string")]
    MissingRootToken,

    /// `root_token` is empty
    #[error("root_token is empty")]
    EmptyRootToken,

    /// `recovery_keys` absent or not a sequence
    #[error("recovery_keys missing or not a sequence")]
    MissingRecoveryKeys,

    /// Wrong number of recovery shares
    #[error("expected {expected} recovery keys, found {found}")]
    WrongShareCount {
        /// Required count
        expected: usize,
        /// Count in the output
        found: usize,
    },

    /// A recovery share is not a string
    #[error("recovery key {index} is not a string")]
    InvalidShare {
        /// 1-based position
        index: usize,
    },

    /// A recovery share is empty
    #[error("recovery key {index} is empty")]
    EmptyShare {
        /// 1-based position
        index: usize,
    },
}

/// Secret store failures
#[derive(Error, Debug)]
pub enum SecretStoreError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid store address
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Store answered with an error status
    #[error("secret store error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error reported by the store
        message: String,
    },

    /// Mount does not exist
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// Response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Store cannot be reached
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

/// Materialization failed; the bundle is handed back so it is not lost
#[derive(Error, Debug)]
#[error("secret materialization failed: {source}")]
pub struct MaterializeError {
    /// Store failure
    #[source]
    pub source: SecretStoreError,
    bundle: SecretBundle,
}

impl MaterializeError {
    pub(crate) fn new(source: SecretStoreError, bundle: SecretBundle) -> Self {
        Self { source, bundle }
    }

    /// Take back the bundle that could not be stored
    #[must_use]
    pub fn into_parts(self) -> (SecretStoreError, SecretBundle) {
        (self.source, self.bundle)
    }
}

/// Secret bootstrap failures
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// An earlier run initialized the service but extraction failed
    #[error(
        "bootstrap of {component} already ran without producing secrets; re-initializing is unsafe, inspect the service manually"
    )]
    PreviouslyAttempted {
        /// Component name
        component: String,
    },

    /// Initialization script exited non-zero
    #[error("bootstrap script exited with status {status}")]
    InitFailed {
        /// Exit status
        status: i32,
    },

    /// Initialization script could not be run
    #[error("bootstrap script could not run: {0}")]
    Exec(#[from] ExecError),

    /// Output did not contain a valid bundle
    #[error("secret extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    /// Bundle extracted but not stored; it was saved to `rescue`
    #[error("secrets extracted but not stored ({source}); saved to {}", .rescue.display())]
    Materialize {
        /// Store failure
        source: SecretStoreError,
        /// File holding the bundle
        rescue: PathBuf,
    },

    /// Rescue file could not be written or read
    #[error("rescue file {}: {message}", .path.display())]
    Rescue {
        /// Rescue file location
        path: PathBuf,
        /// Failure detail
        message: String,
    },

    /// Bootstrap state could not be read or written
    #[error("bootstrap state error: {0}")]
    State(#[from] StoreError),

    /// Bootstrap state holds values this version does not understand
    #[error("bootstrap state is corrupt: {0}")]
    CorruptState(String),
}

impl BootstrapError {
    /// Failure class used in deployment reports
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BootstrapError::Extraction(_) | BootstrapError::PreviouslyAttempted { .. } => {
                FailureKind::Extraction
            }
            BootstrapError::InitFailed { .. } | BootstrapError::Exec(_) => {
                FailureKind::RemoteExecution
            }
            BootstrapError::Materialize { .. } | BootstrapError::Rescue { .. } => {
                FailureKind::SecretStore
            }
            BootstrapError::State(_) | BootstrapError::CorruptState(_) => {
                FailureKind::TriggerStore
            }
        }
    }
}

impl From<&BootstrapError> for StepFailure {
    fn from(err: &BootstrapError) -> Self {
        StepFailure {
            kind: err.failure_kind(),
            message: err.to_string(),
            exit_status: match err {
                BootstrapError::InitFailed { status } => Some(*status),
                BootstrapError::Exec(e) => e.exit_status(),
                _ => None,
            },
        }
    }
}
