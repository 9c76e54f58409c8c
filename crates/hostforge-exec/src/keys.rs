//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

/// SSH key resolution strategy
#[derive(Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Private key in PEM/OpenSSH format, held in memory
    Pem(String),
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Label used in `Debug` output; never includes key material
    #[must_use]
    pub fn kind(&self) -> String {
        match self {
            KeySource::Path(path) => format!("path:{}", path.display()),
            KeySource::Pem(_) => "pem:<redacted>".to_string(),
            KeySource::Env(var) => format!("env:{var}"),
        }
    }

    /// Load the private key
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64,
    /// permissions too open, undecodable key, etc.)
    pub fn resolve(&self) -> Result<PrivateKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                debug!(path = %path.display(), "loading SSH key from file");
                load_secret_key(path, None).map_err(|e| KeyError::Decode(e.to_string()))
            }
            KeySource::Pem(pem) => {
                decode_secret_key(pem, None).map_err(|e| KeyError::Decode(e.to_string()))
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;
                let pem = String::from_utf8(key_data).map_err(|_| KeyError::InvalidBase64)?;
                debug!(var = %var_name, "decoded SSH key from environment");
                decode_secret_key(&pem, None).map_err(|e| KeyError::Decode(e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.kind())
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("could not decode private key: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(KeyError::Io)?;
    let mode = metadata.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
