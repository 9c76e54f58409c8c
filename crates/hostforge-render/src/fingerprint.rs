//! Content fingerprints

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RenderError;

/// Lowercase hex SHA-256 digest of an artifact's exact bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated digest for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Fingerprint a byte slice
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Fingerprint the current contents of a file
///
/// # Errors
/// Returns `RenderError::Io` if the file cannot be read
pub async fn fingerprint_file(path: &Path) -> Result<Fingerprint, RenderError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RenderError::io(path, &e))?;
    Ok(fingerprint(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_one_byte_changes_digest() {
        let a = fingerprint(b"listen_address = \"0.0.0.0:8200\"\n");
        let b = fingerprint(b"listen_address = \"0.0.0.0:8201\"\n");
        assert_ne!(a, b);
        assert_eq!(a, fingerprint(b"listen_address = \"0.0.0.0:8200\"\n"));
    }

    #[tokio::test]
    async fn test_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.yml");
        std::fs::write(&path, b"services: {}\n").unwrap();

        assert_eq!(
            fingerprint_file(&path).await.unwrap(),
            fingerprint(b"services: {}\n")
        );
    }
}
