//! The secret bundle produced by initializing the secret service

use std::collections::BTreeMap;
use std::fmt;

/// Number of recovery shares the service is initialized with
pub const RECOVERY_SHARES: usize = 5;

const ROOT_TOKEN_KEY: &str = "rootToken";

/// Root token plus exactly `RECOVERY_SHARES` recovery keys
///
/// Only constructed from complete, non-empty values. `Debug` never prints
/// the secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBundle {
    root_token: String,
    recovery_keys: [String; RECOVERY_SHARES],
}

impl SecretBundle {
    /// Build a bundle; `None` if any value is empty
    #[must_use]
    pub fn new(root_token: String, recovery_keys: [String; RECOVERY_SHARES]) -> Option<Self> {
        if root_token.trim().is_empty() || recovery_keys.iter().any(|k| k.trim().is_empty()) {
            return None;
        }
        Some(Self {
            root_token,
            recovery_keys,
        })
    }

    /// Root credential
    #[must_use]
    pub fn root_token(&self) -> &str {
        &self.root_token
    }

    /// Recovery shares in output order
    #[must_use]
    pub fn recovery_keys(&self) -> &[String; RECOVERY_SHARES] {
        &self.recovery_keys
    }

    /// Stored form: `rootToken`, `recoveryKey1`..`recoveryKey5`
    #[must_use]
    pub fn to_entry(&self) -> BTreeMap<String, String> {
        let mut entry = BTreeMap::new();
        entry.insert(ROOT_TOKEN_KEY.to_string(), self.root_token.clone());
        for (i, key) in self.recovery_keys.iter().enumerate() {
            entry.insert(format!("recoveryKey{}", i + 1), key.clone());
        }
        entry
    }

    /// Inverse of `to_entry`; `None` if a key is missing or empty
    #[must_use]
    pub fn from_entry(entry: &BTreeMap<String, String>) -> Option<Self> {
        let root_token = entry.get(ROOT_TOKEN_KEY)?.clone();
        let mut recovery_keys: [String; RECOVERY_SHARES] = Default::default();
        for (i, slot) in recovery_keys.iter_mut().enumerate() {
            *slot = entry.get(&format!("recoveryKey{}", i + 1))?.clone();
        }
        Self::new(root_token, recovery_keys)
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("root_token", &"<redacted>")
            .field("recovery_keys", &format_args!("<{RECOVERY_SHARES} redacted>"))
            .finish()
    }
}
