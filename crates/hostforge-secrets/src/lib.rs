//! hostforge-secrets: one-time secret bootstrap and durable storage
//!
//! Runs the initialization script of the secret-management service exactly
//! once, recovers the root token and recovery shares from its output and
//! writes them to a KV v2 secret store. Secrets never reach the log.

pub mod bootstrap;
pub mod bundle;
pub mod error;
pub mod extract;
pub mod materialize;
pub mod store;
pub mod vault;

pub use bootstrap::{SecretBootstrap, StoreConnector};
pub use bundle::{RECOVERY_SHARES, SecretBundle};
pub use error::{BootstrapError, ExtractionError, MaterializeError, SecretStoreError};
pub use extract::{END_MARKER, START_MARKER, extract_bundle};
pub use materialize::{Materialized, OwnedSecret, SecretLayout, materialize};
pub use store::{MemorySecretStore, SecretStore, VersionedEntry};
pub use vault::VaultKvStore;
