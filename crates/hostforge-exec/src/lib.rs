//! hostforge-exec: Remote execution adapter
//!
//! Provides the `RemoteExecutor` trait and implementations for running
//! installer scripts and copying artifacts locally or over SSH.

pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use keys::{KeyError, KeySource};
pub use local::LocalExecutor;
pub use result::{CommandResult, ConnectionSpec};
pub use ssh::SshExecutor;
pub use traits::RemoteExecutor;
