//! hostforge: provision components onto one host and bootstrap its secrets
//!
//! The binary reads `hostforge.toml`, builds the component catalog and
//! drives it through a `DeploymentActor`. This library half holds the parts
//! that are tested on their own.

pub mod catalog;
pub mod config;
pub mod driver;
pub mod generated;

pub use catalog::{BootstrapPlan, Catalog};
pub use config::Config;
pub use driver::{BootstrapOutcome, DeploymentSummary, SecretSummary};
pub use generated::GeneratedValues;
