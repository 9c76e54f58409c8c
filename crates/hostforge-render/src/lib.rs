//! hostforge-render: artifact rendering and content fingerprints
//!
//! Templates are rendered with tera, written to a local staging area and
//! fingerprinted there, so every copy step is keyed by the bytes it will
//! transfer.

pub mod error;
pub mod fingerprint;
pub mod staging;
pub mod template;

pub use error::RenderError;
pub use fingerprint::{Fingerprint, fingerprint, fingerprint_file};
pub use staging::{StagedArtifact, StagingArea};
pub use template::TemplateRenderer;
