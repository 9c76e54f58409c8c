//! Error types for hostforge-render

use thiserror::Error;

/// Errors raised while rendering or staging artifacts
#[derive(Error, Debug, Clone)]
pub enum RenderError {
    /// Template not registered with the renderer
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// Template failed to parse or render (including undefined fields)
    #[error("template {template} failed: {message}")]
    Template {
        /// Template name
        template: String,
        /// Error chain from the template engine
        message: String,
    },

    /// Input record was not a JSON object
    #[error("input record for {0} must be an object")]
    InvalidInput(String),

    /// Component or artifact name cannot be used as a staging path
    #[error("cannot stage {0:?}: names must be relative paths without `.` or `..` segments")]
    InvalidName(String),

    /// Filesystem error while loading or staging
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Path being read or written
        path: String,
        /// Underlying error
        message: String,
    },
}

impl RenderError {
    pub(crate) fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        RenderError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}
