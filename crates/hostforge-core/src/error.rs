//! Core error types for hostforge-core

use thiserror::Error;

/// Errors that can occur in core operations
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Component not registered
    #[error("component not found: {0}")]
    ComponentNotFound(String),

    /// Component already registered
    #[error("component already exists: {0}")]
    ComponentAlreadyExists(String),

    /// A deployment is already running
    #[error("a deployment is already in progress")]
    DeploymentInProgress,

    /// Task graph could not be built
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// One or more steps failed; lists every failed and skipped step
    #[error("deployment failed: {}", .failed.join("; "))]
    DeploymentFailed {
        /// Failed steps with their error
        failed: Vec<String>,
        /// Steps skipped because an upstream step failed
        skipped: Vec<String>,
    },

    /// Deployment was aborted before every step started
    #[error("deployment aborted; not started: {}", .not_started.join(", "))]
    DeploymentAborted {
        /// Steps that never started
        not_started: Vec<String>,
    },

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Problems detected while building the task graph, before anything runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Component name is empty or contains a path separator
    #[error("invalid component name {0:?}")]
    InvalidName(String),

    /// Two components share a name
    #[error("duplicate component: {0}")]
    DuplicateComponent(String),

    /// Two artifacts of one component share a name
    #[error("component {component} declares artifact {artifact} twice")]
    DuplicateArtifact {
        /// Component name
        component: String,
        /// Artifact name
        artifact: String,
    },

    /// A component depends on a component that does not exist
    #[error("component {component} depends on unknown component {dependency}")]
    UnknownDependency {
        /// Component declaring the dependency
        component: String,
        /// Missing dependency
        dependency: String,
    },

    /// Dependency edges form a cycle
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle {
        /// Components on the cycle, first repeated at the end
        path: Vec<String>,
    },
}

/// Trigger store failures
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Reading or writing the state file failed
    #[error("trigger store I/O error: {0}")]
    Io(String),

    /// State file is not valid JSON
    #[error("trigger store is corrupt: {0}")]
    Corrupt(String),
}
