//! Progress events broadcast while a deployment runs

use serde::Serialize;

use crate::model::StepId;
use crate::report::{ComponentStatus, StepStatus};

/// Deployment progress
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    /// A step started executing
    StepStarted {
        /// Step identity
        step: StepId,
    },
    /// A step finished, was skipped or was aborted
    StepFinished {
        /// Step identity
        step: StepId,
        /// Result
        status: StepStatus,
    },
    /// A component's install step resolved
    ComponentFinished {
        /// Component name
        component: String,
        /// Summary
        status: ComponentStatus,
    },
    /// Every step resolved
    DeploymentFinished {
        /// Whether every step succeeded
        success: bool,
    },
}
