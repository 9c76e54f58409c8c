//! Deployment results

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kameo_macros::Reply;
use serde::Serialize;

use crate::error::CoreError;
use crate::model::StepId;

/// Which script an applied step ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// First install of a component
    Create,
    /// Reinstall after a trigger changed
    Update,
    /// Prepare or copy step
    Run,
}

/// Classes of step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Template missing or referencing an absent field
    Template,
    /// Remote script exited non-zero or the transport failed
    RemoteExecution,
    /// A deferred input failed to resolve
    InputUnresolved,
    /// Local staging or source file problem
    Staging,
    /// Secret bootstrap output could not be parsed
    Extraction,
    /// Trigger snapshot could not be read or written
    TriggerStore,
    /// Recovered secrets could not be written to the secret store
    SecretStore,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Template => "template",
            FailureKind::RemoteExecution => "remote execution",
            FailureKind::InputUnresolved => "unresolved input",
            FailureKind::Staging => "staging",
            FailureKind::Extraction => "extraction",
            FailureKind::TriggerStore => "trigger store",
            FailureKind::SecretStore => "secret store",
        };
        f.write_str(name)
    }
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    /// Failure class
    pub kind: FailureKind,
    /// Human-readable detail
    pub message: String,
    /// Exit status of the remote script, if it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

impl StepFailure {
    /// Failure without an exit status
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_status: None,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Result of evaluating one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    /// Triggers changed (or first run); the script or copy ran
    Applied {
        /// Script variant
        variant: Variant,
    },
    /// Triggers matched the last successful run; nothing ran
    Unchanged,
    /// Dry run: would have run
    Planned {
        /// Script variant that would run
        variant: Variant,
    },
    /// The step failed
    Failed(StepFailure),
    /// Not attempted because an upstream step failed
    Skipped {
        /// The failed step
        upstream: StepId,
    },
    /// Not started because the deployment was aborted
    Aborted,
}

impl StepStatus {
    /// Whether steps waiting on this one may proceed
    #[must_use]
    pub fn allows_dependents(&self) -> bool {
        matches!(
            self,
            StepStatus::Applied { .. } | StepStatus::Unchanged | StepStatus::Planned { .. }
        )
    }

    /// Short label used in logs and events
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Applied { .. } => "applied",
            StepStatus::Unchanged => "unchanged",
            StepStatus::Planned { .. } => "planned",
            StepStatus::Failed(_) => "failed",
            StepStatus::Skipped { .. } => "skipped",
            StepStatus::Aborted => "aborted",
        }
    }
}

/// Outcome of one step in one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    /// Step identity
    pub step: StepId,
    /// What happened
    #[serde(flatten)]
    pub status: StepStatus,
    /// Fingerprint of the transferred artifact, for copy steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// When evaluation finished
    pub finished_at: DateTime<Utc>,
}

impl StepOutcome {
    /// Outcome finishing now
    #[must_use]
    pub fn new(step: StepId, status: StepStatus) -> Self {
        Self {
            step,
            status,
            fingerprint: None,
            finished_at: Utc::now(),
        }
    }
}

/// Summary of one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    /// Every step succeeded
    Completed {
        /// Whether any step had a remote side effect
        changed: bool,
    },
    /// Dry run finished without errors
    Planned,
    /// At least one step failed
    Failed,
    /// Blocked by a failure in another component
    Skipped,
    /// Not finished because the deployment was aborted
    Aborted,
}

impl ComponentStatus {
    /// Summary from the outcome of a component's install step alone
    #[must_use]
    pub fn from_install(outcome: &StepOutcome) -> Self {
        match &outcome.status {
            StepStatus::Applied { .. } => ComponentStatus::Completed { changed: true },
            StepStatus::Unchanged => ComponentStatus::Completed { changed: false },
            StepStatus::Planned { .. } => ComponentStatus::Planned,
            StepStatus::Failed(_) => ComponentStatus::Failed,
            StepStatus::Skipped { upstream } if upstream.component == outcome.step.component => {
                ComponentStatus::Failed
            }
            StepStatus::Skipped { .. } => ComponentStatus::Skipped,
            StepStatus::Aborted => ComponentStatus::Aborted,
        }
    }

    /// Whether the component is installed and current
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, ComponentStatus::Completed { .. })
    }
}

/// Everything that happened in one deployment
#[derive(Debug, Clone, Serialize, Reply)]
pub struct DeploymentReport {
    /// Whether this was a dry run
    pub dry_run: bool,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Step outcomes in dependency order
    pub steps: Vec<StepOutcome>,
}

impl DeploymentReport {
    /// Empty report starting now
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
        }
    }

    /// Add a step outcome
    pub fn record(&mut self, outcome: StepOutcome) {
        self.steps.push(outcome);
    }

    /// Mark the report finished
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Outcome of a step
    #[must_use]
    pub fn outcome(&self, step: &StepId) -> Option<&StepOutcome> {
        self.steps.iter().find(|o| &o.step == step)
    }

    /// Status of a step
    #[must_use]
    pub fn status(&self, step: &StepId) -> Option<&StepStatus> {
        self.outcome(step).map(|o| &o.status)
    }

    /// Failed steps
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Failed(_)))
    }

    /// Steps skipped because of an upstream failure
    pub fn skipped(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Skipped { .. }))
    }

    /// Number of steps that had remote side effects
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Applied { .. }))
            .count()
    }

    /// Whether no step failed, was skipped or aborted
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|o| o.status.allows_dependents())
    }

    /// Status of one component, derived from its steps
    #[must_use]
    pub fn component_status(&self, component: &str) -> Option<ComponentStatus> {
        let steps: Vec<&StepOutcome> = self
            .steps
            .iter()
            .filter(|o| o.step.component == component)
            .collect();
        if steps.is_empty() {
            return None;
        }
        Some(summarize(&steps))
    }

    /// Status of every component
    #[must_use]
    pub fn components(&self) -> BTreeMap<String, ComponentStatus> {
        let mut grouped: BTreeMap<&str, Vec<&StepOutcome>> = BTreeMap::new();
        for outcome in &self.steps {
            grouped
                .entry(outcome.step.component.as_str())
                .or_default()
                .push(outcome);
        }
        grouped
            .into_iter()
            .map(|(name, steps)| (name.to_string(), summarize(&steps)))
            .collect()
    }

    /// Turn a report with failures into one aggregated error
    ///
    /// # Errors
    /// Returns `CoreError::DeploymentFailed` listing every failed step with
    /// its error and every skipped step with the failure that blocked it, or
    /// `CoreError::DeploymentAborted` if steps were left unstarted
    pub fn into_result(self) -> Result<Self, CoreError> {
        let failed: Vec<String> = self
            .failures()
            .filter_map(|o| match &o.status {
                StepStatus::Failed(failure) => Some(format!("{}: {failure}", o.step)),
                _ => None,
            })
            .collect();
        if failed.is_empty() {
            let aborted: Vec<String> = self
                .steps
                .iter()
                .filter(|o| matches!(o.status, StepStatus::Aborted))
                .map(|o| o.step.to_string())
                .collect();
            if aborted.is_empty() {
                return Ok(self);
            }
            return Err(CoreError::DeploymentAborted { not_started: aborted });
        }

        let skipped = self
            .skipped()
            .filter_map(|o| match &o.status {
                StepStatus::Skipped { upstream } => Some(format!("{} (after {upstream})", o.step)),
                _ => None,
            })
            .collect();
        Err(CoreError::DeploymentFailed { failed, skipped })
    }
}

fn summarize(steps: &[&StepOutcome]) -> ComponentStatus {
    let has = |pred: fn(&StepStatus) -> bool| steps.iter().any(|o| pred(&o.status));

    if has(|s| matches!(s, StepStatus::Failed(_))) {
        ComponentStatus::Failed
    } else if has(|s| matches!(s, StepStatus::Skipped { .. })) {
        ComponentStatus::Skipped
    } else if has(|s| matches!(s, StepStatus::Aborted)) {
        ComponentStatus::Aborted
    } else if has(|s| matches!(s, StepStatus::Planned { .. })) {
        ComponentStatus::Planned
    } else {
        ComponentStatus::Completed {
            changed: has(|s| matches!(s, StepStatus::Applied { .. })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> DeploymentReport {
        let mut report = DeploymentReport::new(false);
        report.record(StepOutcome::new(
            StepId::prepare("docker"),
            StepStatus::Unchanged,
        ));
        report.record(StepOutcome::new(
            StepId::install("docker"),
            StepStatus::Failed(StepFailure {
                kind: FailureKind::RemoteExecution,
                message: "exit status 1".into(),
                exit_status: Some(1),
            }),
        ));
        report.record(StepOutcome::new(
            StepId::prepare("vault"),
            StepStatus::Skipped {
                upstream: StepId::install("docker"),
            },
        ));
        report.record(StepOutcome::new(
            StepId::install("frr"),
            StepStatus::Applied {
                variant: Variant::Create,
            },
        ));
        report.finish();
        report
    }

    #[test]
    fn test_component_summary() {
        let components = report().components();
        assert_eq!(components["docker"], ComponentStatus::Failed);
        assert_eq!(components["vault"], ComponentStatus::Skipped);
        assert_eq!(components["frr"], ComponentStatus::Completed { changed: true });
    }

    #[test]
    fn test_into_result_aggregates() {
        let err = report().into_result().unwrap_err();
        match err {
            CoreError::DeploymentFailed { failed, skipped } => {
                assert_eq!(failed.len(), 1);
                assert!(failed[0].starts_with("docker/install: remote execution error"));
                assert_eq!(skipped, vec!["vault/prepare (after docker/install)"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_serializes_step_ids_as_strings() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["steps"][2]["step"], "vault/prepare");
        assert_eq!(json["steps"][2]["status"], "skipped");
        assert_eq!(json["steps"][2]["upstream"], "docker/install");
    }
}
