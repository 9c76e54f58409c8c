//! Step execution
//!
//! Every step becomes a shared future that first awaits its predecessors,
//! then takes the store's lock for the step key, loads the last trigger
//! snapshot, decides whether to run, runs and records the new snapshot. Steps with no path between them run
//! concurrently. A failed step resolves its dependents as skipped without
//! touching the remote host.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use hostforge_exec::RemoteExecutor;
use hostforge_render::{StagingArea, TemplateRenderer, fingerprint};

use crate::component::Component;
use crate::event::DeployEvent;
use crate::graph::TaskGraph;
use crate::model::{Artifact, ArtifactSource, StepId, StepKind};
use crate::report::{
    ComponentStatus, DeploymentReport, FailureKind, StepFailure, StepOutcome, StepStatus, Variant,
};
use crate::store::{StepRecord, TriggerStore};

type StepFuture = Shared<BoxFuture<'static, StepOutcome>>;

/// Default capacity of the progress event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Stops a deployment from starting further steps
///
/// Steps already running are left to finish; a half-run install script is
/// worse than a stopped deployment.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// Fresh, unset signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the abort
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct EngineInner {
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<dyn TriggerStore>,
    staging: StagingArea,
    renderer: Arc<TemplateRenderer>,
    events: broadcast::Sender<DeployEvent>,
}

/// Drives task graphs against one target host
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("executor", &self.inner.executor.executor_type())
            .field("staging", &self.inner.staging.root())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        store: Arc<dyn TriggerStore>,
        staging: StagingArea,
        renderer: Arc<TemplateRenderer>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                executor,
                store,
                staging,
                renderer,
                events,
            }),
        }
    }

    /// Receive progress events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.inner.events.subscribe()
    }

    /// Executor steps run on
    #[must_use]
    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        self.inner.executor.clone()
    }

    /// Store holding trigger snapshots
    #[must_use]
    pub fn store(&self) -> Arc<dyn TriggerStore> {
        self.inner.store.clone()
    }

    /// Start driving `graph` and return immediately
    ///
    /// Must be called from within a tokio runtime. Steps are spawned as
    /// tasks and make progress whether or not the handle is awaited.
    #[instrument(skip(self, graph), fields(steps = graph.len()))]
    pub fn start(&self, graph: &TaskGraph, dry_run: bool) -> DeploymentHandle {
        let abort = AbortSignal::new();
        let mut futures: HashMap<StepId, StepFuture> = HashMap::with_capacity(graph.len());
        let mut ordered = Vec::with_capacity(graph.len());

        info!(dry_run, "starting deployment");

        for node in graph.steps() {
            let Some(component) = graph.component(&node.id.component).cloned() else {
                continue;
            };
            let predecessors: Vec<StepFuture> = node
                .predecessors
                .iter()
                .filter_map(|id| futures.get(id).cloned())
                .collect();

            let inner = self.inner.clone();
            let id = node.id.clone();
            let abort = abort.clone();
            let step = async move {
                inner
                    .evaluate(id, component, predecessors, dry_run, abort)
                    .await
            }
            .boxed()
            .shared();

            tokio::spawn(step.clone());
            futures.insert(node.id.clone(), step.clone());
            ordered.push(step);
        }

        let completions = graph
            .component_order()
            .iter()
            .filter_map(|name| {
                futures
                    .get(&StepId::install(name))
                    .map(|step| (name.clone(), step.clone()))
            })
            .collect();

        let events = self.inner.events.clone();
        let mut report = DeploymentReport::new(dry_run);
        let report = async move {
            for outcome in join_all(ordered).await {
                report.record(outcome);
            }
            report.finish();

            let success = report.is_success();
            if success {
                info!(applied = report.applied_count(), "deployment finished");
            } else {
                error!(
                    failed = report.failures().count(),
                    skipped = report.skipped().count(),
                    "deployment finished with failures"
                );
            }
            let _ = events.send(DeployEvent::DeploymentFinished { success });
            report
        }
        .boxed()
        .shared();
        tokio::spawn(report.clone());

        DeploymentHandle {
            completions,
            report,
            abort,
            dry_run,
        }
    }

    /// Apply `graph` and wait for the report
    pub async fn run(&self, graph: &TaskGraph) -> DeploymentReport {
        self.start(graph, false).wait().await
    }

    /// Evaluate `graph` without executing or recording anything
    pub async fn plan(&self, graph: &TaskGraph) -> DeploymentReport {
        self.start(graph, true).wait().await
    }
}

impl EngineInner {
    async fn evaluate(
        self: Arc<Self>,
        id: StepId,
        component: Arc<Component>,
        predecessors: Vec<StepFuture>,
        dry_run: bool,
        abort: AbortSignal,
    ) -> StepOutcome {
        let upstream = join_all(predecessors).await;

        for outcome in &upstream {
            let blocked = match &outcome.status {
                StepStatus::Failed(_) => Some(StepStatus::Skipped {
                    upstream: outcome.step.clone(),
                }),
                StepStatus::Skipped { upstream } => Some(StepStatus::Skipped {
                    upstream: upstream.clone(),
                }),
                StepStatus::Aborted => Some(StepStatus::Aborted),
                _ => None,
            };
            if let Some(status) = blocked {
                return self.finish(StepOutcome::new(id, status));
            }
        }

        if abort.is_aborted() {
            return self.finish(StepOutcome::new(id, StepStatus::Aborted));
        }

        let _ = self
            .events
            .send(DeployEvent::StepStarted { step: id.clone() });

        let outcome = match self.execute(&id, &component, &upstream, dry_run).await {
            Ok((status, fingerprint)) => StepOutcome {
                fingerprint,
                ..StepOutcome::new(id, status)
            },
            Err(failure) => StepOutcome::new(id, StepStatus::Failed(failure)),
        };
        self.finish(outcome)
    }

    fn finish(&self, outcome: StepOutcome) -> StepOutcome {
        let component = &outcome.step.component;
        let step = &outcome.step.kind;
        match &outcome.status {
            StepStatus::Failed(failure) => {
                error!(%component, %step, status = "failed", error = %failure, "step failed");
            }
            StepStatus::Skipped { upstream } => {
                warn!(%component, %step, status = "skipped", %upstream, "step skipped");
            }
            status => {
                info!(%component, %step, status = status.label(), "step finished");
            }
        }

        let _ = self.events.send(DeployEvent::StepFinished {
            step: outcome.step.clone(),
            status: outcome.status.clone(),
        });
        if outcome.step.kind == StepKind::InstallOrUpdate {
            let _ = self.events.send(DeployEvent::ComponentFinished {
                component: component.clone(),
                status: ComponentStatus::from_install(&outcome),
            });
        }
        outcome
    }

    #[instrument(skip(self, component, upstream), fields(component = %id.component, step = %id.kind))]
    async fn execute(
        &self,
        id: &StepId,
        component: &Component,
        upstream: &[StepOutcome],
        dry_run: bool,
    ) -> Result<(StepStatus, Option<String>), StepFailure> {
        let key = id.to_string();

        match &id.kind {
            StepKind::Prepare => {
                let triggers = vec![fingerprint(component.prepare.as_bytes()).into()];

                let _guard = self.store.lock(&key).await;
                let status = match self.decide(&key, &triggers).await? {
                    None => StepStatus::Unchanged,
                    Some(_) if dry_run => StepStatus::Planned {
                        variant: Variant::Run,
                    },
                    Some(_) => {
                        self.run_script(&component.prepare, component.timeout)
                            .await?;
                        self.commit(&key, triggers).await?;
                        StepStatus::Applied {
                            variant: Variant::Run,
                        }
                    }
                };
                Ok((status, None))
            }
            StepKind::Copy(name) => {
                let artifact = component.artifact(name).ok_or_else(|| {
                    StepFailure::new(FailureKind::Staging, format!("unknown artifact {name}"))
                })?;
                let bytes = self.artifact_bytes(artifact).await?;

                let _guard = self.store.lock(&key).await;
                let staged = self
                    .staging
                    .stage(&component.name, &artifact.name, &bytes)
                    .await
                    .map_err(|e| StepFailure::new(FailureKind::Staging, e.to_string()))?;
                let digest = staged.fingerprint.to_string();
                let triggers = vec![
                    digest.clone(),
                    artifact.destination.display().to_string(),
                    format!("{:o}", artifact.mode),
                ];

                let status = match self.decide(&key, &triggers).await? {
                    None => StepStatus::Unchanged,
                    Some(_) if dry_run => StepStatus::Planned {
                        variant: Variant::Run,
                    },
                    Some(_) => {
                        self.executor
                            .copy(&bytes, &artifact.destination, artifact.mode)
                            .await
                            .map_err(|e| StepFailure {
                                kind: FailureKind::RemoteExecution,
                                message: e.to_string(),
                                exit_status: e.exit_status(),
                            })?;
                        self.commit(&key, triggers).await?;
                        StepStatus::Applied {
                            variant: Variant::Run,
                        }
                    }
                };
                Ok((status, Some(digest)))
            }
            StepKind::InstallOrUpdate => {
                let mut triggers: Vec<String> = upstream
                    .iter()
                    .filter_map(|o| o.fingerprint.clone())
                    .collect();
                triggers.push(format!("create:{}", fingerprint(component.create.as_bytes())));
                triggers.push(format!("update:{}", fingerprint(component.update.as_bytes())));
                for trigger in &component.triggers {
                    let value = trigger.get().await.map_err(|e| {
                        StepFailure::new(FailureKind::InputUnresolved, format!("trigger: {e}"))
                    })?;
                    triggers.push(value);
                }

                let _guard = self.store.lock(&key).await;
                let status = match self.decide(&key, &triggers).await? {
                    None => StepStatus::Unchanged,
                    Some(variant) if dry_run => StepStatus::Planned { variant },
                    Some(variant) => {
                        let script = match variant {
                            Variant::Create => &component.create,
                            _ => &component.update,
                        };
                        self.run_script(script, component.timeout).await?;
                        self.commit(&key, triggers).await?;
                        StepStatus::Applied { variant }
                    }
                };
                Ok((status, None))
            }
        }
    }

    /// `None` when the snapshot matches, else the script variant to run
    async fn decide(&self, key: &str, triggers: &[String]) -> Result<Option<Variant>, StepFailure> {
        let previous = self
            .store
            .load(key)
            .await
            .map_err(|e| StepFailure::new(FailureKind::TriggerStore, e.to_string()))?;

        Ok(match previous {
            None => Some(Variant::Create),
            Some(record) if record.triggers == triggers => None,
            Some(_) => Some(Variant::Update),
        })
    }

    async fn commit(&self, key: &str, triggers: Vec<String>) -> Result<(), StepFailure> {
        self.store
            .record(key, StepRecord::new(triggers))
            .await
            .map_err(|e| StepFailure::new(FailureKind::TriggerStore, e.to_string()))
    }

    async fn run_script(&self, script: &str, timeout: Duration) -> Result<(), StepFailure> {
        let remote_failure = |e: hostforge_exec::ExecError| StepFailure {
            kind: FailureKind::RemoteExecution,
            message: e.to_string(),
            exit_status: e.exit_status(),
        };

        let result = self
            .executor
            .run_with_timeout(script, timeout)
            .await
            .map_err(remote_failure)?
            .into_success()
            .map_err(remote_failure)?;

        debug!(duration = ?result.duration, "script succeeded");
        Ok(())
    }

    async fn artifact_bytes(&self, artifact: &Artifact) -> Result<Vec<u8>, StepFailure> {
        match &artifact.source {
            ArtifactSource::Static(path) => tokio::fs::read(path).await.map_err(|e| {
                StepFailure::new(FailureKind::Staging, format!("{}: {e}", path.display()))
            }),
            ArtifactSource::Bytes(bytes) => Ok(bytes.clone()),
            ArtifactSource::Template { template, inputs } => {
                let record = inputs.resolve().await.map_err(|(field, err)| {
                    StepFailure::new(FailureKind::InputUnresolved, format!("{field}: {err}"))
                })?;
                self.renderer
                    .render(template, &record)
                    .map_err(|e| StepFailure::new(FailureKind::Template, e.to_string()))
            }
        }
    }
}

/// A running deployment
///
/// Cloneable; every clone observes the same steps and report.
#[derive(Clone)]
pub struct DeploymentHandle {
    completions: HashMap<String, StepFuture>,
    report: Shared<BoxFuture<'static, DeploymentReport>>,
    abort: AbortSignal,
    dry_run: bool,
}

impl fmt::Debug for DeploymentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentHandle")
            .field("components", &self.completions.len())
            .field("dry_run", &self.dry_run)
            .field("finished", &self.is_finished())
            .field("aborted", &self.abort.is_aborted())
            .finish()
    }
}

impl DeploymentHandle {
    /// Resolves with the outcome of `component`'s install step
    ///
    /// Lets work that needs one component (such as secret bootstrap) start
    /// before the rest of the graph is done.
    #[must_use]
    pub fn completion(
        &self,
        component: &str,
    ) -> Option<impl Future<Output = StepOutcome> + Send + 'static> {
        self.completions.get(component).cloned()
    }

    /// Stop starting new steps
    pub fn abort(&self) {
        warn!("abort requested; waiting for running steps");
        self.abort.abort();
    }

    /// The signal behind `abort`
    #[must_use]
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Whether this is a dry run
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Whether every step has resolved
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.report.peek().is_some()
    }

    /// The report, if the deployment has finished
    #[must_use]
    pub fn try_report(&self) -> Option<DeploymentReport> {
        self.report.peek().cloned()
    }

    /// Wait for every step to resolve
    pub async fn wait(self) -> DeploymentReport {
        self.report.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_signal_is_shared() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        clone.abort();
        assert!(signal.is_aborted());
    }
}
