//! Running deployments, plans and secret bootstraps

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr, eyre};
use kameo::actor::Spawn;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use hostforge_core::{
    AbortSignal, ComponentStatus, Deploy, DeploymentActor, DeploymentActorArgs, DeploymentReport,
    Engine, FileTriggerStore, StepFailure, StepOutcome, TaskGraph, TriggerStore,
};
use hostforge_exec::{ConnectionSpec, KeySource, LocalExecutor, RemoteExecutor, SshExecutor};
use hostforge_render::{StagingArea, TemplateRenderer};
use hostforge_secrets::{
    OwnedSecret, SecretBootstrap, SecretBundle, SecretStore, SecretStoreError, StoreConnector,
    VaultKvStore,
};

use crate::catalog::{Catalog, asset_path, inputs_for};
use crate::config::{Config, ConnectionConfig};
use crate::generated::GeneratedValues;

/// What became of one secret bootstrap
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// Secrets are stored
    Stored {
        /// Where they are stored
        secret: OwnedSecret,
    },
    /// Bootstrap did not run
    Skipped {
        /// Why not
        reason: String,
    },
    /// Bootstrap ran and failed
    Failed(StepFailure),
}

/// Bootstrap outcome of one component
#[derive(Debug, Clone, Serialize)]
pub struct SecretSummary {
    /// Component name
    pub component: String,
    /// Outcome
    #[serde(flatten)]
    pub outcome: BootstrapOutcome,
}

/// Everything a `deploy` or `plan` run produced; written as the report file
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummary {
    /// Step and component outcomes
    pub report: DeploymentReport,
    /// Component summaries by name
    pub components: std::collections::BTreeMap<String, ComponentStatus>,
    /// Secret bootstraps
    pub secrets: Vec<SecretSummary>,
}

impl DeploymentSummary {
    /// Whether every step and bootstrap succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.is_success()
            && self
                .secrets
                .iter()
                .all(|s| !matches!(s.outcome, BootstrapOutcome::Failed(_)))
    }

    /// Write the summary as pretty JSON
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?)
            .await
            .wrap_err_with(|| format!("failed to write {}", path.display()))
    }
}

/// Create the executor for the configured host
///
/// # Errors
/// Returns error if SSH is needed and no usable key is configured
pub fn create_executor(
    connection: &ConnectionConfig,
    local_root: Option<&Path>,
) -> Result<Arc<dyn RemoteExecutor>> {
    if let Some(root) = local_root {
        info!(root = %root.display(), "running locally below sandbox root");
        return Ok(Arc::new(LocalExecutor::with_root(root)));
    }
    if connection.is_local() {
        return Ok(Arc::new(LocalExecutor::new()));
    }

    let key = match (&connection.key_path, &connection.key_env) {
        (Some(path), _) => KeySource::Path(path.clone()),
        (None, Some(var)) => KeySource::Env(var.clone()),
        (None, None) => eyre::bail!("connection: key_path or key_env is required for SSH"),
    };
    let spec =
        ConnectionSpec::new(&connection.host, &connection.user, key).with_port(connection.port);
    let executor =
        SshExecutor::new(spec).map_err(|e| eyre!("failed to create SSH executor: {e}"))?;
    Ok(Arc::new(executor))
}

/// Engine over the configured staging directory and templates
///
/// # Errors
/// Returns error if templates fail to load or staging cannot be created
pub async fn create_engine(
    config: &Config,
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<dyn TriggerStore>,
) -> Result<Engine> {
    let templates = config.deploy.templates_dir();
    let renderer = if templates.is_dir() {
        TemplateRenderer::from_dir(&templates)?
    } else {
        warn!(dir = %templates.display(), "template directory not found");
        TemplateRenderer::new()
    };
    let staging = StagingArea::new(&config.deploy.staging_dir).await?;
    Ok(Engine::new(executor, store, staging, Arc::new(renderer)))
}

fn vault_connector(address: String) -> StoreConnector {
    Arc::new(
        move |bundle: &SecretBundle| -> Result<Arc<dyn SecretStore>, SecretStoreError> {
            Ok(Arc::new(VaultKvStore::new(&address, bundle.root_token())?))
        },
    )
}

/// Deploy every component, or plan it when `dry_run` is set
///
/// Secret bootstraps start as soon as their component's install completes
/// and are skipped on dry runs. Ctrl-C stops further steps from starting.
///
/// # Errors
/// Returns error if the deployment cannot be set up; step failures are
/// reported in the summary instead
#[instrument(skip_all, fields(dry_run = dry_run))]
pub async fn deploy(
    config: &Config,
    generated: &GeneratedValues,
    executor: Arc<dyn RemoteExecutor>,
    dry_run: bool,
) -> Result<DeploymentSummary> {
    let Catalog {
        components,
        bootstraps,
    } = Catalog::build(config, generated)?;

    let store: Arc<dyn TriggerStore> =
        Arc::new(FileTriggerStore::open(&config.deploy.state_file).await?);
    let engine = create_engine(config, executor.clone(), store.clone()).await?;

    let actor = DeploymentActor::spawn(DeploymentActorArgs { engine, components });
    let handle = actor
        .ask(Deploy { dry_run })
        .await
        .map_err(|e| eyre!("failed to start deployment: {e}"))?;

    let abort = handle.abort_signal();
    let interrupt = tokio::spawn({
        let abort = abort.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; waiting for running steps");
                abort.abort();
            }
        }
    });

    let state_dir = config.deploy.state_dir();
    let mut tasks = Vec::with_capacity(bootstraps.len());
    for plan in bootstraps {
        let completion = handle.completion(&plan.component);
        let bootstrap = SecretBootstrap::new(
            plan.component.clone(),
            plan.script,
            executor.clone(),
            store.clone(),
            vault_connector(plan.address),
        )
        .timeout(plan.timeout)
        .layout(plan.layout)
        .rescue_path(state_dir.join(format!("{}-secrets.rescue.json", plan.component)));

        tasks.push(tokio::spawn(run_bootstrap(
            bootstrap,
            completion,
            abort.clone(),
            dry_run,
        )));
    }

    let report = handle.wait().await;

    let mut secrets = Vec::with_capacity(tasks.len());
    for task in tasks {
        secrets.push(
            task.await
                .map_err(|e| eyre!("secret bootstrap task failed: {e}"))?,
        );
    }
    interrupt.abort();

    actor
        .stop_gracefully()
        .await
        .map_err(|e| eyre!("failed to stop deployment actor: {e}"))?;

    Ok(DeploymentSummary {
        components: report.components(),
        report,
        secrets,
    })
}

async fn run_bootstrap(
    bootstrap: SecretBootstrap,
    completion: Option<impl Future<Output = StepOutcome>>,
    abort: AbortSignal,
    dry_run: bool,
) -> SecretSummary {
    let component = bootstrap.component().to_string();
    let skipped = |reason: &str| SecretSummary {
        component: component.clone(),
        outcome: BootstrapOutcome::Skipped {
            reason: reason.to_string(),
        },
    };

    let Some(completion) = completion else {
        return skipped("component is not part of the deployment");
    };
    let install = completion.await;

    if dry_run {
        info!(component = %component, "dry run; secret bootstrap not executed");
        return skipped("dry run");
    }
    if !ComponentStatus::from_install(&install).is_completed() {
        warn!(component = %component, status = install.status.label(), "install incomplete; secret bootstrap skipped");
        return skipped("component install did not complete");
    }
    if abort.is_aborted() {
        return skipped("deployment aborted");
    }

    let outcome = match bootstrap.run().await {
        Ok(secret) => {
            info!(component = %component, path = %secret.path(), version = secret.version, "secrets stored");
            BootstrapOutcome::Stored { secret }
        }
        Err(e) => {
            error!(component = %component, error = %e, "secret bootstrap failed");
            BootstrapOutcome::Failed(StepFailure::from(&e))
        }
    };
    SecretSummary { component, outcome }
}

/// Component names in deployment order
///
/// # Errors
/// Returns error if the catalog cannot be built or has a cycle
pub fn component_order(config: &Config, generated: &GeneratedValues) -> Result<Vec<String>> {
    let catalog = Catalog::build(config, generated)?;
    let graph = TaskGraph::build(catalog.components)?;
    Ok(graph.component_order().to_vec())
}

/// Render one artifact of one component without deploying anything
///
/// # Errors
/// Returns error if the component or artifact is unknown or rendering fails
pub async fn render_artifact(
    config: &Config,
    generated: &GeneratedValues,
    component: &str,
    artifact: &str,
) -> Result<Vec<u8>> {
    let component_config = config
        .component(component)
        .ok_or_else(|| eyre!("unknown component {component}"))?;
    let artifact_config = component_config
        .artifacts
        .iter()
        .find(|a| a.name == artifact)
        .ok_or_else(|| eyre!("component {component} has no artifact {artifact}"))?;

    if let Some(file) = &artifact_config.file {
        let path = asset_path(&config.deploy.assets_dir, file);
        return tokio::fs::read(&path)
            .await
            .wrap_err_with(|| format!("failed to read {}", path.display()));
    }

    let template = artifact_config
        .template
        .as_deref()
        .ok_or_else(|| eyre!("artifact {artifact} has neither template nor file"))?;
    let renderer = TemplateRenderer::from_dir(&config.deploy.templates_dir())?;
    let inputs = inputs_for(config, component_config, generated)
        .resolve()
        .await
        .map_err(|(key, e)| eyre!("input {key}: {e}"))?;
    Ok(renderer.render(template, &inputs)?)
}
