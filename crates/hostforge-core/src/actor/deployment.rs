//! `DeploymentActor`: owns the component catalog and serializes deployments
//!
//! Only one deployment runs at a time. `Deploy` replies as soon as the graph
//! is built and the steps are spawned; the caller gets a `DeploymentHandle`
//! to wait on, and `Abort` can be sent while it runs.

use std::collections::BTreeMap;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use kameo_macros::Reply;
use tracing::{info, warn};

use crate::component::Component;
use crate::engine::{DeploymentHandle, Engine};
use crate::error::CoreError;
use crate::graph::TaskGraph;
use crate::report::DeploymentReport;

/// Arguments for spawning a `DeploymentActor`
pub struct DeploymentActorArgs {
    /// Engine used for every deployment
    pub engine: Engine,
    /// Components known at start
    pub components: Vec<Component>,
}

/// Actor wrapping the engine
pub struct DeploymentActor {
    engine: Engine,
    components: BTreeMap<String, Component>,
    current: Option<DeploymentHandle>,
    last_report: Option<DeploymentReport>,
}

impl DeploymentActor {
    /// Whether a deployment is still running; files its report once done
    fn in_flight(&mut self) -> bool {
        let Some(handle) = &self.current else {
            return false;
        };
        match handle.try_report() {
            Some(report) => {
                self.last_report = Some(report);
                self.current = None;
                false
            }
            None => true,
        }
    }
}

impl Actor for DeploymentActor {
    type Args = DeploymentActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let mut components = BTreeMap::new();
        for component in args.components {
            let name = component.name.clone();
            if components.insert(name.clone(), component).is_some() {
                return Err(CoreError::ComponentAlreadyExists(name));
            }
        }

        info!(id = %actor_ref.id(), components = components.len(), "DeploymentActor starting");

        Ok(Self {
            engine: args.engine,
            components,
            current: None,
            last_report: None,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "DeploymentActor stopping");

        if let Some(handle) = self.current.take()
            && !handle.is_finished()
        {
            handle.abort();
        }
        Ok(())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Add a component to the catalog
#[derive(Debug)]
pub struct RegisterComponent {
    /// Component definition
    pub component: Component,
}

/// Remove a component from the catalog
#[derive(Debug)]
pub struct UnregisterComponent {
    /// Component name
    pub name: String,
}

/// List registered component names
#[derive(Debug)]
pub struct ListComponents;

/// Start a deployment of every registered component
#[derive(Debug)]
pub struct Deploy {
    /// Plan only: render and decide without executing or recording
    pub dry_run: bool,
}

/// Stop the running deployment from starting further steps
#[derive(Debug)]
pub struct Abort;

/// Fetch the report of the last finished deployment
#[derive(Debug)]
pub struct GetLastReport;

/// Reply to `GetLastReport`
#[derive(Debug, Clone, Reply)]
pub struct LastReport {
    /// The report, if any deployment has finished
    pub report: Option<DeploymentReport>,
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RegisterComponent> for DeploymentActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: RegisterComponent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let name = msg.component.name.clone();
        if self.components.contains_key(&name) {
            return Err(CoreError::ComponentAlreadyExists(name));
        }

        info!(component = %name, "registered component");
        self.components.insert(name, msg.component);
        Ok(())
    }
}

impl Message<UnregisterComponent> for DeploymentActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: UnregisterComponent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.components.remove(&msg.name).is_some() {
            info!(component = %msg.name, "unregistered component");
            Ok(())
        } else {
            Err(CoreError::ComponentNotFound(msg.name))
        }
    }
}

impl Message<ListComponents> for DeploymentActor {
    type Reply = Vec<String>;

    async fn handle(
        &mut self,
        _msg: ListComponents,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.components.keys().cloned().collect()
    }
}

impl Message<Deploy> for DeploymentActor {
    type Reply = Result<DeploymentHandle, CoreError>;

    async fn handle(&mut self, msg: Deploy, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.in_flight() {
            warn!("deploy rejected: deployment already running");
            return Err(CoreError::DeploymentInProgress);
        }

        let graph = TaskGraph::build(self.components.values().cloned())?;
        let handle = self.engine.start(&graph, msg.dry_run);
        self.current = Some(handle.clone());
        Ok(handle)
    }
}

impl Message<Abort> for DeploymentActor {
    type Reply = bool;

    async fn handle(&mut self, _msg: Abort, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if !self.in_flight() {
            return false;
        }
        if let Some(handle) = &self.current {
            handle.abort();
        }
        true
    }
}

impl Message<GetLastReport> for DeploymentActor {
    type Reply = LastReport;

    async fn handle(
        &mut self,
        _msg: GetLastReport,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.in_flight();
        LastReport {
            report: self.last_report.clone(),
        }
    }
}
