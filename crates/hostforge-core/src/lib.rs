//! hostforge-core: Dependency-ordered provisioning engine
//!
//! Components are expanded into `prepare -> copy* -> install` pipelines,
//! joined into one task graph and driven against a `RemoteExecutor`. Every
//! step records the trigger values of its last successful run so that
//! unchanged inputs cause no remote side effects. The `DeploymentActor`
//! wraps the engine in a kameo actor.

pub mod actor;
pub mod component;
pub mod deferred;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod model;
pub mod report;
pub mod store;

pub use actor::{
    Abort, Deploy, DeploymentActor, DeploymentActorArgs, GetLastReport, LastReport,
    ListComponents, RegisterComponent, UnregisterComponent,
};
pub use component::{Component, ComponentBuilder, DEFAULT_INSTALL_TIMEOUT};
pub use deferred::{Deferred, DeferredError, Resolver};
pub use engine::{AbortSignal, DeploymentHandle, Engine};
pub use error::{CoreError, GraphError, StoreError};
pub use event::DeployEvent;
pub use graph::{StepNode, TaskGraph};
pub use model::{Artifact, ArtifactSource, Input, InputRecord, StepId, StepKind};
pub use report::{
    ComponentStatus, DeploymentReport, FailureKind, StepFailure, StepOutcome, StepStatus, Variant,
};
pub use store::{
    FileTriggerStore, KeyGuard, KeyLocks, MemoryTriggerStore, StepRecord, TriggerStore,
};
