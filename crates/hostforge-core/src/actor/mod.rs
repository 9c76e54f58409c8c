//! Actor implementations

pub mod deployment;

pub use deployment::{
    Abort, Deploy, DeploymentActor, DeploymentActorArgs, GetLastReport, LastReport,
    ListComponents, RegisterComponent, UnregisterComponent,
};
