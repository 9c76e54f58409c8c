//! Generic component pipeline
//!
//! Every deployable unit (container runtime, proxy, secret service, VPN
//! portal, routing daemon, mesh agent) is described by the same shape: a
//! prepare script, a list of artifacts, create/update scripts, external
//! triggers and the components it depends on.

use std::time::Duration;

use crate::deferred::Deferred;
use crate::model::Artifact;

/// Upper bound for a single create/update script
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(40 * 60);

/// A named deployable unit
#[derive(Debug, Clone)]
pub struct Component {
    /// Unique name, also the directory under `/opt`
    pub name: String,
    /// Environment setup script
    pub prepare: String,
    /// Files transferred before installing
    pub artifacts: Vec<Artifact>,
    /// Script run the first time the component is installed
    pub create: String,
    /// Script run when any trigger changed since the last install
    pub update: String,
    /// Identifiers outside the artifact set that force a reinstall
    pub triggers: Vec<Deferred<String>>,
    /// Components whose install must succeed first
    pub depends_on: Vec<String>,
    /// Time limit for prepare and install scripts
    pub timeout: Duration,
}

impl Component {
    /// Start describing a component
    pub fn builder(name: impl Into<String>) -> ComponentBuilder {
        ComponentBuilder::new(name)
    }

    /// Look up an artifact by name
    #[must_use]
    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Prepare script used when none is given
    #[must_use]
    pub fn default_prepare(name: &str) -> String {
        format!("mkdir -p /opt/{name}")
    }
}

/// Builder for `Component`
#[derive(Debug)]
pub struct ComponentBuilder {
    name: String,
    prepare: Option<String>,
    artifacts: Vec<Artifact>,
    create: String,
    update: Option<String>,
    triggers: Vec<Deferred<String>>,
    depends_on: Vec<String>,
    timeout: Duration,
}

impl ComponentBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prepare: None,
            artifacts: Vec::new(),
            create: String::new(),
            update: None,
            triggers: Vec::new(),
            depends_on: Vec::new(),
            timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }

    /// Replace the default `mkdir -p /opt/<name>` prepare script
    #[must_use]
    pub fn prepare(mut self, script: impl Into<String>) -> Self {
        self.prepare = Some(script.into());
        self
    }

    /// Add an artifact
    #[must_use]
    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Script for the first install; also used for updates unless
    /// `update` is set
    #[must_use]
    pub fn install(mut self, script: impl Into<String>) -> Self {
        self.create = script.into();
        self
    }

    /// Script for subsequent installs
    #[must_use]
    pub fn update(mut self, script: impl Into<String>) -> Self {
        self.update = Some(script.into());
        self
    }

    /// Add a literal external trigger
    #[must_use]
    pub fn trigger(mut self, value: impl Into<String>) -> Self {
        self.triggers.push(Deferred::ready(value.into()));
        self
    }

    /// Add a trigger known only once the deployment runs
    #[must_use]
    pub fn deferred_trigger(mut self, value: Deferred<String>) -> Self {
        self.triggers.push(value);
        self
    }

    /// Require `component`'s install to succeed before this one starts
    #[must_use]
    pub fn depends_on(mut self, component: impl Into<String>) -> Self {
        self.depends_on.push(component.into());
        self
    }

    /// Time limit for prepare and install scripts
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Finish the component
    #[must_use]
    pub fn build(self) -> Component {
        let prepare = self
            .prepare
            .unwrap_or_else(|| Component::default_prepare(&self.name));
        let update = self.update.unwrap_or_else(|| self.create.clone());
        Component {
            name: self.name,
            prepare,
            artifacts: self.artifacts,
            create: self.create,
            update,
            triggers: self.triggers,
            depends_on: self.depends_on,
            timeout: self.timeout,
        }
    }
}
