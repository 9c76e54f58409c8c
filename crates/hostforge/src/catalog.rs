//! Turns configuration into components and bootstrap plans

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Result, WrapErr};

use hostforge_core::{Artifact, Component, DEFAULT_INSTALL_TIMEOUT, InputRecord};
use hostforge_secrets::SecretLayout;

use crate::config::{ComponentConfig, Config, ScriptSource};
use crate::generated::GeneratedValues;

/// Secret bootstrap attached to a component
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    /// Component whose install must complete first
    pub component: String,
    /// Initialization script text
    pub script: String,
    /// Secret store address
    pub address: String,
    /// Script time limit
    pub timeout: Duration,
    /// Where the bundle is stored
    pub layout: SecretLayout,
}

/// Everything one configuration deploys
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Components in configuration order
    pub components: Vec<Component>,
    /// Bootstraps in configuration order
    pub bootstraps: Vec<BootstrapPlan>,
}

impl Catalog {
    /// Build components and bootstrap plans from `config`
    ///
    /// # Errors
    /// Returns error if a script file cannot be read or an artifact is
    /// misconfigured
    pub fn build(config: &Config, generated: &GeneratedValues) -> Result<Self> {
        let mut components = Vec::with_capacity(config.components.len());
        let mut bootstraps = Vec::new();

        for component in &config.components {
            components.push(build_component(config, component, generated)?);

            if let Some(bootstrap) = &component.bootstrap {
                let defaults = SecretLayout::default();
                bootstraps.push(BootstrapPlan {
                    component: component.name.clone(),
                    script: load_script(&config.deploy.assets_dir, &bootstrap.script)
                        .wrap_err_with(|| format!("component {}: bootstrap script", component.name))?,
                    address: bootstrap.address.clone(),
                    timeout: bootstrap
                        .timeout_secs
                        .map_or(DEFAULT_INSTALL_TIMEOUT, Duration::from_secs),
                    layout: SecretLayout {
                        mount: bootstrap.mount.clone().unwrap_or(defaults.mount),
                        entry: bootstrap.entry.clone().unwrap_or(defaults.entry),
                        description: defaults.description,
                    },
                });
            }
        }

        Ok(Self {
            components,
            bootstraps,
        })
    }
}

/// Template inputs for `component`
///
/// Component inputs win over generated values, which win over global
/// values. `name` and `host` are always present.
#[must_use]
pub fn inputs_for(
    config: &Config,
    component: &ComponentConfig,
    generated: &GeneratedValues,
) -> InputRecord {
    let mut record = InputRecord::new();
    for (key, value) in &component.inputs {
        record.insert(key.clone(), toml_to_json(value));
    }

    let mut shared = InputRecord::new();
    for (key, value) in generated.iter() {
        shared.insert(key, value);
    }
    for (key, value) in &config.values {
        if generated.get(key).is_none() {
            shared.insert(key.clone(), toml_to_json(value));
        }
    }
    shared.insert("name", component.name.as_str());
    shared.insert("host", config.connection.host.as_str());

    record.merge_missing(&shared);
    record
}

fn build_component(
    config: &Config,
    component: &ComponentConfig,
    generated: &GeneratedValues,
) -> Result<Component> {
    let assets = &config.deploy.assets_dir;
    let context = || format!("component {}", component.name);
    let inputs = inputs_for(config, component, generated);

    let mut builder = Component::builder(&component.name)
        .install(load_script(assets, &component.install).wrap_err_with(context)?);

    if let Some(prepare) = &component.prepare {
        builder = builder.prepare(load_script(assets, prepare).wrap_err_with(context)?);
    }
    if let Some(update) = &component.update {
        builder = builder.update(load_script(assets, update).wrap_err_with(context)?);
    }
    for trigger in &component.triggers {
        builder = builder.trigger(trigger.clone());
    }
    for dependency in &component.depends_on {
        builder = builder.depends_on(dependency.clone());
    }
    if let Some(secs) = component.timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    for artifact in &component.artifacts {
        let mode = artifact.mode()?;
        let built = match (&artifact.template, &artifact.file) {
            (Some(template), None) => Artifact::template(
                &artifact.name,
                template,
                inputs.clone(),
                &artifact.destination,
            ),
            (None, Some(file)) => {
                Artifact::file(&artifact.name, asset_path(assets, file), &artifact.destination)
            }
            _ => eyre::bail!(
                "component {} artifact {}: set exactly one of template or file",
                component.name,
                artifact.name
            ),
        };
        builder = builder.artifact(built.with_mode(mode));
    }

    Ok(builder.build())
}

pub(crate) fn asset_path(assets: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        assets.join(file)
    }
}

/// Script text for `source`
///
/// # Errors
/// Returns error if a script file cannot be read
pub fn load_script(assets: &Path, source: &ScriptSource) -> Result<String> {
    match source {
        ScriptSource::Inline(script) => Ok(script.clone()),
        ScriptSource::File { file } => {
            let path = asset_path(assets, file);
            std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("failed to read script {}", path.display()))
        }
    }
}

fn toml_to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::Value::from(*i),
        toml::Value::Float(f) => serde_json::Value::from(*f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(*b),
        toml::Value::Datetime(d) => serde_json::Value::String(d.to_string()),
        toml::Value::Array(items) => items.iter().map(toml_to_json).collect(),
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostforge_core::ArtifactSource;

    fn config(assets: &Path) -> Config {
        let mut config = Config::parse(
            r#"
[connection]
host = "203.0.113.10"

[values]
domain = "example.com"
admin_password = "from-values"

[[component]]
name = "docker"
install = { file = "docker/install.sh" }

[[component]]
name = "vault"
install = "docker compose up -d"
update = "docker compose up -d --force-recreate"
depends_on = ["docker"]
triggers = ["1.15.0"]
timeout_secs = 600
inputs = { domain = "vault.example.com", ports = [8200, 8201] }

[[component.artifact]]
name = "compose"
template = "vault/docker-compose.yml.j2"
destination = "/opt/vault/docker-compose.yml"
mode = "0600"

[[component.artifact]]
name = "policy"
file = "vault/policy.hcl"
destination = "/opt/vault/policy.hcl"

[component.bootstrap]
script = "vault operator init"
address = "https://vault.example.com:8200"
"#,
        )
        .unwrap();
        config.deploy.assets_dir = assets.to_path_buf();
        config
    }

    #[test]
    fn test_build_components() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docker")).unwrap();
        std::fs::write(dir.path().join("docker/install.sh"), "apt-get install -y docker.io").unwrap();

        let catalog = Catalog::build(&config(dir.path()), &GeneratedValues::default()).unwrap();

        assert_eq!(catalog.components.len(), 2);
        let docker = &catalog.components[0];
        assert_eq!(docker.create, "apt-get install -y docker.io");
        assert_eq!(docker.prepare, "mkdir -p /opt/docker");

        let vault = &catalog.components[1];
        assert_eq!(vault.depends_on, vec!["docker"]);
        assert_eq!(vault.update, "docker compose up -d --force-recreate");
        assert_eq!(vault.timeout, Duration::from_secs(600));
        assert_eq!(vault.artifact("compose").unwrap().mode, 0o600);
        assert!(matches!(
            &vault.artifact("policy").unwrap().source,
            ArtifactSource::Static(path) if path == &dir.path().join("vault/policy.hcl")
        ));

        assert_eq!(catalog.bootstraps.len(), 1);
        assert_eq!(catalog.bootstraps[0].component, "vault");
        assert_eq!(catalog.bootstraps[0].timeout, DEFAULT_INSTALL_TIMEOUT);
        assert_eq!(catalog.bootstraps[0].layout, SecretLayout::default());
    }

    #[test]
    fn test_missing_script_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Catalog::build(&config(dir.path()), &GeneratedValues::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_input_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let specs = [(
            "admin_password".to_string(),
            crate::config::GeneratedSpec::Length(12),
        )]
        .into_iter()
        .collect();
        let generated =
            GeneratedValues::load_or_create(&dir.path().join("generated.json"), &specs).unwrap();

        let inputs = inputs_for(&config, config.component("vault").unwrap(), &generated);
        let resolved = inputs.resolve().await.unwrap();

        assert_eq!(resolved["domain"], "vault.example.com");
        assert_eq!(resolved["ports"][1], 8201);
        assert_eq!(resolved["name"], "vault");
        assert_eq!(resolved["host"], "203.0.113.10");
        assert_eq!(
            resolved["admin_password"],
            generated.get("admin_password").unwrap()
        );
    }
}
