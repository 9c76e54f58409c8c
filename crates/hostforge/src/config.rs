//! Configuration loading and types

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration read from `hostforge.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local paths and logging
    #[serde(default)]
    pub deploy: DeployConfig,
    /// Target host
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Template inputs shared by every component
    #[serde(default)]
    pub values: BTreeMap<String, toml::Value>,
    /// Random values created once and reused on every run
    #[serde(default)]
    pub generated: BTreeMap<String, GeneratedSpec>,
    /// Components to deploy
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentConfig>,
}

/// Local paths and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Where rendered artifacts are staged for inspection
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Trigger store file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Scripts and static files; relative `file` references resolve here
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
    /// Template directory, defaults to `<assets_dir>/templates`
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    /// Where the deployment report is written
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            state_file: default_state_file(),
            assets_dir: default_assets_dir(),
            templates_dir: None,
            report_file: default_report_file(),
            log_level: default_log_level(),
        }
    }
}

impl DeployConfig {
    /// Template directory in effect
    #[must_use]
    pub fn templates_dir(&self) -> PathBuf {
        self.templates_dir
            .clone()
            .unwrap_or_else(|| self.assets_dir.join("templates"))
    }

    /// Directory next to the state file, used for generated values and
    /// rescue files
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(".hostforge/staging")
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".hostforge/state.json")
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from("assets")
}

fn default_report_file() -> PathBuf {
    PathBuf::from(".hostforge/deployment.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Target host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Address; `localhost` runs everything locally
    #[serde(default = "default_host")]
    pub host: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,
    /// Private key file
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Environment variable holding the private key PEM
    #[serde(default)]
    pub key_env: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            key_path: None,
            key_env: None,
        }
    }
}

impl ConnectionConfig {
    /// Whether commands run on this machine instead of over SSH
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1"
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

/// A generated value: a length, or a table with options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeneratedSpec {
    /// Alphanumeric value of this length
    Length(usize),
    /// Full form
    Options {
        /// Number of characters
        length: usize,
    },
}

impl GeneratedSpec {
    /// Number of characters to generate
    #[must_use]
    pub fn length(&self) -> usize {
        match self {
            GeneratedSpec::Length(length) | GeneratedSpec::Options { length } => *length,
        }
    }
}

/// A script given inline or as a file under the assets directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptSource {
    /// Script text
    Inline(String),
    /// Script file
    File {
        /// Path, relative to the assets directory unless absolute
        file: PathBuf,
    },
}

/// One deployable component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Unique name
    pub name: String,
    /// Setup script, defaults to creating `/opt/<name>`
    #[serde(default)]
    pub prepare: Option<ScriptSource>,
    /// Script run on first install
    pub install: ScriptSource,
    /// Script run when something changed, defaults to `install`
    #[serde(default)]
    pub update: Option<ScriptSource>,
    /// Extra values that force a reinstall when they change
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Components whose install must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Install time limit in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Template inputs for this component only
    #[serde(default)]
    pub inputs: BTreeMap<String, toml::Value>,
    /// Files transferred before installing
    #[serde(default, rename = "artifact")]
    pub artifacts: Vec<ArtifactConfig>,
    /// One-time secret bootstrap after a successful install
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
}

/// One transferred file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Name, unique within the component
    pub name: String,
    /// Template name under the templates directory
    #[serde(default)]
    pub template: Option<String>,
    /// Static file under the assets directory
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Absolute path on the target
    pub destination: PathBuf,
    /// Octal permission bits, e.g. "0640"
    #[serde(default)]
    pub mode: Option<String>,
}

/// Secret bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Initialization script
    pub script: ScriptSource,
    /// Secret store address, e.g. `https://vault.example.com:8200`
    pub address: String,
    /// Script time limit in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// KV mount
    #[serde(default)]
    pub mount: Option<String>,
    /// Entry inside the mount
    #[serde(default)]
    pub entry: Option<String>,
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration text
    ///
    /// # Errors
    /// Returns error if the text is not a valid configuration
    pub fn parse(content: &str) -> eyre::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a found file cannot be read or parsed
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("HOSTFORGE_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            PathBuf::from("hostforge.toml"),
            PathBuf::from("/etc/hostforge/hostforge.toml"),
            dirs::config_dir()
                .map(|p| p.join("hostforge/hostforge.toml"))
                .unwrap_or_default(),
        ];

        for path in paths {
            if path.is_file() {
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Look up a component by name
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.name == name)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.connection.key_path.is_some() && self.connection.key_env.is_some() {
            eyre::bail!("connection: set key_path or key_env, not both");
        }
        for component in &self.components {
            for artifact in &component.artifacts {
                match (&artifact.template, &artifact.file) {
                    (Some(_), None) | (None, Some(_)) => {}
                    _ => eyre::bail!(
                        "component {} artifact {}: set exactly one of template or file",
                        component.name,
                        artifact.name
                    ),
                }
                if !artifact.destination.is_absolute() {
                    eyre::bail!(
                        "component {} artifact {}: destination must be absolute",
                        component.name,
                        artifact.name
                    );
                }
                artifact.mode()?;
            }
        }
        Ok(())
    }
}

impl ArtifactConfig {
    /// Permission bits, 0644 when unset
    ///
    /// # Errors
    /// Returns error if `mode` is not an octal number
    pub fn mode(&self) -> eyre::Result<u32> {
        match &self.mode {
            None => Ok(hostforge_core::Artifact::DEFAULT_MODE),
            Some(mode) => u32::from_str_radix(mode.trim_start_matches("0o"), 8)
                .map_err(|_| eyre::eyre!("artifact {}: invalid mode {mode:?}", self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[deploy]
state_file = "/var/lib/hostforge/state.json"
log_level = "debug"

[connection]
host = "203.0.113.10"
key_env = "HOSTFORGE_SSH_KEY"

[values]
domain = "example.com"
replicas = 2

[generated]
admin_password = 32
session_secret = { length = 64 }

[[component]]
name = "docker"
install = { file = "docker/install.sh" }

[[component]]
name = "vault"
install = "docker compose -f /opt/vault/docker-compose.yml up -d"
depends_on = ["docker"]
triggers = ["1.15.0"]
inputs = { version = "1.15.0" }

[[component.artifact]]
name = "compose"
template = "vault/docker-compose.yml.j2"
destination = "/opt/vault/docker-compose.yml"

[[component.artifact]]
name = "config"
file = "vault/vault-config.hcl"
destination = "/opt/vault/config/vault-config.hcl"
mode = "0640"

[component.bootstrap]
script = { file = "vault/init.sh" }
address = "https://vault.example.com:8200"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();

        assert_eq!(config.connection.host, "203.0.113.10");
        assert_eq!(config.connection.user, "root");
        assert_eq!(config.connection.port, 22);
        assert!(!config.connection.is_local());
        assert_eq!(config.deploy.state_dir(), PathBuf::from("/var/lib/hostforge"));
        assert_eq!(config.deploy.templates_dir(), PathBuf::from("assets/templates"));
        assert_eq!(config.generated["admin_password"].length(), 32);
        assert_eq!(config.generated["session_secret"].length(), 64);

        let vault = config.component("vault").unwrap();
        assert_eq!(vault.depends_on, vec!["docker"]);
        assert_eq!(vault.artifacts.len(), 2);
        assert_eq!(vault.artifacts[1].mode().unwrap(), 0o640);
        assert_eq!(vault.artifacts[0].mode().unwrap(), 0o644);
        assert!(matches!(vault.install, ScriptSource::Inline(_)));
        assert!(vault.bootstrap.is_some());

        let docker = config.component("docker").unwrap();
        assert_eq!(
            docker.install,
            ScriptSource::File {
                file: PathBuf::from("docker/install.sh")
            }
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.connection.is_local());
        assert_eq!(config.deploy.log_level, "info");
        assert!(config.components.is_empty());
    }

    #[test]
    fn test_artifact_needs_one_source() {
        let text = r#"
[[component]]
name = "traefik"
install = "true"

[[component.artifact]]
name = "config"
destination = "/opt/traefik/traefik.yml"
"#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_relative_destination_rejected() {
        let text = r#"
[[component]]
name = "traefik"
install = "true"

[[component.artifact]]
name = "config"
file = "traefik.yml"
destination = "opt/traefik/traefik.yml"
"#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_invalid_mode() {
        let text = r#"
[[component]]
name = "traefik"
install = "true"

[[component.artifact]]
name = "config"
file = "traefik.yml"
destination = "/opt/traefik/traefik.yml"
mode = "rw-r--r--"
"#;
        assert!(Config::parse(text).is_err());
    }
}
