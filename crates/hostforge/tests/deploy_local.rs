use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use hostforge::config::Config;
use hostforge::driver::{self, BootstrapOutcome};
use hostforge::GeneratedValues;
use hostforge_core::{ComponentStatus, FailureKind};
use hostforge_exec::{LocalExecutor, RemoteExecutor};

const CONFIG: &str = r#"
[values]
domain = "example.com"

[generated]
admin_password = 20

[[component]]
name = "docker"
prepare = "mkdir -p opt/docker"
install = "echo run >> opt/docker/runs"

[[component]]
name = "app"
prepare = "mkdir -p opt/app"
install = "echo run >> opt/app/runs"
depends_on = ["docker"]

[[component.artifact]]
name = "config"
template = "app/config.j2"
destination = "/opt/app/config.yml"
mode = "0600"

[[component]]
name = "vault"
prepare = "mkdir -p opt/vault"
install = "true"
depends_on = ["docker"]

[component.bootstrap]
address = "http://127.0.0.1:9"
script = '''
echo init >> bootstrap-runs
echo '--START TOKENS--'
echo 'root_token: hvs.test'
echo 'recovery_keys: [a, b, c, d, e]'
echo '--END TOKENS--'
'''
"#;

struct Sandbox {
    dir: tempfile::TempDir,
    config: Config,
    generated: GeneratedValues,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();

        std::fs::create_dir_all(base.join("assets/templates/app")).unwrap();
        std::fs::write(
            base.join("assets/templates/app/config.j2"),
            "domain: {{ domain }}\npassword: {{ admin_password }}\nname: {{ name }}\n",
        )
        .unwrap();
        std::fs::create_dir_all(base.join("root")).unwrap();

        let mut config = Config::parse(CONFIG).unwrap();
        config.deploy.assets_dir = base.join("assets");
        config.deploy.staging_dir = base.join("state/staging");
        config.deploy.state_file = base.join("state/state.json");
        config.deploy.report_file = base.join("state/deployment.json");

        let generated = GeneratedValues::load_or_create(
            &config.deploy.state_dir().join("generated.json"),
            &config.generated,
        )
        .unwrap();

        Self {
            dir,
            config,
            generated,
        }
    }

    fn root(&self) -> std::path::PathBuf {
        self.dir.path().join("root")
    }

    fn executor(&self) -> Arc<dyn RemoteExecutor> {
        Arc::new(LocalExecutor::with_root(self.root()))
    }

    fn lines(&self, relative: &str) -> usize {
        std::fs::read_to_string(self.root().join(relative))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

fn assert_private(path: &Path) {
    let mode = std::fs::metadata(path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600, "{}", path.display());
}

#[tokio::test]
async fn test_second_deploy_changes_nothing() {
    let sandbox = Sandbox::new();

    let first = driver::deploy(&sandbox.config, &sandbox.generated, sandbox.executor(), false)
        .await
        .unwrap();
    assert!(first.report.is_success());
    assert_eq!(
        first.components["app"],
        ComponentStatus::Completed { changed: true }
    );

    let config = std::fs::read_to_string(sandbox.root().join("opt/app/config.yml")).unwrap();
    assert!(config.contains("domain: example.com"));
    assert!(config.contains(sandbox.generated.get("admin_password").unwrap()));
    assert_private(&sandbox.root().join("opt/app/config.yml"));
    assert!(sandbox.dir.path().join("state/staging/app/config").exists());

    let second = driver::deploy(&sandbox.config, &sandbox.generated, sandbox.executor(), false)
        .await
        .unwrap();
    assert_eq!(second.report.applied_count(), 0);
    assert_eq!(
        second.components["app"],
        ComponentStatus::Completed { changed: false }
    );
    assert_eq!(sandbox.lines("opt/docker/runs"), 1);
    assert_eq!(sandbox.lines("opt/app/runs"), 1);
}

#[tokio::test]
async fn test_plan_touches_nothing() {
    let sandbox = Sandbox::new();

    let summary = driver::deploy(&sandbox.config, &sandbox.generated, sandbox.executor(), true)
        .await
        .unwrap();

    assert!(summary.report.dry_run);
    assert_eq!(summary.components["docker"], ComponentStatus::Planned);
    assert!(!sandbox.root().join("opt").exists());
    assert!(matches!(
        summary.secrets[0].outcome,
        BootstrapOutcome::Skipped { .. }
    ));
    assert_eq!(sandbox.lines("bootstrap-runs"), 0);
}

#[tokio::test]
async fn test_unreachable_store_keeps_rescue_and_never_reinitializes() {
    let sandbox = Sandbox::new();

    let first = driver::deploy(&sandbox.config, &sandbox.generated, sandbox.executor(), false)
        .await
        .unwrap();
    assert!(first.report.is_success());
    assert!(!first.is_success());

    let BootstrapOutcome::Failed(failure) = &first.secrets[0].outcome else {
        panic!("expected bootstrap failure");
    };
    assert_eq!(failure.kind, FailureKind::SecretStore);
    assert!(!failure.message.contains("hvs.test"));

    let rescue = sandbox.dir.path().join("state/vault-secrets.rescue.json");
    assert_private(&rescue);

    first.write(&sandbox.config.deploy.report_file).await.unwrap();
    let written = std::fs::read_to_string(&sandbox.config.deploy.report_file).unwrap();
    assert!(!written.contains("hvs.test"));

    driver::deploy(&sandbox.config, &sandbox.generated, sandbox.executor(), false)
        .await
        .unwrap();
    assert_eq!(sandbox.lines("bootstrap-runs"), 1);
    assert!(rescue.exists());
}

#[tokio::test]
async fn test_render_artifact() {
    let sandbox = Sandbox::new();

    let bytes = driver::render_artifact(&sandbox.config, &sandbox.generated, "app", "config")
        .await
        .unwrap();
    let text = String::from_utf8(bytes).unwrap();

    assert!(text.contains("name: app"));
    assert!(
        driver::render_artifact(&sandbox.config, &sandbox.generated, "app", "missing")
            .await
            .is_err()
    );
}

#[test]
fn test_component_order() {
    let sandbox = Sandbox::new();
    let order = driver::component_order(&sandbox.config, &sandbox.generated).unwrap();

    assert_eq!(order[0], "docker");
    assert_eq!(order.len(), 3);
}
