use std::path::{Path, PathBuf};

use hostforge::config::Config;
use hostforge::driver;
use hostforge::{Catalog, GeneratedValues};
use hostforge_core::{StepId, TaskGraph};

const EXAMPLE: &str = include_str!("../../../hostforge.example.toml");

fn assets() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../assets")
}

fn example(dir: &Path) -> (Config, GeneratedValues) {
    let mut config = Config::parse(EXAMPLE).unwrap();
    config.deploy.assets_dir = assets();
    let generated =
        GeneratedValues::load_or_create(&dir.join("generated.json"), &config.generated).unwrap();
    (config, generated)
}

#[test]
fn test_example_deploys_six_components_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let (config, generated) = example(dir.path());

    let catalog = Catalog::build(&config, &generated).unwrap();
    assert_eq!(catalog.components.len(), 6);
    assert_eq!(catalog.bootstraps.len(), 1);
    assert_eq!(catalog.bootstraps[0].component, "vault");

    let graph = TaskGraph::build(catalog.components).unwrap();
    assert_eq!(
        graph.component_order(),
        ["docker", "traefik", "frr", "tailscale", "vault", "wireguard"]
    );
    assert_eq!(
        driver::component_order(&config, &generated).unwrap(),
        graph.component_order()
    );

    for name in ["vault", "wireguard", "frr", "tailscale"] {
        let prepare = graph.step(&StepId::prepare(name)).unwrap();
        assert_eq!(
            prepare.predecessors,
            vec![StepId::install("docker"), StepId::install("traefik")]
        );
    }
}

#[test]
fn test_systemd_units_feed_install_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let (config, generated) = example(dir.path());
    let graph = TaskGraph::build(Catalog::build(&config, &generated).unwrap().components).unwrap();

    for name in ["wireguard", "frr", "tailscale"] {
        let install = graph.step(&StepId::install(name)).unwrap();
        assert!(
            install.predecessors.contains(&StepId::copy(name, "systemd")),
            "{name}: {:?}",
            install.predecessors
        );
    }
}

#[tokio::test]
async fn test_example_templates_render() {
    let dir = tempfile::tempdir().unwrap();
    let (config, generated) = example(dir.path());

    let frr = driver::render_artifact(&config, &generated, "frr", "frr.conf")
        .await
        .unwrap();
    let frr = String::from_utf8(frr).unwrap();
    let password = generated.get("bgp_password").unwrap();
    assert_eq!(password.len(), 24);
    assert!(frr.contains(&format!("neighbor 203.0.113.1 password {password}")));
    assert!(frr.contains("router bgp 65010"));

    let unit = driver::render_artifact(&config, &generated, "tailscale", "systemd")
        .await
        .unwrap();
    let unit = String::from_utf8(unit).unwrap();
    assert!(unit.contains("WorkingDirectory=/opt/tailscale"));

    for component in &config.components {
        for artifact in &component.artifacts {
            driver::render_artifact(&config, &generated, &component.name, &artifact.name)
                .await
                .unwrap_or_else(|e| panic!("{}/{}: {e}", component.name, artifact.name));
        }
    }
}
