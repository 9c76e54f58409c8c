//! Render, stage and fingerprint together

use hostforge_render::{StagingArea, TemplateRenderer, fingerprint};
use serde_json::json;

const COMPOSE: &str = r#"services:
  vault:
    image: hashicorp/vault:{{ vault_version }}
    environment:
      VAULT_ADDR: "https://{{ domain }}"
"#;

#[tokio::test]
async fn test_staged_fingerprint_tracks_rendered_content() {
    let dir = tempfile::tempdir().unwrap();
    let staging = StagingArea::new(dir.path()).await.unwrap();
    let mut renderer = TemplateRenderer::new();
    renderer.add_raw("vault/docker-compose.yml", COMPOSE).unwrap();

    let record = json!({ "vault_version": "1.17", "domain": "vault.example.org" });
    let bytes = renderer.render("vault/docker-compose.yml", &record).unwrap();
    let first = staging.stage("vault", "docker-compose.yml", &bytes).await.unwrap();

    // Same inputs, same fingerprint
    let again = renderer.render("vault/docker-compose.yml", &record).unwrap();
    let second = staging.stage("vault", "docker-compose.yml", &again).await.unwrap();
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.fingerprint, fingerprint(&bytes));

    let changed = json!({ "vault_version": "1.18", "domain": "vault.example.org" });
    let bytes = renderer.render("vault/docker-compose.yml", &changed).unwrap();
    let third = staging.stage("vault", "docker-compose.yml", &bytes).await.unwrap();
    assert_ne!(first.fingerprint, third.fingerprint);

    // The staged file holds the latest render
    let on_disk = std::fs::read_to_string(&third.path).unwrap();
    assert!(on_disk.contains("hashicorp/vault:1.18"));
}
