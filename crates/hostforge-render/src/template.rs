//! Template rendering using tera
//!
//! Every variable a template references must be present in the input record.
//! tera rejects undefined variables at render time, so a missing field never
//! turns into an empty string in a deployed config file.

use std::error::Error as _;
use std::path::{Path, PathBuf};

use tera::{Context, Tera};
use tracing::{debug, info, instrument};

use crate::error::RenderError;

/// Renders named templates against JSON input records
#[derive(Debug, Default)]
pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// Create an empty renderer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every file below `dir` as a template named by its relative path
    ///
    /// # Errors
    /// Returns `RenderError::Io` if the directory cannot be walked, or
    /// `RenderError::Template` if a file is not a valid template.
    pub fn from_dir(dir: &Path) -> Result<Self, RenderError> {
        let mut renderer = Self::new();
        let mut files = Vec::new();
        walk(dir, &mut files)?;
        files.sort();

        for path in files {
            let Ok(rel_path) = path.strip_prefix(dir) else {
                continue;
            };
            let name = rel_path.to_string_lossy().replace('\\', "/");
            let content =
                std::fs::read_to_string(&path).map_err(|e| RenderError::io(&path, &e))?;
            renderer.add_raw(&name, &content)?;
        }

        info!(
            count = renderer.tera.get_template_names().count(),
            dir = %dir.display(),
            "loaded templates"
        );
        Ok(renderer)
    }

    /// Register a template from memory
    ///
    /// # Errors
    /// Returns `RenderError::Template` if the template does not parse
    pub fn add_raw(&mut self, name: &str, content: &str) -> Result<(), RenderError> {
        self.tera
            .add_raw_template(name, content)
            .map_err(|e| template_error(name, &e))?;
        debug!(template = name, "registered template");
        Ok(())
    }

    /// Whether a template with this name is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tera.get_template_names().any(|n| n == name)
    }

    /// Names of all registered templates
    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tera.get_template_names().map(String::from).collect();
        names.sort();
        names
    }

    /// Render `name` with `record` as its context
    ///
    /// # Errors
    /// - `RenderError::TemplateNotFound` for an unknown template
    /// - `RenderError::InvalidInput` if `record` is not an object
    /// - `RenderError::Template` if rendering fails, including references to
    ///   fields absent from `record`
    #[instrument(skip(self, record), level = "debug")]
    pub fn render(&self, name: &str, record: &serde_json::Value) -> Result<Vec<u8>, RenderError> {
        if !self.contains(name) {
            return Err(RenderError::TemplateNotFound(name.to_string()));
        }
        if !record.is_object() {
            return Err(RenderError::InvalidInput(name.to_string()));
        }

        let context = Context::from_value(record.clone())
            .map_err(|_| RenderError::InvalidInput(name.to_string()))?;
        let rendered = self
            .tera
            .render(name, &context)
            .map_err(|e| template_error(name, &e))?;

        debug!(template = name, bytes = rendered.len(), "rendered template");
        Ok(rendered.into_bytes())
    }
}

/// Flatten tera's error chain; the innermost cause names the missing field
fn template_error(name: &str, err: &tera::Error) -> RenderError {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    RenderError::Template {
        template: name.to_string(),
        message,
    }
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), RenderError> {
    let entries = std::fs::read_dir(dir).map_err(|e| RenderError::io(dir, &e))?;
    for entry in entries {
        let path = entry.map_err(|e| RenderError::io(dir, &e))?.path();
        if path.is_dir() {
            walk(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer() -> TemplateRenderer {
        let mut renderer = TemplateRenderer::new();
        renderer
            .add_raw(
                "traefik.yml.j2",
                "entryPoints:\n  web:\n    address: \":{{ port }}\"\ndomain: {{ domain }}\n",
            )
            .unwrap();
        renderer
    }

    #[test]
    fn test_render_is_deterministic() {
        let renderer = renderer();
        let record = json!({ "port": 80, "domain": "example.org" });

        let first = renderer.render("traefik.yml.j2", &record).unwrap();
        let second = renderer.render("traefik.yml.j2", &record).unwrap();

        assert_eq!(first, second);
        assert!(String::from_utf8(first).unwrap().contains("domain: example.org"));
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let renderer = renderer();
        let err = renderer
            .render("traefik.yml.j2", &json!({ "port": 80 }))
            .unwrap_err();

        match err {
            RenderError::Template { template, message } => {
                assert_eq!(template, "traefik.yml.j2");
                assert!(message.contains("domain"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_template() {
        let err = renderer().render("nope.j2", &json!({})).unwrap_err();
        assert!(matches!(err, RenderError::TemplateNotFound(_)));
    }

    #[test]
    fn test_non_object_record() {
        let err = renderer().render("traefik.yml.j2", &json!([1, 2])).unwrap_err();
        assert!(matches!(err, RenderError::InvalidInput(_)));
    }

    #[test]
    fn test_from_dir_uses_relative_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vault")).unwrap();
        std::fs::write(dir.path().join("vault/config.hcl.j2"), "ui = {{ ui }}\n").unwrap();

        let renderer = TemplateRenderer::from_dir(dir.path()).unwrap();

        assert_eq!(renderer.template_names(), vec!["vault/config.hcl.j2"]);
        let out = renderer
            .render("vault/config.hcl.j2", &json!({ "ui": true }))
            .unwrap();
        assert_eq!(out, b"ui = true\n");
    }
}
