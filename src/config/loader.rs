//! Configuration persistence.
//!
//! The gateway persists two things under its config directory: the gateway
//! config itself (`gateway.json`) and one JSON file per template under
//! `templates/`. Writes are atomic (temp file + rename) so a crash never
//! leaves a half-written file behind. Environment variables override the
//! file on load: `TOOLGATE_HOST`, `TOOLGATE_PORT`, `TOOLGATE_AUTH_MODE`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::schema::{AuthMode, GatewayConfig, ServiceTemplate};
use crate::error::{GatewayError, Result};

/// Well-known locations inside the config directory.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    root: PathBuf,
}

impl ConfigPaths {
    /// Anchors the layout at a config directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The gateway config file.
    #[must_use]
    pub fn gateway_file(&self) -> PathBuf {
        self.root.join("gateway.json")
    }

    /// The per-template directory.
    #[must_use]
    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    /// One template's file.
    #[must_use]
    pub fn template_file(&self, name: &str) -> PathBuf {
        self.templates_dir().join(format!("{name}.json"))
    }
}

/// Writes `bytes` to `path` atomically via a sibling temp file + rename.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads the gateway config; a missing file yields the defaults. Env
/// overrides are applied either way.
///
/// # Errors
///
/// `Validation` for unparseable or invalid files.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig> {
    let mut config = if path.exists() {
        let bytes = fs::read(path)?;
        serde_json::from_slice::<GatewayConfig>(&bytes).map_err(|e| {
            GatewayError::Validation(format!("{} is not a valid gateway config: {e}", path.display()))
        })?
    } else {
        info!(path = %path.display(), "no gateway config file, using defaults");
        GatewayConfig::default()
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Persists the gateway config atomically.
///
/// # Errors
///
/// `Validation` when the config is invalid; I/O errors propagate.
pub fn save_gateway_config(path: &Path, config: &GatewayConfig) -> Result<()> {
    config.validate()?;
    let bytes = serde_json::to_vec_pretty(config)?;
    atomic_write(path, &bytes)
}

/// Environment overrides consumed by the core.
fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(host) = std::env::var("TOOLGATE_HOST") {
        if !host.is_empty() {
            config.host = host;
        }
    }
    if let Ok(port) = std::env::var("TOOLGATE_PORT") {
        match port.parse() {
            Ok(port) => config.port = port,
            Err(_) => warn!(value = %port, "ignoring unparseable TOOLGATE_PORT"),
        }
    }
    if let Ok(mode) = std::env::var("TOOLGATE_AUTH_MODE") {
        match mode.as_str() {
            "disabled" => config.auth.mode = AuthMode::Disabled,
            "token" => config.auth.mode = AuthMode::Token,
            other => warn!(value = other, "ignoring unknown TOOLGATE_AUTH_MODE"),
        }
    }
}

/// Loads every template under `dir`, skipping (and logging) invalid files.
#[must_use]
pub fn load_templates(dir: &Path) -> Vec<ServiceTemplate> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut templates = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match fs::read(&path)
            .map_err(GatewayError::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<ServiceTemplate>(&bytes)?))
            .and_then(|template| template.validate().map(|()| template))
        {
            Ok(template) => templates.push(template),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid template file"),
        }
    }
    templates.sort_by(|a, b| a.name.cmp(&b.name));
    templates
}

/// Persists one template atomically.
///
/// # Errors
///
/// I/O and serialization errors propagate.
pub fn save_template(dir: &Path, template: &ServiceTemplate) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(template)?;
    atomic_write(&dir.join(format!("{}.json", template.name)), &bytes)
}

/// Deletes one template file; `false` when it did not exist.
pub fn delete_template(dir: &Path, name: &str) -> bool {
    fs::remove_file(dir.join(format!("{name}.json"))).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(name: &str) -> ServiceTemplate {
        serde_json::from_value(json!({
            "name": name,
            "transport": "stdio",
            "command": "/bin/cat",
        }))
        .unwrap()
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_gateway_config(&dir.path().join("gateway.json")).unwrap();
        assert_eq!(config, {
            let mut c = GatewayConfig::default();
            apply_env_overrides(&mut c);
            c
        });
    }

    #[test]
    fn config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let mut config = GatewayConfig::default();
        config.port = 9191;
        save_gateway_config(&path, &config).unwrap();

        let loaded = load_gateway_config(&path).unwrap();
        assert_eq!(loaded.port, 9191);
        // No stray temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_config_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        fs::write(&path, b"{not json").unwrap();
        let err = load_gateway_config(&path).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn templates_round_trip_and_skip_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let templates_dir = dir.path().join("templates");
        save_template(&templates_dir, &template("beta")).unwrap();
        save_template(&templates_dir, &template("alpha")).unwrap();
        fs::write(templates_dir.join("broken.json"), b"]").unwrap();
        fs::write(templates_dir.join("notes.txt"), b"ignored").unwrap();

        let loaded = load_templates(&templates_dir);
        let names: Vec<_> = loaded.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta"]);
    }

    #[test]
    fn delete_template_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let templates_dir = dir.path().join("templates");
        save_template(&templates_dir, &template("gone")).unwrap();
        assert!(delete_template(&templates_dir, "gone"));
        assert!(!delete_template(&templates_dir, "gone"));
    }

    #[test]
    fn load_templates_from_missing_dir_is_empty() {
        assert!(load_templates(Path::new("/definitely/missing/dir")).is_empty());
    }
}
