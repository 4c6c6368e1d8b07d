use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use super::types::Settings;

/// Load settings from a YAML file.
///
/// A missing file yields the defaults rooted at `working_dir`; fields absent
/// from the file keep their defaults as well.
pub fn load_settings(path: &Path, working_dir: &str) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No settings file, using defaults");
        return Ok(Settings::with_working_dir(working_dir));
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    let settings = parse_settings(&content, working_dir)
        .with_context(|| format!("Invalid settings file: {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        runners = settings.runners.len(),
        "Loaded settings"
    );
    Ok(settings)
}

/// Parse settings text, filling storage paths from `working_dir` when unset.
pub fn parse_settings(content: &str, working_dir: &str) -> Result<Settings> {
    let base = Settings::with_working_dir(working_dir);
    if content.trim().is_empty() {
        return Ok(base);
    }

    let value: serde_yaml::Value =
        serde_yaml::from_str(content).context("Failed to parse YAML")?;
    let mut settings: Settings = serde_yaml::from_value(value.clone())?;

    if value.get("database_path").is_none() {
        settings.database_path = base.database_path;
    }
    if value.get("artifact_dir").is_none() {
        settings.artifact_dir = base.artifact_dir;
    }

    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<()> {
    let mut seen = HashSet::new();
    for runner in &settings.runners {
        if runner.id.is_empty() {
            bail!("runner entries need a non-empty id");
        }
        if !seen.insert(runner.id.as_str()) {
            bail!("runner '{}' is registered twice", runner.id);
        }
    }
    if let Some(default) = &settings.default_runner {
        if !seen.contains(default.as_str()) {
            bail!("default_runner '{}' is not among the registered runners", default);
        }
    }
    if settings.parse_poll_interval_ms == 0 {
        bail!("parse_poll_interval_ms must be greater than zero");
    }
    Ok(())
}
