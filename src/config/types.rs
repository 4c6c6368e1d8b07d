use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─── Settings ───────────────────────────────────────────────────────────────

/// Global settings controlling dispatch, ingestion and storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: String,
    pub artifact_dir: String,
    pub runners: Vec<RunnerEntry>,
    /// Runner used for new tasks. Falls back to the first registered runner.
    pub default_runner: Option<String>,
    pub runner_timeout_secs: u64,
    pub parse_poll_interval_ms: u64,
    pub parse_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub opa_binary: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: ".iacflow/state.db".to_string(),
            artifact_dir: ".iacflow/logs".to_string(),
            runners: Vec::new(),
            default_runner: None,
            runner_timeout_secs: 30,
            parse_poll_interval_ms: 1000,
            parse_timeout_secs: 30,
            step_timeout_secs: 3600,
            opa_binary: "opa".to_string(),
        }
    }
}

impl Settings {
    /// Defaults rooted at a working directory instead of `.iacflow`.
    pub fn with_working_dir(working_dir: &str) -> Self {
        Self {
            database_path: format!("{}/state.db", working_dir),
            artifact_dir: format!("{}/logs", working_dir),
            ..Self::default()
        }
    }

    pub fn runner_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_timeout_secs)
    }

    pub fn parse_poll_interval(&self) -> Duration {
        Duration::from_millis(self.parse_poll_interval_ms)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_secs(self.parse_timeout_secs)
    }
}

/// A runner known to this deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEntry {
    pub id: String,
    /// Base URL, e.g. `http://10.0.0.5:19030/api/v1`.
    pub address: String,
}
