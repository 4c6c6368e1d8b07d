use async_trait::async_trait;

use crate::config::types::{RunnerEntry, Settings};
use crate::error::{CoreError, CoreResult};

/// Resolves runner identities and their network addresses.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// Runner that new tasks are assigned to.
    async fn default_runner(&self) -> CoreResult<String>;

    /// Base URL of a registered runner.
    async fn address_of(&self, runner_id: &str) -> CoreResult<String>;
}

/// Registry backed by the runner list in the settings file.
#[derive(Debug, Clone, Default)]
pub struct StaticRunnerRegistry {
    runners: Vec<RunnerEntry>,
    default_runner: Option<String>,
}

impl StaticRunnerRegistry {
    pub fn new(runners: Vec<RunnerEntry>, default_runner: Option<String>) -> Self {
        Self {
            runners,
            default_runner,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.runners.clone(), settings.default_runner.clone())
    }

    pub fn runners(&self) -> &[RunnerEntry] {
        &self.runners
    }
}

#[async_trait]
impl RunnerRegistry for StaticRunnerRegistry {
    async fn default_runner(&self) -> CoreResult<String> {
        if let Some(id) = &self.default_runner {
            if self.runners.iter().any(|r| &r.id == id) {
                return Ok(id.clone());
            }
            return Err(CoreError::NoRunnerAvailable(format!(
                "default runner '{}' is not registered",
                id
            )));
        }
        self.runners
            .first()
            .map(|r| r.id.clone())
            .ok_or_else(|| CoreError::NoRunnerAvailable("no runners registered".into()))
    }

    async fn address_of(&self, runner_id: &str) -> CoreResult<String> {
        self.runners
            .iter()
            .find(|r| r.id == runner_id)
            .map(|r| r.address.trim_end_matches('/').to_string())
            .ok_or_else(|| CoreError::RunnerNotRegistered(runner_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> RunnerEntry {
        RunnerEntry {
            id: id.to_string(),
            address: format!("http://{}.local:19030/api/v1/", id),
        }
    }

    #[tokio::test]
    async fn test_default_falls_back_to_first() {
        let registry = StaticRunnerRegistry::new(vec![entry("r1"), entry("r2")], None);
        assert_eq!(registry.default_runner().await.unwrap(), "r1");

        let registry = StaticRunnerRegistry::new(vec![entry("r1"), entry("r2")], Some("r2".into()));
        assert_eq!(registry.default_runner().await.unwrap(), "r2");
    }

    #[tokio::test]
    async fn test_empty_registry_has_no_runner() {
        let err = StaticRunnerRegistry::default()
            .default_runner()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_runner_available");
    }

    #[tokio::test]
    async fn test_address_lookup() {
        let registry = StaticRunnerRegistry::new(vec![entry("r1")], None);
        assert_eq!(
            registry.address_of("r1").await.unwrap(),
            "http://r1.local:19030/api/v1"
        );
        let err = registry.address_of("r9").await.unwrap_err();
        assert!(matches!(err, CoreError::RunnerNotRegistered(id) if id == "r9"));
    }
}
