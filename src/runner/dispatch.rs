use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use super::registry::RunnerRegistry;
use crate::error::{CoreError, CoreResult};

/// Remote control of runner containers.
#[async_trait]
pub trait RunnerControl: Send + Sync {
    /// Ask a runner to stop a task's containers. Stopping an already
    /// stopped container is not an error on the runner side.
    async fn stop_task(
        &self,
        runner_id: &str,
        task_id: &str,
        container_ids: &[String],
    ) -> CoreResult<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    task_id: &'a str,
    container_ids: &'a [String],
}

/// HTTP client for the runner API.
pub struct DispatchClient {
    http: reqwest::Client,
    registry: Arc<dyn RunnerRegistry>,
}

impl DispatchClient {
    pub fn new(registry: Arc<dyn RunnerRegistry>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("Failed to build runner HTTP client")?;
        Ok(Self { http, registry })
    }
}

#[async_trait]
impl RunnerControl for DispatchClient {
    async fn stop_task(
        &self,
        runner_id: &str,
        task_id: &str,
        container_ids: &[String],
    ) -> CoreResult<()> {
        let address = self.registry.address_of(runner_id).await?;
        let url = format!("{}/task/stop", address);
        let unreachable = |reason: String| CoreError::RunnerUnreachable {
            runner: runner_id.to_string(),
            reason,
        };

        tracing::debug!(runner = runner_id, task = task_id, url = %url, "Stopping task containers");
        let resp = self
            .http
            .post(&url)
            .json(&StopRequest {
                task_id,
                container_ids,
            })
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(unreachable(format!("HTTP {}: {}", status, body.trim())));
        }
        Ok(())
    }
}
