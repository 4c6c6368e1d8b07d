pub mod fs;

use anyhow::Result;
use async_trait::async_trait;

use crate::state::models::Task;

pub use fs::FsArtifactStore;

/// Read-only view of the log store runners write task artifacts into.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Raw bytes stored under a logical path, or `None` if nothing was written.
    async fn read(&self, logical_path: &str) -> Result<Option<Vec<u8>>>;
}

/// Logical paths of the artifacts a runner leaves behind for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPaths {
    base: String,
}

impl TaskPaths {
    pub fn for_task(task: &Task) -> Self {
        let scope = task.env_id.as_deref().unwrap_or("_template");
        Self {
            base: format!("{}/{}/{}", task.template_id, scope, task.id),
        }
    }

    pub fn state_json(&self) -> String {
        format!("{}/state.json", self.base)
    }

    pub fn plan_json(&self) -> String {
        format!("{}/plan.json", self.base)
    }

    pub fn provider_schema_json(&self) -> String {
        format!("{}/provider_schema.json", self.base)
    }

    /// Parsed infrastructure document produced by scan and parse tasks.
    pub fn tfparse_json(&self) -> String {
        format!("{}/tfparse.json", self.base)
    }

    /// Text output of the plan step, used for drift detection.
    pub fn plan_output_log(&self) -> String {
        format!("{}/plan/plan_output.log", self.base)
    }

    /// Look up an artifact path by its short name.
    pub fn by_name(&self, name: &str) -> Option<String> {
        match name {
            "state" => Some(self.state_json()),
            "plan" => Some(self.plan_json()),
            "provider-schema" => Some(self.provider_schema_json()),
            "tfparse" => Some(self.tfparse_json()),
            "plan-log" => Some(self.plan_output_log()),
            _ => None,
        }
    }
}

/// Short names accepted by [`TaskPaths::by_name`].
pub const ARTIFACT_NAMES: &[&str] = &["state", "plan", "provider-schema", "tfparse", "plan-log"];
