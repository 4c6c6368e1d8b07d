use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    AutoDestroyUpdate, EnvStatus, Environment, Policy, PolicyGroup, PolicyResult,
    PolicyResultRow, PolicyStatus, ResourceDrift, ScanTask, Scope, StartOutcome, Target, Task,
    TaskChange, TaskInsert, TaskKind, TaskOutput, TaskResource, TaskStatus, Template,
};

/// Persistence seam for the task lifecycle.
///
/// Every method that writes more than one row does so inside a single
/// transaction; a failure leaves no partial state behind.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // ─── Initialization ─────────────────────────────────────────────────────

    /// Create tables and run migrations.
    async fn initialize(&self) -> Result<()>;

    // ─── Templates & Environments ───────────────────────────────────────────

    async fn insert_template(&self, template: &Template) -> Result<()>;

    async fn get_template(&self, id: &str) -> Result<Option<Template>>;

    async fn insert_environment(&self, env: &Environment) -> Result<()>;

    async fn get_environment(&self, id: &str) -> Result<Option<Environment>>;

    /// Set an environment's status, optionally recording the task whose
    /// resources now describe it.
    async fn set_environment_status(
        &self,
        env_id: &str,
        status: EnvStatus,
        res_task_id: Option<&str>,
    ) -> Result<()>;

    /// Write the auto-destroy columns named by `update`.
    async fn update_auto_destroy(&self, env_id: &str, update: &AutoDestroyUpdate) -> Result<()>;

    /// Environments whose deadline has passed and that have no destroy task yet.
    async fn due_auto_destroys(&self, now: DateTime<Utc>) -> Result<Vec<Environment>>;

    // ─── Tasks ──────────────────────────────────────────────────────────────

    /// Insert an execution task unless another active task holds its target.
    /// On success the environment's `last_task_id` points at the new task.
    async fn create_task(&self, task: &Task) -> Result<TaskInsert<Task>>;

    /// Insert a scan task unless another active scan holds its target.
    /// Parse-only tasks skip the exclusivity check and pointer update.
    async fn create_scan_task(&self, scan: &ScanTask) -> Result<TaskInsert<ScanTask>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn get_scan_task(&self, id: &str) -> Result<Option<ScanTask>>;

    /// The oldest non-terminal, non-parse task holding `target` in the given table.
    async fn active_task(&self, kind: TaskKind, target: &Target) -> Result<Option<Task>>;

    /// Move a pending task to running on `container_id`.
    async fn start_task(
        &self,
        kind: TaskKind,
        task_id: &str,
        container_id: &str,
        at: DateTime<Utc>,
    ) -> Result<StartOutcome>;

    /// Record a terminal status. Returns false if the task was already terminal.
    async fn finish_task(
        &self,
        kind: TaskKind,
        task_id: &str,
        status: TaskStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    // ─── Ingested Results ───────────────────────────────────────────────────

    /// Replace the resources and outputs recorded for a task.
    async fn replace_task_state(
        &self,
        task_id: &str,
        resources: &[TaskResource],
        outputs: &[TaskOutput],
    ) -> Result<()>;

    async fn list_task_resources(&self, task_id: &str) -> Result<Vec<TaskResource>>;

    async fn list_task_outputs(&self, task_id: &str) -> Result<Vec<TaskOutput>>;

    /// Replace the planned changes recorded for a task.
    async fn replace_task_changes(&self, task_id: &str, changes: &[TaskChange]) -> Result<()>;

    async fn list_task_changes(&self, task_id: &str) -> Result<Vec<TaskChange>>;

    // ─── Drift ──────────────────────────────────────────────────────────────

    async fn find_resource_id(&self, task_id: &str, address: &str) -> Result<Option<String>>;

    async fn list_drift(&self, res_task_id: &str) -> Result<Vec<ResourceDrift>>;

    /// Delete the named drift rows and upsert the given ones.
    async fn apply_drift(
        &self,
        res_task_id: &str,
        remove: &[String],
        upsert: &[ResourceDrift],
    ) -> Result<()>;

    // ─── Policies ───────────────────────────────────────────────────────────

    async fn insert_policy_group(&self, group: &PolicyGroup) -> Result<()>;

    async fn insert_policy(&self, policy: &Policy) -> Result<()>;

    async fn bind_policy_group(&self, scope: Scope, target_id: &str, group_id: &str)
        -> Result<()>;

    async fn suppress_policy(&self, policy_id: &str, target_id: &str, reason: &str)
        -> Result<()>;

    /// Policies bound to the template or to the environment, ordered by group then name.
    async fn policies_for_scan(
        &self,
        template_id: &str,
        env_id: Option<&str>,
    ) -> Result<Vec<Policy>>;

    async fn suppressed_policy_ids(&self, target_id: &str) -> Result<HashSet<String>>;

    /// Every muted `(policy_id, target_id)` pair.
    async fn all_suppressions(&self) -> Result<HashSet<(String, String)>>;

    // ─── Policy Results ─────────────────────────────────────────────────────

    /// Replace a scan's results and record its aggregate status.
    async fn store_scan_results(
        &self,
        scan_task_id: &str,
        results: &[PolicyResult],
        status: PolicyStatus,
    ) -> Result<()>;

    /// Delete a scan's results and record its aggregate status.
    async fn clear_scan_results(&self, scan_task_id: &str, status: PolicyStatus) -> Result<()>;

    async fn list_policy_results(&self, scan_task_id: &str) -> Result<Vec<PolicyResultRow>>;

    /// Results created in `[from, to)`, optionally for a single policy.
    async fn policy_results_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        policy_id: Option<&str>,
    ) -> Result<Vec<PolicyResultRow>>;
}
