use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;

use super::manager::TaskManager;
use super::scheduler;
use crate::artifact::TaskPaths;
use crate::drift;
use crate::error::{CoreError, CoreResult};
use crate::notify::Event;
use crate::parser;
use crate::policy::{classify, scan_status};
use crate::state::models::*;

/// How one ingestion step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Rows were written.
    Done,
    /// The artifact was not written by the runner.
    Absent,
    /// The step does not apply to this task.
    Skipped,
    Failed(String),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Done => f.write_str("done"),
            StepOutcome::Absent => f.write_str("absent"),
            StepOutcome::Skipped => f.write_str("skipped"),
            StepOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-step outcomes of an ingestion run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub steps: Vec<(&'static str, StepOutcome)>,
}

impl IngestReport {
    fn record(&mut self, task: &Task, step: &'static str, result: CoreResult<StepOutcome>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(task = %task.id, step, error = %e, "Ingestion step failed");
                StepOutcome::Failed(e.to_string())
            }
        };
        self.steps.push((step, outcome));
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    pub fn has_failures(&self) -> bool {
        self.steps
            .iter()
            .any(|(_, o)| matches!(o, StepOutcome::Failed(_)))
    }
}

pub const STEP_STATE: &str = "state";
pub const STEP_PLAN: &str = "plan";
pub const STEP_DRIFT: &str = "drift";
pub const STEP_ENVIRONMENT: &str = "environment";
pub const STEP_AUTO_DESTROY: &str = "auto_destroy";
pub const STEP_POLICY: &str = "policy";

impl TaskManager {
    // ─── Execution Tasks ────────────────────────────────────────────────────

    /// Ingest a completed execution task. Each step is isolated.
    ///
    /// With `transition` unset only the artifact steps run; the environment
    /// status and auto-destroy columns are left alone.
    pub(super) async fn ingest_execution(&self, task: &Task, transition: bool) -> IngestReport {
        let paths = TaskPaths::for_task(task);
        let mut report = IngestReport::default();

        let result = self.ingest_state(task, &paths).await;
        report.record(task, STEP_STATE, result);

        let result = self.ingest_plan(task, &paths).await;
        report.record(task, STEP_PLAN, result);

        let result = self.ingest_drift(task, &paths).await;
        report.record(task, STEP_DRIFT, result);

        if !transition {
            report.steps.push((STEP_ENVIRONMENT, StepOutcome::Skipped));
            report.steps.push((STEP_AUTO_DESTROY, StepOutcome::Skipped));
            return report;
        }

        let result = self.transition_environment(task).await;
        report.record(task, STEP_ENVIRONMENT, result);

        let result = self.schedule_auto_destroy(task).await;
        report.record(task, STEP_AUTO_DESTROY, result);

        report
    }

    async fn ingest_state(&self, task: &Task, paths: &TaskPaths) -> CoreResult<StepOutcome> {
        let Some(bytes) = self.artifacts.read(&paths.state_json()).await? else {
            return Ok(StepOutcome::Absent);
        };
        let Some(doc) = parser::parse_state(&bytes)? else {
            return Ok(StepOutcome::Absent);
        };

        let sensitive = match self.artifacts.read(&paths.provider_schema_json()).await? {
            Some(bytes) => parser::parse_sensitive_attrs(&bytes)?,
            None => parser::SensitiveAttrMap::new(),
        };

        let resources = parser::resources_of(&task.id, &doc, &sensitive);
        let outputs = parser::outputs_of(&task.id, &doc);
        self.state
            .replace_task_state(&task.id, &resources, &outputs)
            .await?;
        tracing::debug!(
            task = %task.id,
            resources = resources.len(),
            outputs = outputs.len(),
            "Stored task state"
        );
        Ok(StepOutcome::Done)
    }

    async fn ingest_plan(&self, task: &Task, paths: &TaskPaths) -> CoreResult<StepOutcome> {
        let Some(bytes) = self.artifacts.read(&paths.plan_json()).await? else {
            return Ok(StepOutcome::Absent);
        };
        let Some(doc) = parser::parse_plan(&bytes)? else {
            return Ok(StepOutcome::Absent);
        };

        let changes = parser::changes_of(&task.id, &doc);
        self.state.replace_task_changes(&task.id, &changes).await?;
        tracing::debug!(task = %task.id, changes = changes.len(), "Stored plan changes");
        Ok(StepOutcome::Done)
    }

    async fn ingest_drift(&self, task: &Task, paths: &TaskPaths) -> CoreResult<StepOutcome> {
        let (TaskType::Plan, Some(env_id)) = (task.task_type, task.env_id.as_deref()) else {
            return Ok(StepOutcome::Skipped);
        };
        let Some(log) = self.artifacts.read(&paths.plan_output_log()).await? else {
            return Ok(StepOutcome::Absent);
        };
        let env = self
            .state
            .get_environment(env_id)
            .await?
            .ok_or_else(|| CoreError::not_found("environment", env_id))?;
        let Some(res_task_id) = env.last_res_task_id.as_deref() else {
            tracing::debug!(env = env_id, "Environment has no applied resources, drift ignored");
            return Ok(StepOutcome::Skipped);
        };

        let detected = drift::parse_drift_log(&log);
        let previous: BTreeSet<String> = self
            .state
            .list_drift(res_task_id)
            .await?
            .into_iter()
            .map(|d| d.address)
            .collect();
        let plan = drift::reconcile(&previous, &detected);

        let now = Utc::now();
        let mut rows = Vec::with_capacity(plan.upsert.len());
        for address in &plan.upsert {
            let resource_id = match self.state.find_resource_id(res_task_id, address).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    tracing::warn!(env = env_id, address = %address, "Drifted resource not found, skipped");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(env = env_id, address = %address, error = %e, "Resource lookup failed, skipped");
                    continue;
                }
            };
            let attrs = detected.get(address).cloned().unwrap_or_default();
            rows.push(ResourceDrift {
                res_task_id: res_task_id.to_string(),
                address: address.clone(),
                resource_id,
                drift_json: serde_json::to_string(&attrs)
                    .map_err(|e| CoreError::Storage(e.into()))?,
                detected_at: now,
            });
        }

        self.state
            .apply_drift(res_task_id, &plan.remove, &rows)
            .await?;
        tracing::info!(
            env = env_id,
            drifted = rows.len(),
            resolved = plan.remove.len(),
            "Drift detection recorded"
        );

        if !detected.is_empty() {
            self.notifier.notify(Event::Drift, task).await;
        }
        Ok(StepOutcome::Done)
    }

    async fn transition_environment(&self, task: &Task) -> CoreResult<StepOutcome> {
        let status = match task.task_type {
            TaskType::Apply => EnvStatus::Active,
            TaskType::Destroy => EnvStatus::Inactive,
            _ => return Ok(StepOutcome::Skipped),
        };
        let Some(env_id) = task.env_id.as_deref() else {
            return Ok(StepOutcome::Skipped);
        };
        self.state
            .set_environment_status(env_id, status, Some(&task.id))
            .await?;
        tracing::info!(env = env_id, status = %status, "Environment status updated");
        Ok(StepOutcome::Done)
    }

    async fn schedule_auto_destroy(&self, task: &Task) -> CoreResult<StepOutcome> {
        if !matches!(task.task_type, TaskType::Apply | TaskType::Destroy) {
            return Ok(StepOutcome::Skipped);
        }
        let Some(env_id) = task.env_id.as_deref() else {
            return Ok(StepOutcome::Skipped);
        };
        let env = self
            .state
            .get_environment(env_id)
            .await?
            .ok_or_else(|| CoreError::not_found("environment", env_id))?;

        let update = scheduler::auto_destroy_update(task, &env, Utc::now()).map_err(|e| {
            CoreError::InvalidRequest(format!("environment {} has bad ttl: {:#}", env.id, e))
        })?;
        let Some(update) = update else {
            return Ok(StepOutcome::Skipped);
        };
        self.state.update_auto_destroy(env_id, &update).await?;
        tracing::info!(env = env_id, update = ?update, "Auto-destroy updated");
        Ok(StepOutcome::Done)
    }

    // ─── Scan Tasks ─────────────────────────────────────────────────────────

    /// Evaluate a finished scan's policies and store the results.
    ///
    /// Parse-only tasks carry no policy results.
    pub(super) async fn ingest_scan(&self, scan: &ScanTask) -> IngestReport {
        let mut report = IngestReport::default();
        if scan.task.task_type.is_parse() {
            report.steps.push((STEP_POLICY, StepOutcome::Skipped));
            return report;
        }
        let result = self.evaluate_scan(scan).await;
        let result = match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // A scan that could not be evaluated is recorded as failed.
                if let Err(clear) = self
                    .state
                    .clear_scan_results(scan.id(), PolicyStatus::Failed)
                    .await
                {
                    tracing::error!(task = %scan.id(), error = %clear, "Failed to mark scan as failed");
                }
                Err(e)
            }
        };
        report.record(&scan.task, STEP_POLICY, result);
        report
    }

    async fn evaluate_scan(&self, scan: &ScanTask) -> CoreResult<StepOutcome> {
        let task = &scan.task;
        if task.status != TaskStatus::Complete {
            self.state
                .clear_scan_results(scan.id(), PolicyStatus::Failed)
                .await?;
            return Ok(StepOutcome::Done);
        }

        let path = TaskPaths::for_task(task).tfparse_json();
        let Some(bytes) = self.artifacts.read(&path).await? else {
            tracing::warn!(task = %task.id, "Scan finished without a parse artifact");
            self.state
                .clear_scan_results(scan.id(), PolicyStatus::Failed)
                .await?;
            return Ok(StepOutcome::Absent);
        };
        let input: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::MalformedArtifact {
                artifact: "tfparse",
                reason: e.to_string(),
            })?;

        let policies = self
            .state
            .policies_for_scan(&task.template_id, task.env_id.as_deref())
            .await?;
        let now = Utc::now();
        let mut results = Vec::with_capacity(policies.len());
        for policy in &policies {
            let outcome = classify(self.evaluator.evaluate(&policy.rule, &input).await);
            tracing::debug!(
                task = %task.id,
                policy = %policy.name,
                status = %outcome.status,
                "Policy evaluated"
            );
            results.push(PolicyResult {
                id: uuid::Uuid::new_v4().to_string(),
                scan_task_id: task.id.clone(),
                policy_id: policy.id.clone(),
                policy_group_id: policy.group_id.clone(),
                status: outcome.status,
                message: outcome.message,
                severity: policy.severity.clone(),
                created_at: now,
            });
        }

        let status = scan_status(results.iter().map(|r| &r.status));
        self.state
            .store_scan_results(scan.id(), &results, status)
            .await?;
        tracing::info!(
            task = %task.id,
            policies = results.len(),
            status = %status,
            "Scan results stored"
        );
        Ok(StepOutcome::Done)
    }
}
