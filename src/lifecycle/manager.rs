use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::ingest::IngestReport;
use super::wait;
use crate::artifact::{ArtifactStore, TaskPaths};
use crate::config::types::Settings;
use crate::error::{CoreError, CoreResult};
use crate::notify::{Event, Notifier};
use crate::policy::RuleEvaluator;
use crate::runner::{RunnerControl, RunnerRegistry};
use crate::state::models::*;
use crate::state::StateBackend;

/// Caller-supplied knobs for a new execution task.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Pin the task to a runner instead of the registry default.
    pub runner_id: Option<String>,
    pub step_timeout_secs: Option<u64>,
}

/// Either kind of task, as located by id.
#[derive(Debug, Clone)]
pub enum AnyTask {
    Execution(Task),
    Scan(ScanTask),
}

impl AnyTask {
    pub fn task(&self) -> &Task {
        match self {
            AnyTask::Execution(task) => task,
            AnyTask::Scan(scan) => &scan.task,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            AnyTask::Execution(_) => TaskKind::Execution,
            AnyTask::Scan(_) => TaskKind::Scan,
        }
    }
}

/// Result of finalizing a task.
#[derive(Debug)]
pub struct Finalized {
    pub task: AnyTask,
    pub report: IngestReport,
}

/// Scan task type for a target: environment or template, full scan or parse only.
pub fn resolve_scan_type(has_env: bool, parse_only: bool) -> TaskType {
    match (has_env, parse_only) {
        (true, false) => TaskType::EnvScan,
        (true, true) => TaskType::EnvParse,
        (false, false) => TaskType::TplScan,
        (false, true) => TaskType::TplParse,
    }
}

/// Owns the create → dispatch → finalize state machine for execution and scan tasks.
pub struct TaskManager {
    pub(super) state: Arc<dyn StateBackend>,
    pub(super) runners: Arc<dyn RunnerRegistry>,
    pub(super) control: Arc<dyn RunnerControl>,
    pub(super) artifacts: Arc<dyn ArtifactStore>,
    pub(super) evaluator: Arc<dyn RuleEvaluator>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) settings: Settings,
}

impl TaskManager {
    pub fn new(
        state: Arc<dyn StateBackend>,
        runners: Arc<dyn RunnerRegistry>,
        control: Arc<dyn RunnerControl>,
        artifacts: Arc<dyn ArtifactStore>,
        evaluator: Arc<dyn RuleEvaluator>,
        notifier: Arc<dyn Notifier>,
        settings: Settings,
    ) -> Self {
        Self {
            state,
            runners,
            control,
            artifacts,
            evaluator,
            notifier,
            settings,
        }
    }

    pub fn state(&self) -> &Arc<dyn StateBackend> {
        &self.state
    }

    // ─── Lookups ────────────────────────────────────────────────────────────

    async fn template(&self, id: &str) -> CoreResult<Template> {
        self.state
            .get_template(id)
            .await?
            .ok_or_else(|| CoreError::not_found("template", id))
    }

    async fn environment_of(
        &self,
        template: &Template,
        env_id: Option<&str>,
    ) -> CoreResult<Option<Environment>> {
        let Some(env_id) = env_id else {
            return Ok(None);
        };
        let env = self
            .state
            .get_environment(env_id)
            .await?
            .ok_or_else(|| CoreError::not_found("environment", env_id))?;
        if env.template_id != template.id {
            return Err(CoreError::InvalidRequest(format!(
                "environment {} does not belong to template {}",
                env.id, template.id
            )));
        }
        Ok(Some(env))
    }

    /// Find a task by id in either table.
    pub async fn locate(&self, task_id: &str) -> CoreResult<AnyTask> {
        if let Some(task) = self.state.get_task(task_id).await? {
            return Ok(AnyTask::Execution(task));
        }
        if let Some(scan) = self.state.get_scan_task(task_id).await? {
            return Ok(AnyTask::Scan(scan));
        }
        Err(CoreError::not_found("task", task_id))
    }

    async fn resolve_runner(&self, pinned: Option<&str>) -> CoreResult<String> {
        match pinned {
            Some(id) => {
                self.runners.address_of(id).await?;
                Ok(id.to_string())
            }
            None => self.runners.default_runner().await,
        }
    }

    fn step_timeout(&self, opts: &ExecutionOptions) -> i64 {
        let secs = opts.step_timeout_secs.unwrap_or(self.settings.step_timeout_secs);
        i64::try_from(secs).unwrap_or(i64::MAX)
    }

    // ─── Creation ───────────────────────────────────────────────────────────

    /// Create a pending plan/apply/destroy task.
    pub async fn request_execution(
        &self,
        template_id: &str,
        env_id: Option<&str>,
        task_type: TaskType,
        opts: &ExecutionOptions,
    ) -> CoreResult<Task> {
        if task_type.is_scan() {
            return Err(CoreError::InvalidRequest(format!(
                "'{}' is a scan task type",
                task_type
            )));
        }
        let template = self.template(template_id).await?;
        let env = self.environment_of(&template, env_id).await?;

        if template.status == TemplateStatus::Disabled {
            return Err(CoreError::ineligible(
                format!("template {}", template.id),
                "template is disabled",
            ));
        }
        match &env {
            None if task_type != TaskType::Plan => {
                return Err(CoreError::ineligible(
                    format!("template {}", template.id),
                    format!("{} requires an environment", task_type),
                ));
            }
            Some(env) if env.status == EnvStatus::Archived => {
                return Err(CoreError::ineligible(
                    format!("environment {}", env.id),
                    "environment is archived",
                ));
            }
            Some(env) => {
                let target = Target::Environment(env.id.clone());
                if let Some(active) = self.state.active_task(TaskKind::Execution, &target).await? {
                    if active.task_type == TaskType::Destroy {
                        return Err(CoreError::ineligible(
                            format!("environment {}", env.id),
                            format!("destroy task {} is in progress", active.id),
                        ));
                    }
                }
            }
            None => {}
        }

        let runner_id = self.resolve_runner(opts.runner_id.as_deref()).await?;
        let task = Task::new(
            &template,
            env.as_ref(),
            task_type,
            &runner_id,
            self.step_timeout(opts),
        );

        match self.state.create_task(&task).await? {
            TaskInsert::Created(task) => {
                tracing::info!(
                    task = %task.id,
                    task_type = %task.task_type,
                    target = %task.target(),
                    runner = %task.runner_id,
                    "Created task"
                );
                Ok(task)
            }
            TaskInsert::Conflict { active_task_id } => Err(CoreError::Conflict(format!(
                "{} already has active task {}",
                task.target(),
                active_task_id
            ))),
        }
    }

    /// Create a pending compliance scan, or a parse-only task when `parse_only`.
    pub async fn request_scan(
        &self,
        template_id: &str,
        env_id: Option<&str>,
        parse_only: bool,
    ) -> CoreResult<ScanTask> {
        let template = self.template(template_id).await?;
        let env = self.environment_of(&template, env_id).await?;

        if template.status == TemplateStatus::Disabled {
            return Err(CoreError::ineligible(
                format!("template {}", template.id),
                "template is disabled",
            ));
        }

        match &env {
            Some(env) => {
                if env.status == EnvStatus::Archived {
                    return Err(CoreError::ineligible(
                        format!("environment {}", env.id),
                        "environment is archived",
                    ));
                }
                if !env.compliance_enabled && !parse_only {
                    return Err(CoreError::ScanNotEnabled(format!("environment {}", env.id)));
                }
            }
            None => {
                if !template.compliance_enabled && !parse_only {
                    return Err(CoreError::ScanNotEnabled(format!("template {}", template.id)));
                }
            }
        }

        let task_type = resolve_scan_type(env.is_some(), parse_only);
        let runner_id = self.resolve_runner(None).await?;
        let timeout = self.step_timeout(&ExecutionOptions::default());
        let scan = ScanTask::new(Task::new(
            &template,
            env.as_ref(),
            task_type,
            &runner_id,
            timeout,
        ));

        match self.state.create_scan_task(&scan).await? {
            TaskInsert::Created(scan) => {
                tracing::info!(
                    task = %scan.id(),
                    task_type = %scan.task.task_type,
                    target = %scan.task.target(),
                    "Created scan task"
                );
                Ok(scan)
            }
            TaskInsert::Conflict { active_task_id } => Err(CoreError::Conflict(format!(
                "{} already has active scan {}",
                scan.task.target(),
                active_task_id
            ))),
        }
    }

    // ─── Transitions ────────────────────────────────────────────────────────

    /// Record that a runner started the task in `container_id`.
    pub async fn mark_running(&self, task_id: &str, container_id: &str) -> CoreResult<()> {
        let located = self.locate(task_id).await?;
        let task = located.task();
        if !task.status.can_transition_to(TaskStatus::Running) {
            return Err(invalid_transition(task, TaskStatus::Running));
        }

        match self
            .state
            .start_task(located.kind(), task_id, container_id, Utc::now())
            .await?
        {
            StartOutcome::Started => {
                tracing::info!(task = task_id, container = container_id, "Task running");
                Ok(())
            }
            StartOutcome::NotPending => {
                let current = self.locate(task_id).await?;
                Err(invalid_transition(current.task(), TaskStatus::Running))
            }
            StartOutcome::ContainerBusy { task_id: holder } => Err(CoreError::Conflict(format!(
                "container {} is held by active task {}",
                container_id, holder
            ))),
        }
    }

    /// Record the runner-reported terminal status and ingest the task's results.
    ///
    /// The status change is committed before ingestion starts; ingestion steps
    /// that fail are logged and reported but never undo it.
    pub async fn finalize(
        &self,
        task_id: &str,
        reported: TaskStatus,
        message: Option<&str>,
    ) -> CoreResult<Finalized> {
        if !reported.is_terminal() {
            return Err(CoreError::InvalidRequest(format!(
                "'{}' is not a terminal status",
                reported
            )));
        }
        let located = self.locate(task_id).await?;
        if !located.task().status.can_transition_to(reported) {
            return Err(invalid_transition(located.task(), reported));
        }

        let now = Utc::now();
        let updated = self
            .state
            .finish_task(located.kind(), task_id, reported, message, now)
            .await?;
        if !updated {
            let current = self.locate(task_id).await?;
            return Err(invalid_transition(current.task(), reported));
        }
        tracing::info!(task = task_id, status = %reported, "Task finished");

        let located = self.locate(task_id).await?;
        let report = match &located {
            AnyTask::Execution(task) if reported == TaskStatus::Complete => {
                self.ingest_execution(task, true).await
            }
            AnyTask::Execution(_) => IngestReport::default(),
            AnyTask::Scan(scan) => self.ingest_scan(scan).await,
        };

        if let Some(event) = Event::for_status(reported) {
            self.notifier.notify(event, located.task()).await;
        }
        Ok(Finalized {
            task: located,
            report,
        })
    }

    /// Re-run ingestion for a completed task. Safe to repeat.
    ///
    /// Only the task's own artifacts are re-read. Environment status and
    /// auto-destroy were settled when the task finished.
    pub async fn reingest(&self, task_id: &str) -> CoreResult<IngestReport> {
        let located = self.locate(task_id).await?;
        let task = located.task();
        if !task.status.is_terminal() {
            return Err(CoreError::InvalidRequest(format!(
                "task {} is still {}",
                task.id, task.status
            )));
        }
        tracing::info!(task = task_id, "Re-ingesting task results");
        Ok(match &located {
            AnyTask::Execution(task) if task.status == TaskStatus::Complete => {
                self.ingest_execution(task, false).await
            }
            AnyTask::Execution(_) => IngestReport::default(),
            AnyTask::Scan(scan) => self.ingest_scan(scan).await,
        })
    }

    /// Ask the task's runner to stop its container. Does not change status.
    pub async fn stop(&self, task_id: &str) -> CoreResult<()> {
        let located = self.locate(task_id).await?;
        let task = located.task();
        let Some(container) = &task.container_id else {
            tracing::debug!(task = task_id, "Task has no container, nothing to stop");
            return Ok(());
        };

        self.control
            .stop_task(&task.runner_id, &task.id, std::slice::from_ref(container))
            .await
            .map_err(|e| {
                tracing::warn!(
                    task = task_id,
                    runner = %task.runner_id,
                    container = %container,
                    error = %e,
                    "Failed to stop task container"
                );
                e
            })
    }

    // ─── Parse Introspection ────────────────────────────────────────────────

    /// Run a parse-only task and return the parsed infrastructure document.
    ///
    /// Blocks for at most the configured parse timeout.
    pub async fn parse_template(&self, template_id: &str, env_id: Option<&str>) -> CoreResult<Value> {
        let scan = self.request_scan(template_id, env_id, true).await?;
        let done = wait::wait_for_scan(
            self.state.as_ref(),
            scan.id(),
            self.settings.parse_poll_interval(),
            self.settings.parse_timeout(),
        )
        .await?;

        if done.task.status != TaskStatus::Complete {
            return Err(CoreError::ParseFailed {
                task: done.task.id.clone(),
                status: done.task.status.to_string(),
            });
        }

        let path = TaskPaths::for_task(&done.task).tfparse_json();
        let bytes = self
            .artifacts
            .read(&path)
            .await?
            .ok_or_else(|| CoreError::MalformedArtifact {
                artifact: "tfparse",
                reason: "artifact not present".into(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::MalformedArtifact {
            artifact: "tfparse",
            reason: e.to_string(),
        })
    }

    // ─── Background ─────────────────────────────────────────────────────────

    /// Start a template compliance scan in the background. Errors are only logged.
    pub fn trigger_template_rescan(self: &Arc<Self>, template_id: &str) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let template_id = template_id.to_string();
        tokio::spawn(async move {
            match manager.request_scan(&template_id, None, false).await {
                Ok(scan) => {
                    tracing::info!(template = %template_id, task = %scan.id(), "Queued template re-scan")
                }
                Err(e) => {
                    tracing::warn!(template = %template_id, error = %e, "Template re-scan not started")
                }
            }
        })
    }

    /// Create destroy tasks for environments whose auto-destroy time has passed.
    pub async fn sweep_auto_destroy(&self, now: DateTime<Utc>) -> CoreResult<Vec<Task>> {
        let due = self.state.due_auto_destroys(now).await?;
        let mut created = Vec::new();
        for env in due {
            let task = match self
                .request_execution(
                    &env.template_id,
                    Some(&env.id),
                    TaskType::Destroy,
                    &ExecutionOptions::default(),
                )
                .await
            {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(env = %env.id, error = %e, "Auto-destroy skipped");
                    continue;
                }
            };
            if let Err(e) = self
                .state
                .update_auto_destroy(&env.id, &AutoDestroyUpdate::assign_task(&task.id))
                .await
            {
                tracing::error!(env = %env.id, task = %task.id, error = %e, "Failed to record auto-destroy task");
            }
            tracing::info!(env = %env.id, task = %task.id, "Auto-destroy task created");
            created.push(task);
        }
        Ok(created)
    }
}

fn invalid_transition(task: &Task, to: TaskStatus) -> CoreError {
    CoreError::InvalidTransition {
        task: task.id.clone(),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_scan_type() {
        assert_eq!(resolve_scan_type(true, false), TaskType::EnvScan);
        assert_eq!(resolve_scan_type(true, true), TaskType::EnvParse);
        assert_eq!(resolve_scan_type(false, false), TaskType::TplScan);
        assert_eq!(resolve_scan_type(false, true), TaskType::TplParse);
    }
}
