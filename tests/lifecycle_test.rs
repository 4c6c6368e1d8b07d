mod common;

use std::time::Duration;

use chrono::Utc;

use common::{drift_log, harness, Harness, PLAN_JSON, STATE_JSON};
use iacflow::error::CoreError;
use iacflow::lifecycle::ingest::{
    STEP_AUTO_DESTROY, STEP_DRIFT, STEP_ENVIRONMENT, STEP_PLAN, STEP_STATE,
};
use iacflow::lifecycle::wait::wait_for_scan;
use iacflow::lifecycle::{ExecutionOptions, StepOutcome};
use iacflow::notify::Event;
use iacflow::state::models::*;
use iacflow::state::StateBackend;

async fn execute(h: &Harness, env: &Environment, task_type: TaskType) -> Task {
    h.manager
        .request_execution(&env.template_id, Some(&env.id), task_type, &ExecutionOptions::default())
        .await
        .unwrap()
}

async fn complete(h: &Harness, task: &Task) {
    h.manager
        .mark_running(&task.id, &format!("ctr-{}", task.id))
        .await
        .unwrap();
    h.manager
        .finalize(&task.id, TaskStatus::Complete, None)
        .await
        .unwrap();
}

async fn applied_environment(h: &Harness, ttl: &str) -> (Environment, Task) {
    let template = h.template(true).await;
    let env = h.environment(&template, ttl).await;
    let apply = execute(h, &env, TaskType::Apply).await;
    h.put_artifact(&apply, "state", STATE_JSON.as_bytes()).await;
    complete(h, &apply).await;
    (h.env(&env.id).await, apply)
}

// ─── Status Machine ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_status_moves_forward_only() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let task = execute(&h, &env, TaskType::Plan).await;
    assert_eq!(task.status, TaskStatus::Pending);

    h.manager.mark_running(&task.id, "ctr-1").await.unwrap();
    let running = h.state.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    assert_eq!(running.container_id.as_deref(), Some("ctr-1"));
    assert!(running.started_at.is_some());

    h.manager
        .finalize(&task.id, TaskStatus::Failed, Some("exit 1"))
        .await
        .unwrap();
    let failed = h.state.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.message.as_deref(), Some("exit 1"));
    assert!(failed.completed_at.is_some());

    let err = h
        .manager
        .finalize(&task.id, TaskStatus::Complete, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
    let err = h.manager.mark_running(&task.id, "ctr-2").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
    assert_eq!(
        h.state.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn test_finalize_rejects_non_terminal_status() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let task = execute(&h, &env, TaskType::Plan).await;

    let err = h
        .manager
        .finalize(&task.id, TaskStatus::Running, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_request");
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let h = harness().await;
    let err = h.manager.stop("missing").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

// ─── Eligibility & Exclusivity ──────────────────────────────────────────────

#[tokio::test]
async fn test_one_active_task_per_environment() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let first = execute(&h, &env, TaskType::Plan).await;

    let err = h
        .manager
        .request_execution(&template.id, Some(&env.id), TaskType::Apply, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    complete(&h, &first).await;
    execute(&h, &env, TaskType::Apply).await;
}

#[tokio::test]
async fn test_scans_do_not_block_executions() {
    let h = harness().await;
    let template = h.template(true).await;
    let env = h.environment(&template, "").await;

    h.manager
        .request_scan(&template.id, Some(&env.id), false)
        .await
        .unwrap();
    execute(&h, &env, TaskType::Plan).await;

    let err = h
        .manager
        .request_scan(&template.id, Some(&env.id), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // Parse-only tasks are outside exclusivity.
    h.manager
        .request_scan(&template.id, Some(&env.id), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_apply_requires_environment() {
    let h = harness().await;
    let template = h.template(false).await;

    let err = h
        .manager
        .request_execution(&template.id, None, TaskType::Apply, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ineligible_target");

    let plan = h
        .manager
        .request_execution(&template.id, None, TaskType::Plan, &ExecutionOptions::default())
        .await
        .unwrap();
    assert!(plan.env_id.is_none());
}

#[tokio::test]
async fn test_archived_environment_is_ineligible() {
    let h = harness().await;
    let template = h.template(true).await;
    let env = h.environment(&template, "").await;
    h.state
        .set_environment_status(&env.id, EnvStatus::Archived, None)
        .await
        .unwrap();

    let err = h
        .manager
        .request_execution(&template.id, Some(&env.id), TaskType::Plan, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IneligibleTarget { .. }));

    let err = h
        .manager
        .request_scan(&template.id, Some(&env.id), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IneligibleTarget { .. }));
}

#[tokio::test]
async fn test_disabled_template_rejects_environment_scans() {
    let h = harness().await;
    let mut template = Template::new("org-1", "network");
    template.status = TemplateStatus::Disabled;
    template.compliance_enabled = true;
    h.state.insert_template(&template).await.unwrap();
    let env = h.environment(&template, "").await;

    for env_id in [Some(env.id.as_str()), None] {
        for parse_only in [false, true] {
            let err = h
                .manager
                .request_scan(&template.id, env_id, parse_only)
                .await
                .unwrap_err();
            assert!(
                matches!(err, CoreError::IneligibleTarget { .. }),
                "env {:?} parse_only {}: {:?}",
                env_id,
                parse_only,
                err
            );
        }
    }
    assert!(h.env(&env.id).await.last_scan_task_id.is_none());
}

#[tokio::test]
async fn test_scan_requires_compliance_unless_parse_only() {
    let h = harness().await;
    let template = h.template(false).await;

    let err = h
        .manager
        .request_scan(&template.id, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ScanNotEnabled(_)));
    assert_eq!(err.http_status(), 400);

    let parse = h.manager.request_scan(&template.id, None, true).await.unwrap();
    assert_eq!(parse.task.task_type, TaskType::TplParse);
}

#[tokio::test]
async fn test_unknown_runner_is_rejected() {
    let h = harness().await;
    let template = h.template(false).await;
    let opts = ExecutionOptions {
        runner_id: Some("runner-9".into()),
        step_timeout_secs: None,
    };
    let err = h
        .manager
        .request_execution(&template.id, None, TaskType::Plan, &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RunnerNotRegistered(_)));
}

#[tokio::test]
async fn test_container_held_by_one_active_task() {
    let h = harness().await;
    let template = h.template(false).await;
    let mut other = Environment::new(&template, "staging");
    other.ttl = String::new();
    h.state.insert_environment(&other).await.unwrap();
    let env = h.environment(&template, "").await;

    let a = execute(&h, &env, TaskType::Plan).await;
    let b = execute(&h, &other, TaskType::Plan).await;
    h.manager.mark_running(&a.id, "ctr-shared").await.unwrap();

    let err = h.manager.mark_running(&b.id, "ctr-shared").await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    h.manager
        .finalize(&a.id, TaskStatus::Complete, None)
        .await
        .unwrap();
    h.manager.mark_running(&b.id, "ctr-shared").await.unwrap();
}

// ─── Ingestion ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_apply_ingests_state_and_activates_environment() {
    let h = harness().await;
    let (env, apply) = applied_environment(&h, "").await;

    assert_eq!(env.status, EnvStatus::Active);
    assert_eq!(env.last_res_task_id.as_deref(), Some(apply.id.as_str()));
    assert_eq!(env.last_task_id.as_deref(), Some(apply.id.as_str()));

    let resources = h.state.list_task_resources(&apply.id).await.unwrap();
    let addresses: Vec<&str> = resources.iter().map(|r| r.address.as_str()).collect();
    assert_eq!(resources.len(), 3);
    assert!(addresses.contains(&"aws_vpc.main"));

    let outputs = h.state.list_task_outputs(&apply.id).await.unwrap();
    let password = outputs.iter().find(|o| o.name == "db_password").unwrap();
    assert!(password.sensitive);
    assert!(!password.value_json.contains("hunter2"));

    assert_eq!(
        h.notifier.events_for(&apply.id),
        vec![Event::TaskComplete]
    );
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let plan = execute(&h, &env, TaskType::Plan).await;
    h.put_artifact(&plan, "state", STATE_JSON.as_bytes()).await;
    h.put_artifact(&plan, "plan", PLAN_JSON.as_bytes()).await;
    complete(&h, &plan).await;

    let resources = h.state.list_task_resources(&plan.id).await.unwrap();
    let outputs = h.state.list_task_outputs(&plan.id).await.unwrap();
    let changes = h.state.list_task_changes(&plan.id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].action, action::UPDATE);

    let report = h.manager.reingest(&plan.id).await.unwrap();
    assert_eq!(report.outcome(STEP_STATE), Some(&StepOutcome::Done));
    assert_eq!(report.outcome(STEP_PLAN), Some(&StepOutcome::Done));

    assert_eq!(h.state.list_task_resources(&plan.id).await.unwrap(), resources);
    assert_eq!(h.state.list_task_outputs(&plan.id).await.unwrap(), outputs);
    assert_eq!(h.state.list_task_changes(&plan.id).await.unwrap(), changes);
}

#[tokio::test]
async fn test_malformed_artifact_does_not_block_other_steps() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let apply = execute(&h, &env, TaskType::Apply).await;
    h.put_artifact(&apply, "state", b"{ not json").await;
    h.put_artifact(&apply, "plan", PLAN_JSON.as_bytes()).await;
    h.manager.mark_running(&apply.id, "ctr-1").await.unwrap();

    let finalized = h
        .manager
        .finalize(&apply.id, TaskStatus::Complete, None)
        .await
        .unwrap();

    assert!(matches!(
        finalized.report.outcome(STEP_STATE),
        Some(StepOutcome::Failed(_))
    ));
    assert_eq!(finalized.report.outcome(STEP_PLAN), Some(&StepOutcome::Done));
    assert_eq!(finalized.task.task().status, TaskStatus::Complete);
    assert_eq!(h.env(&env.id).await.status, EnvStatus::Active);
}

#[tokio::test]
async fn test_failed_execution_is_not_ingested() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let apply = execute(&h, &env, TaskType::Apply).await;
    h.put_artifact(&apply, "state", STATE_JSON.as_bytes()).await;

    let finalized = h
        .manager
        .finalize(&apply.id, TaskStatus::Timeout, None)
        .await
        .unwrap();
    assert!(finalized.report.steps.is_empty());
    assert!(h.state.list_task_resources(&apply.id).await.unwrap().is_empty());
    assert_eq!(h.env(&env.id).await.status, EnvStatus::Inactive);
    assert_eq!(h.notifier.events_for(&apply.id), vec![Event::TaskTimeout]);
}

// ─── Drift ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_drift_rows_follow_latest_detection() {
    let h = harness().await;
    let (env, apply) = applied_environment(&h, "").await;

    let plan = execute(&h, &env, TaskType::Plan).await;
    let log = drift_log(&["aws_vpc.main", "aws_s3_bucket.logs"]);
    h.put_artifact(&plan, "plan-log", log.as_bytes()).await;
    complete(&h, &plan).await;

    let drift = h.state.list_drift(&apply.id).await.unwrap();
    let mut addresses: Vec<String> = drift.iter().map(|d| d.address.clone()).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["aws_s3_bucket.logs", "aws_vpc.main"]);
    assert!(h.notifier.events_for(&plan.id).contains(&Event::Drift));

    let plan = execute(&h, &env, TaskType::Plan).await;
    let log = drift_log(&["aws_s3_bucket.logs", "aws_iam_role.ci"]);
    h.put_artifact(&plan, "plan-log", log.as_bytes()).await;
    complete(&h, &plan).await;

    let drift = h.state.list_drift(&apply.id).await.unwrap();
    let mut addresses: Vec<String> = drift.iter().map(|d| d.address.clone()).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["aws_iam_role.ci", "aws_s3_bucket.logs"]);

    let logs = drift
        .iter()
        .find(|d| d.address == "aws_s3_bucket.logs")
        .unwrap();
    let detail: serde_json::Value = serde_json::from_str(&logs.drift_json).unwrap();
    assert_eq!(detail["tags.Name"]["after"], "\"new\"");
}

#[tokio::test]
async fn test_drift_skips_unknown_resources() {
    let h = harness().await;
    let (env, apply) = applied_environment(&h, "").await;

    let plan = execute(&h, &env, TaskType::Plan).await;
    let log = drift_log(&["aws_vpc.main", "aws_instance.ghost"]);
    h.put_artifact(&plan, "plan-log", log.as_bytes()).await;
    complete(&h, &plan).await;

    let drift = h.state.list_drift(&apply.id).await.unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].address, "aws_vpc.main");
}

#[tokio::test]
async fn test_drift_ignored_without_applied_resources() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let plan = execute(&h, &env, TaskType::Plan).await;
    h.put_artifact(&plan, "plan-log", drift_log(&["aws_vpc.main"]).as_bytes())
        .await;
    h.manager.mark_running(&plan.id, "ctr-1").await.unwrap();

    let finalized = h
        .manager
        .finalize(&plan.id, TaskStatus::Complete, None)
        .await
        .unwrap();
    assert_eq!(finalized.report.outcome(STEP_DRIFT), Some(&StepOutcome::Skipped));
}

// ─── Auto-Destroy ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_apply_schedules_auto_destroy_once() {
    let h = harness().await;
    let before = Utc::now();
    let (env, _) = applied_environment(&h, "24h").await;

    let at = env.auto_destroy_at.expect("auto-destroy scheduled");
    assert!(at >= before + chrono::Duration::hours(24));
    assert!(at <= Utc::now() + chrono::Duration::hours(24));

    let again = execute(&h, &env, TaskType::Apply).await;
    complete(&h, &again).await;
    assert_eq!(h.env(&env.id).await.auto_destroy_at, Some(at));
}

#[tokio::test]
async fn test_zero_ttl_never_schedules() {
    let h = harness().await;
    let (env, _) = applied_environment(&h, "0").await;
    assert!(env.auto_destroy_at.is_none());
}

#[tokio::test]
async fn test_destroy_clears_auto_destroy_but_keeps_ttl() {
    let h = harness().await;
    let (env, _) = applied_environment(&h, "24h").await;
    assert!(env.auto_destroy_at.is_some());

    let destroy = execute(&h, &env, TaskType::Destroy).await;
    complete(&h, &destroy).await;

    let env = h.env(&env.id).await;
    assert_eq!(env.status, EnvStatus::Inactive);
    assert!(env.auto_destroy_at.is_none());
    assert!(env.auto_destroy_task_id.is_none());
    assert_eq!(env.ttl, "24h");
    assert_eq!(env.last_res_task_id.as_deref(), Some(destroy.id.as_str()));
}

#[tokio::test]
async fn test_reingest_of_old_apply_leaves_environment_alone() {
    let h = harness().await;
    let (env, apply) = applied_environment(&h, "24h").await;

    let destroy = execute(&h, &env, TaskType::Destroy).await;
    complete(&h, &destroy).await;
    let destroyed = h.env(&env.id).await;

    let report = h.manager.reingest(&apply.id).await.unwrap();
    assert_eq!(report.outcome(STEP_STATE), Some(&StepOutcome::Done));
    assert_eq!(report.outcome(STEP_ENVIRONMENT), Some(&StepOutcome::Skipped));
    assert_eq!(report.outcome(STEP_AUTO_DESTROY), Some(&StepOutcome::Skipped));

    let env = h.env(&env.id).await;
    assert_eq!(env.status, EnvStatus::Inactive);
    assert_eq!(env.last_res_task_id, destroyed.last_res_task_id);
    assert_eq!(env.last_res_task_id.as_deref(), Some(destroy.id.as_str()));
    assert!(env.auto_destroy_at.is_none());
    assert!(env.auto_destroy_task_id.is_none());
    assert_eq!(h.state.list_task_resources(&apply.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_sweep_creates_destroy_for_due_environments() {
    let h = harness().await;
    let (env, _) = applied_environment(&h, "1h").await;

    assert!(h.manager.sweep_auto_destroy(Utc::now()).await.unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::hours(2);
    let created = h.manager.sweep_auto_destroy(later).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].task_type, TaskType::Destroy);
    assert_eq!(
        h.env(&env.id).await.auto_destroy_task_id.as_deref(),
        Some(created[0].id.as_str())
    );

    assert!(h.manager.sweep_auto_destroy(later).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_in_progress_blocks_new_work() {
    let h = harness().await;
    let (env, _) = applied_environment(&h, "").await;
    execute(&h, &env, TaskType::Destroy).await;

    let err = h
        .manager
        .request_execution(&env.template_id, Some(&env.id), TaskType::Plan, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IneligibleTarget { .. }));
}

// ─── Stop ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_without_container_is_noop() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let task = execute(&h, &env, TaskType::Plan).await;

    h.manager.stop(&task.id).await.unwrap();
    assert!(h.control.stops.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_twice_succeeds() {
    let h = harness().await;
    let template = h.template(false).await;
    let env = h.environment(&template, "").await;
    let task = execute(&h, &env, TaskType::Plan).await;
    h.manager.mark_running(&task.id, "ctr-7").await.unwrap();

    h.manager.stop(&task.id).await.unwrap();
    h.manager.stop(&task.id).await.unwrap();

    let stops = h.control.stops.lock().unwrap();
    assert_eq!(stops.len(), 2);
    assert_eq!(
        stops[0],
        ("runner-1".to_string(), task.id.clone(), vec!["ctr-7".to_string()])
    );
    drop(stops);

    let current = h.state.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Running);
}

// ─── Parse Wait & Background ────────────────────────────────────────────────

#[tokio::test]
async fn test_wait_returns_when_parse_finishes() {
    let h = harness().await;
    let template = h.template(false).await;
    let parse = h.manager.request_scan(&template.id, None, true).await.unwrap();

    let manager = h.manager.clone();
    let id = parse.id().to_string();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.finalize(&id, TaskStatus::Complete, None).await.unwrap();
    });

    let done = wait_for_scan(
        &*h.state,
        parse.id(),
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(done.task.status, TaskStatus::Complete);
    assert_eq!(done.policy_status, PolicyStatus::Pending);
}

#[tokio::test]
async fn test_parse_template_times_out() {
    let h = harness().await;
    let template = h.template(false).await;

    let err = h
        .manager
        .parse_template(&template.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ParseTimeout(_)));
}

#[tokio::test]
async fn test_template_rescan_runs_detached() {
    let h = harness().await;
    let template = h.template(true).await;
    h.manager
        .trigger_template_rescan(&template.id)
        .await
        .unwrap();

    let template = h.state.get_template(&template.id).await.unwrap().unwrap();
    let scan_id = template.last_scan_task_id.expect("scan queued");
    let scan = h.state.get_scan_task(&scan_id).await.unwrap().unwrap();
    assert_eq!(scan.task.task_type, TaskType::TplScan);

    let disabled = h.template(false).await;
    h.manager
        .trigger_template_rescan(&disabled.id)
        .await
        .unwrap();
    let disabled = h.state.get_template(&disabled.id).await.unwrap().unwrap();
    assert!(disabled.last_scan_task_id.is_none());
}
