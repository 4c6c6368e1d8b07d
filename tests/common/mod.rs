#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use iacflow::artifact::{FsArtifactStore, TaskPaths};
use iacflow::config::{RunnerEntry, Settings};
use iacflow::error::CoreResult;
use iacflow::lifecycle::TaskManager;
use iacflow::notify::{Event, Notifier};
use iacflow::policy::{RuleEvaluator, Violation};
use iacflow::runner::{RunnerControl, StaticRunnerRegistry};
use iacflow::state::models::{Environment, EnvStatus, Task, Template};
use iacflow::state::{SqliteBackend, StateBackend};

/// Records stop requests and always succeeds.
#[derive(Default)]
pub struct FakeControl {
    pub stops: Mutex<Vec<(String, String, Vec<String>)>>,
}

#[async_trait]
impl RunnerControl for FakeControl {
    async fn stop_task(
        &self,
        runner_id: &str,
        task_id: &str,
        container_ids: &[String],
    ) -> CoreResult<()> {
        self.stops.lock().unwrap().push((
            runner_id.to_string(),
            task_id.to_string(),
            container_ids.to_vec(),
        ));
        Ok(())
    }
}

/// Evaluates rules by name: `pass`, `violate` or anything else fails.
#[derive(Default)]
pub struct FakeEvaluator {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl RuleEvaluator for FakeEvaluator {
    async fn evaluate(&self, rule: &str, _input: &Value) -> anyhow::Result<Vec<Violation>> {
        self.calls.lock().unwrap().push(rule.to_string());
        match rule {
            "pass" => Ok(Vec::new()),
            "violate" => Ok(vec![Violation::new("bucket is public")]),
            other => anyhow::bail!("rule '{}' does not compile", other),
        }
    }
}

/// Collects notifications in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(Event, String)>>,
}

impl RecordingNotifier {
    pub fn events_for(&self, task_id: &str) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id)| id == task_id)
            .map(|(e, _)| *e)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: Event, task: &Task) {
        self.events.lock().unwrap().push((event, task.id.clone()));
    }
}

/// A task manager wired to an in-memory database and fakes.
pub struct Harness {
    pub _dir: TempDir,
    pub state: Arc<SqliteBackend>,
    pub artifacts: Arc<FsArtifactStore>,
    pub control: Arc<FakeControl>,
    pub evaluator: Arc<FakeEvaluator>,
    pub notifier: Arc<RecordingNotifier>,
    pub manager: Arc<TaskManager>,
}

pub fn settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::with_working_dir(dir.path().to_str().unwrap());
    settings.runners = vec![RunnerEntry {
        id: "runner-1".into(),
        address: "http://127.0.0.1:1".into(),
    }];
    settings.parse_poll_interval_ms = 10;
    settings.parse_timeout_secs = 1;
    settings
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let state = Arc::new(SqliteBackend::open_memory().unwrap());
    state.initialize().await.unwrap();

    let artifacts = Arc::new(FsArtifactStore::new(&settings.artifact_dir));
    let control = Arc::new(FakeControl::default());
    let evaluator = Arc::new(FakeEvaluator::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = Arc::new(TaskManager::new(
        state.clone(),
        Arc::new(StaticRunnerRegistry::from_settings(&settings)),
        control.clone(),
        artifacts.clone(),
        evaluator.clone(),
        notifier.clone(),
        settings,
    ));

    Harness {
        _dir: dir,
        state,
        artifacts,
        control,
        evaluator,
        notifier,
        manager,
    }
}

impl Harness {
    pub async fn template(&self, compliance: bool) -> Template {
        let mut template = Template::new("org-1", "network");
        template.compliance_enabled = compliance;
        self.state.insert_template(&template).await.unwrap();
        template
    }

    pub async fn environment(&self, template: &Template, ttl: &str) -> Environment {
        let mut env = Environment::new(template, "dev");
        env.ttl = ttl.to_string();
        env.compliance_enabled = true;
        self.state.insert_environment(&env).await.unwrap();
        env
    }

    pub async fn active_environment(&self, template: &Template, ttl: &str) -> Environment {
        let env = self.environment(template, ttl).await;
        self.state
            .set_environment_status(&env.id, EnvStatus::Active, None)
            .await
            .unwrap();
        self.state.get_environment(&env.id).await.unwrap().unwrap()
    }

    /// Write a named artifact (see `TaskPaths::by_name`) for a task.
    pub async fn put_artifact(&self, task: &Task, name: &str, bytes: &[u8]) {
        let path = TaskPaths::for_task(task).by_name(name).unwrap();
        self.artifacts.write(&path, bytes).await.unwrap();
    }

    pub async fn env(&self, id: &str) -> Environment {
        self.state.get_environment(id).await.unwrap().unwrap()
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

pub const STATE_JSON: &str = r#"{
  "format_version": "1.0",
  "values": {
    "outputs": {
      "vpc_id": {"value": "vpc-123", "sensitive": false},
      "db_password": {"value": "hunter2", "sensitive": true}
    },
    "root_module": {
      "resources": [
        {
          "address": "aws_vpc.main",
          "mode": "managed",
          "type": "aws_vpc",
          "name": "main",
          "provider_name": "registry.terraform.io/hashicorp/aws",
          "values": {"cidr_block": "10.0.0.0/16", "tags": {"Name": "main"}},
          "sensitive_values": {}
        },
        {
          "address": "aws_s3_bucket.logs",
          "mode": "managed",
          "type": "aws_s3_bucket",
          "name": "logs",
          "provider_name": "registry.terraform.io/hashicorp/aws",
          "values": {"bucket": "logs-bucket", "acl": "private"},
          "sensitive_values": {}
        },
        {
          "address": "aws_iam_role.ci",
          "mode": "managed",
          "type": "aws_iam_role",
          "name": "ci",
          "provider_name": "registry.terraform.io/hashicorp/aws",
          "values": {"name": "ci"},
          "sensitive_values": {}
        }
      ]
    }
  }
}"#;

pub const PLAN_JSON: &str = r#"{
  "format_version": "1.1",
  "resource_changes": [
    {
      "address": "aws_vpc.main",
      "type": "aws_vpc",
      "change": {"actions": ["update"], "before": {"cidr_block": "10.0.0.0/16"}, "after": {"cidr_block": "10.1.0.0/16"}}
    },
    {
      "address": "aws_s3_bucket.logs",
      "type": "aws_s3_bucket",
      "change": {"actions": ["no-op"], "before": {}, "after": {}}
    }
  ]
}"#;

pub fn drift_log(addresses: &[&str]) -> String {
    let mut log = String::from(
        "Note: Objects have changed outside of Terraform\n\n\
         Terraform detected the following changes made outside of Terraform since the\n\
         last \"terraform apply\":\n\n",
    );
    for address in addresses {
        let (rtype, rname) = address.split_once('.').unwrap();
        log.push_str(&format!(
            "  # {} has changed\n  ~ resource \"{}\" \"{}\" {{\n      ~ tags = {{\n          ~ \"Name\" = \"old\" -> \"new\"\n        }}\n        id = \"x\"\n    }}\n\n",
            address, rtype, rname
        ));
    }
    log.push_str("No changes. Your infrastructure matches the configuration.\n");
    log
}
