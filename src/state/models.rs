use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a stored enum column holds an unknown value.
#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ─── Enumerations ───────────────────────────────────────────────────────────

string_enum!(
    /// Kind of work a task performs.
    TaskType, "task type" {
        Plan => "plan",
        Apply => "apply",
        Destroy => "destroy",
        EnvScan => "env_scan",
        TplScan => "tpl_scan",
        EnvParse => "env_parse",
        TplParse => "tpl_parse",
    }
);

impl TaskType {
    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            TaskType::EnvScan | TaskType::TplScan | TaskType::EnvParse | TaskType::TplParse
        )
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, TaskType::EnvParse | TaskType::TplParse)
    }
}

string_enum!(
    /// Execution status of a task.
    TaskStatus, "task status" {
        Pending => "pending",
        Running => "running",
        Complete => "complete",
        Failed => "failed",
        Timeout => "timeout",
    }
);

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Statuses only ever move forward: pending -> running -> terminal.
    /// A pending task may also end directly (e.g. it never got a container).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending | TaskStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

string_enum!(
    /// Outcome of a policy evaluation, for a single rule or a whole scan.
    PolicyStatus, "policy status" {
        Pending => "pending",
        Passed => "passed",
        Violated => "violated",
        Failed => "failed",
        Suppressed => "suppressed",
    }
);

string_enum!(
    EnvStatus, "environment status" {
        Active => "active",
        Inactive => "inactive",
        Archived => "archived",
    }
);

string_enum!(
    TemplateStatus, "template status" {
        Enabled => "enabled",
        Disabled => "disabled",
    }
);

string_enum!(
    /// Which kind of object a policy group is bound to or a policy is suppressed on.
    Scope, "scope" {
        Template => "template",
        Environment => "environment",
    }
);

// ─── Templates & Environments ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub repo_addr: String,
    pub status: TemplateStatus,
    pub compliance_enabled: bool,
    pub last_scan_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(org_id: &str, name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            name: name.to_string(),
            repo_addr: String::new(),
            status: TemplateStatus::Enabled,
            compliance_enabled: false,
            last_scan_task_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub org_id: String,
    pub template_id: String,
    pub name: String,
    pub status: EnvStatus,
    pub compliance_enabled: bool,
    pub ttl: String,
    pub auto_destroy_at: Option<DateTime<Utc>>,
    pub auto_destroy_task_id: Option<String>,
    pub last_task_id: Option<String>,
    pub last_scan_task_id: Option<String>,
    pub last_res_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(template: &Template, name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: template.org_id.clone(),
            template_id: template.id.clone(),
            name: name.to_string(),
            status: EnvStatus::Inactive,
            compliance_enabled: false,
            ttl: String::new(),
            auto_destroy_at: None,
            auto_destroy_task_id: None,
            last_task_id: None,
            last_scan_task_id: None,
            last_res_task_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Auto-destroy columns written back to an environment.
/// For each field `None` leaves the column untouched and `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoDestroyUpdate {
    pub auto_destroy_at: Option<Option<DateTime<Utc>>>,
    pub auto_destroy_task_id: Option<Option<String>>,
}

impl AutoDestroyUpdate {
    pub fn schedule(at: DateTime<Utc>) -> Self {
        Self {
            auto_destroy_at: Some(Some(at)),
            auto_destroy_task_id: None,
        }
    }

    pub fn clear() -> Self {
        Self {
            auto_destroy_at: Some(None),
            auto_destroy_task_id: Some(None),
        }
    }

    pub fn assign_task(task_id: &str) -> Self {
        Self {
            auto_destroy_at: None,
            auto_destroy_task_id: Some(Some(task_id.to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.auto_destroy_at.is_none() && self.auto_destroy_task_id.is_none()
    }
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub org_id: String,
    pub template_id: String,
    pub env_id: Option<String>,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub runner_id: String,
    pub container_id: Option<String>,
    pub step_timeout_secs: i64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        template: &Template,
        env: Option<&Environment>,
        task_type: TaskType,
        runner_id: &str,
        step_timeout_secs: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: template.org_id.clone(),
            template_id: template.id.clone(),
            env_id: env.map(|e| e.id.clone()),
            task_type,
            status: TaskStatus::Pending,
            runner_id: runner_id.to_string(),
            container_id: None,
            step_timeout_secs,
            message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// The object this task holds exclusively while active.
    pub fn target(&self) -> Target {
        match &self.env_id {
            Some(env_id) => Target::Environment(env_id.clone()),
            None => Target::Template(self.template_id.clone()),
        }
    }
}

/// A compliance scan (or parse-only introspection) task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
    #[serde(flatten)]
    pub task: Task,
    pub policy_status: PolicyStatus,
}

impl ScanTask {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            policy_status: PolicyStatus::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }
}

/// Which task table a lifecycle operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Execution,
    Scan,
}

impl TaskKind {
    pub fn table(&self) -> &'static str {
        match self {
            TaskKind::Execution => "tasks",
            TaskKind::Scan => "scan_tasks",
        }
    }
}

/// Outcome of assigning a container to a pending task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The task was no longer pending when the update ran.
    NotPending,
    /// Another active task already holds the container.
    ContainerBusy { task_id: String },
}

/// Exclusivity key for active tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Template(String),
    Environment(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Template(id) => write!(f, "template {}", id),
            Target::Environment(id) => write!(f, "environment {}", id),
        }
    }
}

/// Outcome of an exclusive task insert.
#[derive(Debug)]
pub enum TaskInsert<T> {
    Created(T),
    /// Another non-terminal task already holds the target.
    Conflict { active_task_id: String },
}

// ─── Ingested results ───────────────────────────────────────────────────────

/// A managed or data resource recorded from a task's state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResource {
    pub id: String,
    pub task_id: String,
    pub address: String,
    pub module_path: String,
    pub resource_mode: String,
    pub resource_type: String,
    pub resource_name: String,
    pub provider: String,
    pub index_key: Option<String>,
    pub attributes_json: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub name: String,
    pub value_json: String,
    pub sensitive: bool,
}

/// A planned change recorded from a task's plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskChange {
    pub task_id: String,
    pub address: String,
    pub resource_type: String,
    pub action: String,
    pub before_json: Option<String>,
    pub after_json: Option<String>,
}

pub mod action {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const REPLACE: &str = "replace";
    pub const READ: &str = "read";
    pub const NOOP: &str = "no-op";
}

/// Detected drift for one resource of an environment's last apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDrift {
    pub res_task_id: String,
    pub address: String,
    pub resource_id: String,
    pub drift_json: String,
    pub detected_at: DateTime<Utc>,
}

// ─── Policies ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyGroup {
    pub id: String,
    pub org_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub severity: String,
    pub rule: String,
    pub fix_suggestion: String,
}

pub mod severity {
    pub const HIGH: &str = "high";
    pub const MEDIUM: &str = "medium";
    pub const LOW: &str = "low";
}

/// One rule's outcome within a scan task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub id: String,
    pub scan_task_id: String,
    pub policy_id: String,
    pub policy_group_id: String,
    pub status: PolicyStatus,
    pub message: String,
    pub severity: String,
    pub created_at: DateTime<Utc>,
}

/// A policy result joined with the names and target needed for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResultRow {
    #[serde(flatten)]
    pub result: PolicyResult,
    pub policy_name: String,
    pub policy_group_name: String,
    pub template_id: String,
    pub env_id: Option<String>,
    pub target_name: String,
}

impl PolicyResultRow {
    pub fn target_id(&self) -> &str {
        self.env_id.as_deref().unwrap_or(&self.template_id)
    }
}
