/// SQL DDL for the iacflow state database.
///
/// Timestamps are stored as fixed-width RFC 3339 UTC text so that range
/// filters can compare them lexically.

pub const SCHEMA_VERSION: i32 = 1;

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

-- Templates (owned by the template catalogue; only the columns the core reads or writes)
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    repo_addr TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'enabled',
    compliance_enabled INTEGER NOT NULL DEFAULT 0,
    last_scan_task_id TEXT,
    created_at TEXT NOT NULL
);

-- Environments: deployed instances of a template
CREATE TABLE IF NOT EXISTS environments (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'inactive',
    compliance_enabled INTEGER NOT NULL DEFAULT 0,
    ttl TEXT NOT NULL DEFAULT '',
    auto_destroy_at TEXT,
    auto_destroy_task_id TEXT,
    last_task_id TEXT,
    last_scan_task_id TEXT,
    last_res_task_id TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (template_id) REFERENCES templates(id)
);

-- Execution tasks (plan / apply / destroy)
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    env_id TEXT,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    runner_id TEXT NOT NULL,
    container_id TEXT,
    step_timeout_secs INTEGER NOT NULL,
    message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

-- Compliance scan and parse tasks
CREATE TABLE IF NOT EXISTS scan_tasks (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    env_id TEXT,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    runner_id TEXT NOT NULL,
    container_id TEXT,
    step_timeout_secs INTEGER NOT NULL,
    message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    policy_status TEXT NOT NULL DEFAULT 'pending'
);

-- Resources parsed from a task's state file
CREATE TABLE IF NOT EXISTS task_resources (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    address TEXT NOT NULL,
    module_path TEXT NOT NULL DEFAULT '',
    resource_mode TEXT NOT NULL DEFAULT 'managed',
    resource_type TEXT NOT NULL,
    resource_name TEXT NOT NULL,
    provider TEXT NOT NULL DEFAULT '',
    index_key TEXT,
    attributes_json TEXT NOT NULL DEFAULT '{}',
    dependencies TEXT NOT NULL DEFAULT '[]',
    UNIQUE(task_id, address),
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

-- Outputs parsed from a task's state file
CREATE TABLE IF NOT EXISTS task_outputs (
    task_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value_json TEXT NOT NULL,
    sensitive INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (task_id, name),
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

-- Planned changes parsed from a task's plan file
CREATE TABLE IF NOT EXISTS task_changes (
    task_id TEXT NOT NULL,
    address TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    action TEXT NOT NULL,
    before_json TEXT,
    after_json TEXT,
    PRIMARY KEY (task_id, address),
    FOREIGN KEY (task_id) REFERENCES tasks(id)
);

-- Drift detected against an environment's last apply task
CREATE TABLE IF NOT EXISTS resource_drift (
    res_task_id TEXT NOT NULL,
    address TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    drift_json TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    PRIMARY KEY (res_task_id, address)
);

-- Policy groups and their rules
CREATE TABLE IF NOT EXISTS policy_groups (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policies (
    id TEXT PRIMARY KEY,
    group_id TEXT NOT NULL,
    name TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'medium',
    rule TEXT NOT NULL,
    fix_suggestion TEXT NOT NULL DEFAULT '',
    UNIQUE(group_id, name),
    FOREIGN KEY (group_id) REFERENCES policy_groups(id) ON DELETE CASCADE
);

-- Which policy groups apply to which template / environment
CREATE TABLE IF NOT EXISTS policy_bindings (
    scope TEXT NOT NULL,
    target_id TEXT NOT NULL,
    group_id TEXT NOT NULL,
    PRIMARY KEY (scope, target_id, group_id),
    FOREIGN KEY (group_id) REFERENCES policy_groups(id) ON DELETE CASCADE
);

-- Rules muted for a target
CREATE TABLE IF NOT EXISTS policy_suppressions (
    policy_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (policy_id, target_id)
);

-- Per-rule outcomes of scan tasks
CREATE TABLE IF NOT EXISTS policy_results (
    id TEXT PRIMARY KEY,
    scan_task_id TEXT NOT NULL,
    policy_id TEXT NOT NULL,
    policy_group_id TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    severity TEXT NOT NULL DEFAULT 'medium',
    created_at TEXT NOT NULL,
    UNIQUE(scan_task_id, policy_id),
    FOREIGN KEY (scan_task_id) REFERENCES scan_tasks(id)
);
";

pub const CREATE_INDEXES_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_environments_template ON environments(template_id);
CREATE INDEX IF NOT EXISTS idx_environments_auto_destroy ON environments(auto_destroy_at);
CREATE INDEX IF NOT EXISTS idx_tasks_env ON tasks(env_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_template ON tasks(template_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_container ON tasks(container_id);
CREATE INDEX IF NOT EXISTS idx_scan_tasks_env ON scan_tasks(env_id, status);
CREATE INDEX IF NOT EXISTS idx_scan_tasks_template ON scan_tasks(template_id, status);
CREATE INDEX IF NOT EXISTS idx_scan_tasks_container ON scan_tasks(container_id);
CREATE INDEX IF NOT EXISTS idx_task_resources_task ON task_resources(task_id);
CREATE INDEX IF NOT EXISTS idx_policies_group ON policies(group_id);
CREATE INDEX IF NOT EXISTS idx_policy_results_task ON policy_results(scan_task_id);
CREATE INDEX IF NOT EXISTS idx_policy_results_created ON policy_results(created_at);
";
