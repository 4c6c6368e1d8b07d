use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::backend::StateBackend;
use super::migration;
use super::models::*;

/// Fixed-width RFC 3339 text, so stored timestamps order lexically.
pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed store shared by the lifecycle manager and the CLI.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the state database.
    pub fn open(db_path: &str) -> Result<Self> {
        let parent = Path::new(db_path).parent();
        if let Some(dir) = parent {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state database at {}", db_path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database lock poisoned"))
    }

    /// Run `f` in a transaction: commit on success, roll back on error or panic.
    fn with_tx<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .with_context(|| format!("Failed to begin transaction for {}", op))?;

        match catch_unwind(AssertUnwindSafe(|| f(&tx))) {
            Ok(Ok(value)) => {
                tx.commit()
                    .with_context(|| format!("Failed to commit {}", op))?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(rb) = tx.rollback() {
                    tracing::warn!(op, error = %rb, "rollback failed");
                }
                Err(e.context(format!("{} rolled back", op)))
            }
            Err(payload) => {
                let _ = tx.rollback();
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                tracing::error!(op, detail = %detail, "panic inside transaction");
                Err(anyhow!("unexpected fault in {}", op))
            }
        }
    }
}

// ─── Row Mapping ────────────────────────────────────────────────────────────

const TEMPLATE_COLUMNS: &str =
    "id, org_id, name, repo_addr, status, compliance_enabled, last_scan_task_id, created_at";

const ENV_COLUMNS: &str = "id, org_id, template_id, name, status, compliance_enabled, ttl, \
     auto_destroy_at, auto_destroy_task_id, last_task_id, last_scan_task_id, last_res_task_id, \
     created_at";

const TASK_COLUMNS: &str = "id, org_id, template_id, env_id, task_type, status, runner_id, \
     container_id, step_timeout_secs, message, created_at, started_at, completed_at";

const RESULT_ROW_SELECT: &str = "
SELECT r.id, r.scan_task_id, r.policy_id, r.policy_group_id, r.status, r.message, r.severity,
       r.created_at, COALESCE(p.name, ''), COALESCE(g.name, ''), s.template_id, s.env_id,
       COALESCE(e.name, t.name, '')
FROM policy_results r
JOIN scan_tasks s ON s.id = r.scan_task_id
LEFT JOIN policies p ON p.id = r.policy_id
LEFT JOIN policy_groups g ON g.id = r.policy_group_id
LEFT JOIN environments e ON e.id = s.env_id
LEFT JOIN templates t ON t.id = s.template_id";

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|d| d.with_timezone(&Utc))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        parse_timestamp(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        repo_addr: row.get(3)?,
        status: enum_col(row, 4)?,
        compliance_enabled: row.get(5)?,
        last_scan_task_id: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

fn env_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: row.get(0)?,
        org_id: row.get(1)?,
        template_id: row.get(2)?,
        name: row.get(3)?,
        status: enum_col(row, 4)?,
        compliance_enabled: row.get(5)?,
        ttl: row.get(6)?,
        auto_destroy_at: opt_ts_col(row, 7)?,
        auto_destroy_task_id: row.get(8)?,
        last_task_id: row.get(9)?,
        last_scan_task_id: row.get(10)?,
        last_res_task_id: row.get(11)?,
        created_at: ts_col(row, 12)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        org_id: row.get(1)?,
        template_id: row.get(2)?,
        env_id: row.get(3)?,
        task_type: enum_col(row, 4)?,
        status: enum_col(row, 5)?,
        runner_id: row.get(6)?,
        container_id: row.get(7)?,
        step_timeout_secs: row.get(8)?,
        message: row.get(9)?,
        created_at: ts_col(row, 10)?,
        started_at: opt_ts_col(row, 11)?,
        completed_at: opt_ts_col(row, 12)?,
    })
}

fn scan_task_from_row(row: &Row<'_>) -> rusqlite::Result<ScanTask> {
    Ok(ScanTask {
        task: task_from_row(row)?,
        policy_status: enum_col(row, 13)?,
    })
}

fn result_row_from_row(row: &Row<'_>) -> rusqlite::Result<PolicyResultRow> {
    Ok(PolicyResultRow {
        result: PolicyResult {
            id: row.get(0)?,
            scan_task_id: row.get(1)?,
            policy_id: row.get(2)?,
            policy_group_id: row.get(3)?,
            status: enum_col(row, 4)?,
            message: row.get(5)?,
            severity: row.get(6)?,
            created_at: ts_col(row, 7)?,
        },
        policy_name: row.get(8)?,
        policy_group_name: row.get(9)?,
        template_id: row.get(10)?,
        env_id: row.get(11)?,
        target_name: row.get(12)?,
    })
}

// ─── Transaction Helpers ────────────────────────────────────────────────────

fn active_task_in(conn: &Connection, kind: TaskKind, target: &Target) -> Result<Option<Task>> {
    let (clause, id) = match target {
        Target::Environment(id) => ("env_id = ?1", id),
        Target::Template(id) => ("env_id IS NULL AND template_id = ?1", id),
    };
    let sql = format!(
        "SELECT {} FROM {} WHERE {} AND status IN ('pending', 'running') \
         AND task_type NOT IN ('env_parse', 'tpl_parse') ORDER BY created_at LIMIT 1",
        TASK_COLUMNS,
        kind.table(),
        clause
    );
    let task = conn
        .query_row(&sql, params![id], task_from_row)
        .optional()?;
    Ok(task)
}

fn insert_task_row(conn: &Connection, kind: TaskKind, task: &Task) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        kind.table(),
        TASK_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            task.id,
            task.org_id,
            task.template_id,
            task.env_id,
            task.task_type.as_str(),
            task.status.as_str(),
            task.runner_id,
            task.container_id,
            task.step_timeout_secs,
            task.message,
            timestamp(&task.created_at),
            task.started_at.as_ref().map(timestamp),
            task.completed_at.as_ref().map(timestamp),
        ],
    )
    .with_context(|| format!("Failed to insert task {}", task.id))?;
    Ok(())
}

fn persist_resources(conn: &Connection, task_id: &str, resources: &[TaskResource]) -> Result<()> {
    conn.execute(
        "DELETE FROM task_resources WHERE task_id = ?1",
        params![task_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO task_resources (id, task_id, address, module_path, resource_mode,
            resource_type, resource_name, provider, index_key, attributes_json, dependencies)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for r in resources {
        let deps = serde_json::to_string(&r.dependencies)?;
        stmt.execute(params![
            r.id,
            task_id,
            r.address,
            r.module_path,
            r.resource_mode,
            r.resource_type,
            r.resource_name,
            r.provider,
            r.index_key,
            r.attributes_json,
            deps,
        ])
        .with_context(|| format!("Failed to insert resource {}", r.address))?;
    }
    Ok(())
}

fn persist_outputs(conn: &Connection, task_id: &str, outputs: &[TaskOutput]) -> Result<()> {
    conn.execute("DELETE FROM task_outputs WHERE task_id = ?1", params![task_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO task_outputs (task_id, name, value_json, sensitive) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for o in outputs {
        stmt.execute(params![task_id, o.name, o.value_json, o.sensitive])
            .with_context(|| format!("Failed to insert output {}", o.name))?;
    }
    Ok(())
}

fn set_policy_status(conn: &Connection, scan_task_id: &str, status: PolicyStatus) -> Result<()> {
    let rows = conn.execute(
        "UPDATE scan_tasks SET policy_status = ?2 WHERE id = ?1",
        params![scan_task_id, status.as_str()],
    )?;
    if rows == 0 {
        bail!("scan task '{}' not found", scan_task_id);
    }
    Ok(())
}

#[async_trait]
impl StateBackend for SqliteBackend {
    // ─── Initialization ─────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        migration::check_and_migrate(&conn)
    }

    // ─── Templates & Environments ───────────────────────────────────────────

    async fn insert_template(&self, template: &Template) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO templates ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                TEMPLATE_COLUMNS
            ),
            params![
                template.id,
                template.org_id,
                template.name,
                template.repo_addr,
                template.status.as_str(),
                template.compliance_enabled,
                template.last_scan_task_id,
                timestamp(&template.created_at),
            ],
        )
        .with_context(|| format!("Failed to insert template {}", template.name))?;
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<Template>> {
        let conn = self.conn()?;
        let template = conn
            .query_row(
                &format!("SELECT {} FROM templates WHERE id = ?1", TEMPLATE_COLUMNS),
                params![id],
                template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    async fn insert_environment(&self, env: &Environment) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO environments ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                ENV_COLUMNS
            ),
            params![
                env.id,
                env.org_id,
                env.template_id,
                env.name,
                env.status.as_str(),
                env.compliance_enabled,
                env.ttl,
                env.auto_destroy_at.as_ref().map(timestamp),
                env.auto_destroy_task_id,
                env.last_task_id,
                env.last_scan_task_id,
                env.last_res_task_id,
                timestamp(&env.created_at),
            ],
        )
        .with_context(|| format!("Failed to insert environment {}", env.name))?;
        Ok(())
    }

    async fn get_environment(&self, id: &str) -> Result<Option<Environment>> {
        let conn = self.conn()?;
        let env = conn
            .query_row(
                &format!("SELECT {} FROM environments WHERE id = ?1", ENV_COLUMNS),
                params![id],
                env_from_row,
            )
            .optional()?;
        Ok(env)
    }

    async fn set_environment_status(
        &self,
        env_id: &str,
        status: EnvStatus,
        res_task_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE environments
             SET status = ?2, last_res_task_id = COALESCE(?3, last_res_task_id)
             WHERE id = ?1",
            params![env_id, status.as_str(), res_task_id],
        )?;
        if rows == 0 {
            bail!("environment '{}' not found", env_id);
        }
        Ok(())
    }

    async fn update_auto_destroy(&self, env_id: &str, update: &AutoDestroyUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.with_tx("update auto-destroy", |tx| {
            let exists: bool = tx
                .query_row(
                    "SELECT COUNT(*) FROM environments WHERE id = ?1",
                    params![env_id],
                    |row| row.get::<_, i64>(0),
                )
                .map(|c| c > 0)?;
            if !exists {
                bail!("environment '{}' not found", env_id);
            }
            if let Some(at) = &update.auto_destroy_at {
                tx.execute(
                    "UPDATE environments SET auto_destroy_at = ?2 WHERE id = ?1",
                    params![env_id, at.as_ref().map(timestamp)],
                )?;
            }
            if let Some(task_id) = &update.auto_destroy_task_id {
                tx.execute(
                    "UPDATE environments SET auto_destroy_task_id = ?2 WHERE id = ?1",
                    params![env_id, task_id],
                )?;
            }
            Ok(())
        })
    }

    async fn due_auto_destroys(&self, now: DateTime<Utc>) -> Result<Vec<Environment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM environments
             WHERE auto_destroy_at IS NOT NULL AND auto_destroy_at <= ?1
               AND auto_destroy_task_id IS NULL AND status = 'active'
             ORDER BY auto_destroy_at",
            ENV_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![timestamp(&now)], env_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<TaskInsert<Task>> {
        self.with_tx("create task", |tx| {
            if !task.task_type.is_parse() {
                if let Some(active) = active_task_in(tx, TaskKind::Execution, &task.target())? {
                    return Ok(TaskInsert::Conflict {
                        active_task_id: active.id,
                    });
                }
            }
            insert_task_row(tx, TaskKind::Execution, task)?;
            if let Some(env_id) = &task.env_id {
                tx.execute(
                    "UPDATE environments SET last_task_id = ?2 WHERE id = ?1",
                    params![env_id, task.id],
                )?;
            }
            Ok(TaskInsert::Created(task.clone()))
        })
    }

    async fn create_scan_task(&self, scan: &ScanTask) -> Result<TaskInsert<ScanTask>> {
        let task = &scan.task;
        self.with_tx("create scan task", |tx| {
            if !task.task_type.is_parse() {
                if let Some(active) = active_task_in(tx, TaskKind::Scan, &task.target())? {
                    return Ok(TaskInsert::Conflict {
                        active_task_id: active.id,
                    });
                }
            }
            insert_task_row(tx, TaskKind::Scan, task)?;
            set_policy_status(tx, &task.id, scan.policy_status)?;

            match (task.task_type, &task.env_id) {
                (TaskType::EnvScan, Some(env_id)) => {
                    tx.execute(
                        "UPDATE environments SET last_scan_task_id = ?2 WHERE id = ?1",
                        params![env_id, task.id],
                    )?;
                }
                (TaskType::TplScan, _) => {
                    tx.execute(
                        "UPDATE templates SET last_scan_task_id = ?2 WHERE id = ?1",
                        params![task.template_id, task.id],
                    )?;
                }
                _ => {}
            }
            Ok(TaskInsert::Created(scan.clone()))
        })
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    async fn get_scan_task(&self, id: &str) -> Result<Option<ScanTask>> {
        let conn = self.conn()?;
        let scan = conn
            .query_row(
                &format!(
                    "SELECT {}, policy_status FROM scan_tasks WHERE id = ?1",
                    TASK_COLUMNS
                ),
                params![id],
                scan_task_from_row,
            )
            .optional()?;
        Ok(scan)
    }

    async fn active_task(&self, kind: TaskKind, target: &Target) -> Result<Option<Task>> {
        let conn = self.conn()?;
        active_task_in(&conn, kind, target)
    }

    async fn start_task(
        &self,
        kind: TaskKind,
        task_id: &str,
        container_id: &str,
        at: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        self.with_tx("start task", |tx| {
            for table in [TaskKind::Execution.table(), TaskKind::Scan.table()] {
                let holder: Option<String> = tx
                    .query_row(
                        &format!(
                            "SELECT id FROM {} WHERE container_id = ?1 AND id != ?2 \
                             AND status IN ('pending', 'running') LIMIT 1",
                            table
                        ),
                        params![container_id, task_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(holder) = holder {
                    return Ok(StartOutcome::ContainerBusy { task_id: holder });
                }
            }

            let rows = tx.execute(
                &format!(
                    "UPDATE {} SET status = 'running', container_id = ?2, started_at = ?3 \
                     WHERE id = ?1 AND status = 'pending'",
                    kind.table()
                ),
                params![task_id, container_id, timestamp(&at)],
            )?;
            Ok(if rows == 0 {
                StartOutcome::NotPending
            } else {
                StartOutcome::Started
            })
        })
    }

    async fn finish_task(
        &self,
        kind: TaskKind,
        task_id: &str,
        status: TaskStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            bail!("'{}' is not a terminal status", status);
        }
        let conn = self.conn()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {} SET status = ?2, message = ?3, completed_at = ?4 \
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                kind.table()
            ),
            params![task_id, status.as_str(), message, timestamp(&at)],
        )?;
        Ok(rows > 0)
    }

    // ─── Ingested Results ───────────────────────────────────────────────────

    async fn replace_task_state(
        &self,
        task_id: &str,
        resources: &[TaskResource],
        outputs: &[TaskOutput],
    ) -> Result<()> {
        self.with_tx("persist task state", |tx| {
            persist_resources(tx, task_id, resources)?;
            persist_outputs(tx, task_id, outputs)?;
            Ok(())
        })
    }

    async fn list_task_resources(&self, task_id: &str) -> Result<Vec<TaskResource>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, address, module_path, resource_mode, resource_type,
                    resource_name, provider, index_key, attributes_json, dependencies
             FROM task_resources WHERE task_id = ?1 ORDER BY address",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(TaskResource {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    address: row.get(2)?,
                    module_path: row.get(3)?,
                    resource_mode: row.get(4)?,
                    resource_type: row.get(5)?,
                    resource_name: row.get(6)?,
                    provider: row.get(7)?,
                    index_key: row.get(8)?,
                    attributes_json: row.get(9)?,
                    dependencies: json_col(row, 10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn list_task_outputs(&self, task_id: &str) -> Result<Vec<TaskOutput>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, name, value_json, sensitive FROM task_outputs
             WHERE task_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(TaskOutput {
                    task_id: row.get(0)?,
                    name: row.get(1)?,
                    value_json: row.get(2)?,
                    sensitive: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn replace_task_changes(&self, task_id: &str, changes: &[TaskChange]) -> Result<()> {
        self.with_tx("persist plan changes", |tx| {
            tx.execute("DELETE FROM task_changes WHERE task_id = ?1", params![task_id])?;
            let mut stmt = tx.prepare(
                "INSERT INTO task_changes (task_id, address, resource_type, action,
                    before_json, after_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for c in changes {
                stmt.execute(params![
                    task_id,
                    c.address,
                    c.resource_type,
                    c.action,
                    c.before_json,
                    c.after_json,
                ])
                .with_context(|| format!("Failed to insert change {}", c.address))?;
            }
            Ok(())
        })
    }

    async fn list_task_changes(&self, task_id: &str) -> Result<Vec<TaskChange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, address, resource_type, action, before_json, after_json
             FROM task_changes WHERE task_id = ?1 ORDER BY address",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(TaskChange {
                    task_id: row.get(0)?,
                    address: row.get(1)?,
                    resource_type: row.get(2)?,
                    action: row.get(3)?,
                    before_json: row.get(4)?,
                    after_json: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Drift ──────────────────────────────────────────────────────────────

    async fn find_resource_id(&self, task_id: &str, address: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM task_resources WHERE task_id = ?1 AND address = ?2",
                params![task_id, address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    async fn list_drift(&self, res_task_id: &str) -> Result<Vec<ResourceDrift>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT res_task_id, address, resource_id, drift_json, detected_at
             FROM resource_drift WHERE res_task_id = ?1 ORDER BY address",
        )?;
        let rows = stmt
            .query_map(params![res_task_id], |row| {
                Ok(ResourceDrift {
                    res_task_id: row.get(0)?,
                    address: row.get(1)?,
                    resource_id: row.get(2)?,
                    drift_json: row.get(3)?,
                    detected_at: ts_col(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn apply_drift(
        &self,
        res_task_id: &str,
        remove: &[String],
        upsert: &[ResourceDrift],
    ) -> Result<()> {
        self.with_tx("reconcile drift", |tx| {
            {
                let mut delete = tx.prepare(
                    "DELETE FROM resource_drift WHERE res_task_id = ?1 AND address = ?2",
                )?;
                for address in remove {
                    delete.execute(params![res_task_id, address])?;
                }
            }
            let mut stmt = tx.prepare(
                "INSERT INTO resource_drift (res_task_id, address, resource_id, drift_json,
                    detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(res_task_id, address) DO UPDATE SET
                    resource_id = excluded.resource_id,
                    drift_json = excluded.drift_json,
                    detected_at = excluded.detected_at",
            )?;
            for d in upsert {
                stmt.execute(params![
                    res_task_id,
                    d.address,
                    d.resource_id,
                    d.drift_json,
                    timestamp(&d.detected_at),
                ])?;
            }
            Ok(())
        })
    }

    // ─── Policies ───────────────────────────────────────────────────────────

    async fn insert_policy_group(&self, group: &PolicyGroup) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO policy_groups (id, org_id, name) VALUES (?1, ?2, ?3)",
            params![group.id, group.org_id, group.name],
        )
        .with_context(|| format!("Failed to insert policy group {}", group.name))?;
        Ok(())
    }

    async fn insert_policy(&self, policy: &Policy) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO policies (id, group_id, name, severity, rule, fix_suggestion)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                policy.id,
                policy.group_id,
                policy.name,
                policy.severity,
                policy.rule,
                policy.fix_suggestion,
            ],
        )
        .with_context(|| format!("Failed to insert policy {}", policy.name))?;
        Ok(())
    }

    async fn bind_policy_group(
        &self,
        scope: Scope,
        target_id: &str,
        group_id: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO policy_bindings (scope, target_id, group_id) VALUES (?1, ?2, ?3)",
            params![scope.as_str(), target_id, group_id],
        )?;
        Ok(())
    }

    async fn suppress_policy(&self, policy_id: &str, target_id: &str, reason: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO policy_suppressions (policy_id, target_id, reason) VALUES (?1, ?2, ?3)
             ON CONFLICT(policy_id, target_id) DO UPDATE SET reason = excluded.reason",
            params![policy_id, target_id, reason],
        )?;
        Ok(())
    }

    async fn policies_for_scan(
        &self,
        template_id: &str,
        env_id: Option<&str>,
    ) -> Result<Vec<Policy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT p.id, p.group_id, p.name, p.severity, p.rule, p.fix_suggestion, g.name
             FROM policies p
             JOIN policy_groups g ON g.id = p.group_id
             JOIN policy_bindings b ON b.group_id = p.group_id
             WHERE (b.scope = 'template' AND b.target_id = ?1)
                OR (b.scope = 'environment' AND b.target_id = ?2)
             ORDER BY g.name, p.name",
        )?;
        let rows = stmt
            .query_map(params![template_id, env_id], |row| {
                Ok(Policy {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    name: row.get(2)?,
                    severity: row.get(3)?,
                    rule: row.get(4)?,
                    fix_suggestion: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn suppressed_policy_ids(&self, target_id: &str) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT policy_id FROM policy_suppressions WHERE target_id = ?1")?;
        let ids = stmt
            .query_map(params![target_id], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(ids)
    }

    async fn all_suppressions(&self) -> Result<HashSet<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT policy_id, target_id FROM policy_suppressions")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashSet<(String, String)>, _>>()?;
        Ok(pairs)
    }

    // ─── Policy Results ─────────────────────────────────────────────────────

    async fn store_scan_results(
        &self,
        scan_task_id: &str,
        results: &[PolicyResult],
        status: PolicyStatus,
    ) -> Result<()> {
        self.with_tx("store scan results", |tx| {
            tx.execute(
                "DELETE FROM policy_results WHERE scan_task_id = ?1",
                params![scan_task_id],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO policy_results (id, scan_task_id, policy_id, policy_group_id,
                        status, message, severity, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for r in results {
                    stmt.execute(params![
                        r.id,
                        scan_task_id,
                        r.policy_id,
                        r.policy_group_id,
                        r.status.as_str(),
                        r.message,
                        r.severity,
                        timestamp(&r.created_at),
                    ])
                    .with_context(|| format!("Failed to insert result for {}", r.policy_id))?;
                }
            }
            set_policy_status(tx, scan_task_id, status)
        })
    }

    async fn clear_scan_results(&self, scan_task_id: &str, status: PolicyStatus) -> Result<()> {
        self.with_tx("clear scan results", |tx| {
            tx.execute(
                "DELETE FROM policy_results WHERE scan_task_id = ?1",
                params![scan_task_id],
            )?;
            set_policy_status(tx, scan_task_id, status)
        })
    }

    async fn list_policy_results(&self, scan_task_id: &str) -> Result<Vec<PolicyResultRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE r.scan_task_id = ?1 ORDER BY g.name, p.name",
            RESULT_ROW_SELECT
        ))?;
        let rows = stmt
            .query_map(params![scan_task_id], result_row_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn policy_results_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        policy_id: Option<&str>,
    ) -> Result<Vec<PolicyResultRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE r.created_at >= ?1 AND r.created_at < ?2
                AND (?3 IS NULL OR r.policy_id = ?3)
             ORDER BY r.created_at, r.id",
            RESULT_ROW_SELECT
        ))?;
        let rows = stmt
            .query_map(
                params![timestamp(&from), timestamp(&to), policy_id],
                result_row_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
