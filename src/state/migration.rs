use anyhow::Result;
use rusqlite::Connection;

use super::schema;
use super::sqlite::timestamp;

/// Bring a SQLite database up to the current schema version.
pub fn check_and_migrate(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false);

    if !table_exists {
        // Fresh database
        apply_migrations(conn, 0)?;
        return Ok(());
    }

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < schema::SCHEMA_VERSION {
        apply_migrations(conn, current_version)?;
    }

    Ok(())
}

fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    let now = timestamp(&chrono::Utc::now());

    if from_version < 1 {
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![1, now, "Task, scan and compliance schema"],
        )?;
    }

    Ok(())
}
