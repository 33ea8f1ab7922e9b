use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::info;

use crate::errors::AppResult;

// Environment-keyed bot state and API usage counters, shared by every
// process pointed at the same file.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(path)?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;
        run_state_migrations(&connection)?;
        info!(target: "state_store", path = %path.display(), "state store ready");
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_state_migrations(&connection)?;
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock()
    }
}

fn run_state_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS bot_state (
            environment TEXT PRIMARY KEY,
            status TEXT NOT NULL CHECK (status IN ('stopped', 'running', 'no_api_credits', 'error')),
            paused INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_error_at TEXT,
            run_started_at TEXT,
            run_finished_at TEXT,
            updated_at TEXT NOT NULL,
            run_id TEXT
        );

        CREATE TABLE IF NOT EXISTS api_usage (
            environment TEXT NOT NULL,
            period TEXT NOT NULL CHECK (period IN ('day', 'month')),
            period_key TEXT NOT NULL,
            reserved INTEGER NOT NULL DEFAULT 0,
            reported INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (environment, period, period_key)
        );
        "#,
    )?;
    ensure_column(connection, "bot_state", "run_id", "TEXT")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, column: &str, decl: &str) -> AppResult<()> {
    let mut stmt = connection.prepare(&format!("PRAGMA table_info({table})"))?;
    let present = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .any(|name| name == column);
    drop(stmt);
    if !present {
        connection.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
        info!(target: "state_store", table, column, "state column added");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_parent_and_is_reopenable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let store = StateStore::open(&path).unwrap();
            store
                .lock()
                .execute(
                    "INSERT INTO bot_state (environment, status, updated_at) VALUES ('qa', 'stopped', 'now')",
                    [],
                )
                .unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let status: String = store
            .lock()
            .query_row("SELECT status FROM bot_state WHERE environment = 'qa'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "stopped");
    }

    #[test]
    fn upgrades_state_files_without_run_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE bot_state (
                    environment TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    paused INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    last_error_at TEXT,
                    run_started_at TEXT,
                    run_finished_at TEXT,
                    updated_at TEXT NOT NULL
                );
                INSERT INTO bot_state (environment, status, updated_at) VALUES ('qa', 'running', 'now');",
            )
            .unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let run_id: Option<String> = store
            .lock()
            .query_row("SELECT run_id FROM bot_state WHERE environment = 'qa'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(run_id, None);
        StateStore::open(&path).unwrap();
    }
}
