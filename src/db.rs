use std::path::Path;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub const UPSTREAM_TABLES: &[&str] = &["data_courts", "lawsuits", "clients", "client_addresses"];

pub const ACTIVE_COURT_STATUS: &str = "Activo";
pub const PENDING_LAWSUIT_STATUS: &str = "Pendiente";

// A missing file is a connectivity failure, never an implicit create.
pub fn open_tenant(tenant_id: &str, path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection =
        Connection::open_with_flags(path, flags).map_err(|err| AppError::TenantConnectivity {
            tenant: tenant_id.to_string(),
            message: err.to_string(),
        })?;
    connection
        .execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|err| AppError::TenantConnectivity {
            tenant: tenant_id.to_string(),
            message: err.to_string(),
        })?;
    Ok(connection)
}

pub fn open_tenant_read_only(tenant_id: &str, path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection = Connection::open_with_flags(path, flags)
        .and_then(|connection| {
            connection.busy_timeout(std::time::Duration::from_secs(5))?;
            Ok(connection)
        })
        .map_err(|err| AppError::TenantConnectivity {
            tenant: tenant_id.to_string(),
            message: err.to_string(),
        })?;
    Ok(connection)
}

pub fn verify_upstream_schema(connection: &Connection, tenant_id: &str) -> AppResult<()> {
    for table in UPSTREAM_TABLES {
        if !table_exists(connection, table)? {
            return Err(AppError::TenantSchema {
                tenant: tenant_id.to_string(),
                table: (*table).to_string(),
            });
        }
    }
    Ok(())
}

pub fn run_tenant_migrations(connection: &Connection, tenant_id: &str) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS court_coordinates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            court_id INTEGER NOT NULL UNIQUE,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            geocoded_address TEXT NOT NULL,
            data_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS lawsuit_court_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            lawsuit_id INTEGER NOT NULL UNIQUE,
            client_id INTEGER NOT NULL,
            client_identification TEXT,
            client_address TEXT NOT NULL,
            client_city TEXT,
            client_latitude REAL,
            client_longitude REAL,
            court_id INTEGER,
            court_name TEXT,
            cuantia_type TEXT,
            distance_km REAL,
            outcome TEXT NOT NULL CHECK (
                outcome IN ('assigned', 'no_address', 'no_court', 'geocode_failed', 'wrong_city')
            ),
            data_hash TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_assignments_outcome ON lawsuit_court_assignments(outcome);
        CREATE INDEX IF NOT EXISTS idx_assignments_court ON lawsuit_court_assignments(court_id);
        "#,
    )?;
    info!(
        target: "tenant_db",
        tenant = tenant_id,
        "tenant tables ready"
    );
    Ok(())
}

// False until the first run has created the engine's own tables.
pub fn engine_tables_ready(connection: &Connection) -> AppResult<bool> {
    Ok(table_exists(connection, "court_coordinates")?
        && table_exists(connection, "lawsuit_court_assignments")?)
}

fn table_exists(connection: &Connection, table: &str) -> AppResult<bool> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    STANDARD_NO_PAD.encode(hasher.finalize())
}
