use std::path::PathBuf;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db;
use crate::errors::AppResult;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantDatabase {
    pub id: String,
    pub path: PathBuf,
}

/// A connection scoped to a single tenant pass. Dropping it closes the
/// underlying SQLite handle, on success and error paths alike.
pub struct TenantConnection {
    tenant_id: String,
    db: Mutex<Connection>,
}

impl TenantConnection {
    pub fn open(tenant: &TenantDatabase) -> AppResult<Self> {
        let connection = db::open_tenant(&tenant.id, &tenant.path)?;
        db::verify_upstream_schema(&connection, &tenant.id)?;
        db::run_tenant_migrations(&connection, &tenant.id)?;
        debug!(
            target: "tenant_db",
            tenant = %tenant.id,
            path = %tenant.path.display(),
            "tenant connection opened"
        );
        Ok(Self {
            tenant_id: tenant.id.clone(),
            db: Mutex::new(connection),
        })
    }

    // For reporting: checks the upstream schema, never migrates or writes.
    pub fn open_read_only(tenant: &TenantDatabase) -> AppResult<Self> {
        let connection = db::open_tenant_read_only(&tenant.id, &tenant.path)?;
        db::verify_upstream_schema(&connection, &tenant.id)?;
        Ok(Self {
            tenant_id: tenant.id.clone(),
            db: Mutex::new(connection),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    // Never hold the guard across an await.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock()
    }
}

impl Drop for TenantConnection {
    fn drop(&mut self) {
        debug!(target: "tenant_db", tenant = %self.tenant_id, "tenant connection released");
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionCheck {
    pub tenant: String,
    pub status: ConnectionStatus,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Ok,
    Error,
}

pub fn test_connections(tenants: &[TenantDatabase]) -> Vec<ConnectionCheck> {
    tenants
        .iter()
        .map(|tenant| match check_tenant(tenant) {
            Ok(()) => ConnectionCheck {
                tenant: tenant.id.clone(),
                status: ConnectionStatus::Ok,
                message: "connection ok".to_string(),
            },
            Err(err) => {
                warn!(target: "tenant_db", tenant = %tenant.id, error = %err, "tenant connection check failed");
                ConnectionCheck {
                    tenant: tenant.id.clone(),
                    status: ConnectionStatus::Error,
                    message: err.to_string(),
                }
            }
        })
        .collect()
}

fn check_tenant(tenant: &TenantDatabase) -> AppResult<()> {
    let connection = db::open_tenant(&tenant.id, &tenant.path)?;
    connection.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    db::verify_upstream_schema(&connection, &tenant.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::create_tenant_db;
    use tempfile::tempdir;

    #[test]
    fn reports_each_tenant_independently() {
        let dir = tempdir().unwrap();
        let good = TenantDatabase {
            id: "good".into(),
            path: create_tenant_db(dir.path(), "good.db"),
        };
        let missing = TenantDatabase {
            id: "missing".into(),
            path: dir.path().join("missing.db"),
        };

        let checks = test_connections(&[good, missing]);
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].status, ConnectionStatus::Ok);
        assert_eq!(checks[1].status, ConnectionStatus::Error);
        assert_eq!(checks[1].tenant, "missing");
    }

    #[test]
    fn open_prepares_owned_tables() {
        let dir = tempdir().unwrap();
        let tenant = TenantDatabase {
            id: "t".into(),
            path: create_tenant_db(dir.path(), "t.db"),
        };
        let connection = TenantConnection::open(&tenant).unwrap();
        let count: i64 = connection
            .lock()
            .query_row("SELECT COUNT(*) FROM court_coordinates", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(connection.tenant_id(), "t");
    }

    #[test]
    fn read_only_open_leaves_schema_untouched() {
        let dir = tempdir().unwrap();
        let tenant = TenantDatabase {
            id: "ro".into(),
            path: create_tenant_db(dir.path(), "ro.db"),
        };
        let connection = TenantConnection::open_read_only(&tenant).unwrap();
        {
            let conn = connection.lock();
            assert!(!db::engine_tables_ready(&conn).unwrap());
            assert!(conn
                .execute("CREATE TABLE scratch (id INTEGER)", [])
                .is_err());
        }

        let empty = TenantDatabase {
            id: "empty".into(),
            path: dir.path().join("empty.db"),
        };
        rusqlite::Connection::open(&empty.path).unwrap();
        assert!(matches!(
            TenantConnection::open_read_only(&empty),
            Err(crate::errors::AppError::TenantSchema { .. })
        ));
    }
}
