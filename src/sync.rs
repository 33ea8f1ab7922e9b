use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AssignmentSettings;
use crate::db::{fingerprint, now_timestamp, ACTIVE_COURT_STATUS};
use crate::errors::{AppError, AppResult};
use crate::geocode::{GeocodeOutcome, GeocodedLocation, GeocodingService};
use crate::tenants::TenantConnection;
use crate::usage::UsageTracker;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub geocoded: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub quota_exhausted: bool,
    pub deactivated: usize,
    pub restored: usize,
    pub orphaned: usize,
}

#[derive(Debug)]
struct CourtRow {
    id: i64,
    address: String,
    city: String,
    stored_hash: Option<String>,
}

impl CourtRow {
    fn data_hash(&self) -> String {
        fingerprint(&[&self.id.to_string(), self.address.trim(), self.city.trim()])
    }

    fn query_address(&self, country: &str) -> String {
        [self.address.trim(), self.city.trim(), country.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct CourtSynchronizer<'a> {
    geocoding: &'a GeocodingService,
    usage: &'a UsageTracker,
    settings: &'a AssignmentSettings,
}

impl<'a> CourtSynchronizer<'a> {
    pub fn new(
        geocoding: &'a GeocodingService,
        usage: &'a UsageTracker,
        settings: &'a AssignmentSettings,
    ) -> Self {
        Self {
            geocoding,
            usage,
            settings,
        }
    }

    pub async fn sync(&self, tenant: &TenantConnection) -> AppResult<SyncReport> {
        let courts = {
            let conn = tenant.lock();
            load_active_courts(&conn)?
        };
        let mut report = SyncReport::default();
        let mut consecutive_unreachable = 0_u32;
        let mut provider_down: Option<String> = None;

        for court in courts {
            let data_hash = court.data_hash();
            if court.stored_hash.as_deref() == Some(data_hash.as_str()) {
                report.skipped += 1;
                continue;
            }
            if court.address.trim().is_empty() {
                debug!(
                    target: "court_sync",
                    tenant = tenant.tenant_id(),
                    court_id = court.id,
                    "court has no address"
                );
                report.failed += 1;
                continue;
            }

            let query = court.query_address(&self.settings.country);
            match self.geocoding.geocode_within_quota(&query, self.usage).await? {
                GeocodeOutcome::Found(location) => {
                    consecutive_unreachable = 0;
                    {
                        let conn = tenant.lock();
                        upsert_coordinate(&conn, court.id, &location, &data_hash)?;
                    }
                    if court.stored_hash.is_some() {
                        report.refreshed += 1;
                    } else {
                        report.geocoded += 1;
                    }
                }
                GeocodeOutcome::QuotaDenied => {
                    report.quota_exhausted = true;
                    info!(
                        target: "court_sync",
                        tenant = tenant.tenant_id(),
                        "quota exhausted; stopping court geocoding"
                    );
                    break;
                }
                GeocodeOutcome::NotFound | GeocodeOutcome::Rejected(_) => {
                    consecutive_unreachable = 0;
                    report.failed += 1;
                    warn!(
                        target: "court_sync",
                        tenant = tenant.tenant_id(),
                        court_id = court.id,
                        address = %query,
                        "court address could not be geocoded"
                    );
                }
                GeocodeOutcome::Unreachable(message) => {
                    report.failed += 1;
                    consecutive_unreachable += 1;
                    if consecutive_unreachable >= self.settings.provider_failure_threshold.max(1) {
                        provider_down = Some(message);
                        break;
                    }
                }
            }
        }

        {
            let conn = tenant.lock();
            reconcile_soft_deletes(&conn, &mut report)?;
        }
        info!(
            target: "court_sync",
            tenant = tenant.tenant_id(),
            geocoded = report.geocoded,
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            quota_exhausted = report.quota_exhausted,
            "court sync finished"
        );

        match provider_down {
            Some(message) => Err(AppError::ProviderUnavailable(format!(
                "{consecutive_unreachable} consecutive failures syncing courts of {}: {message}",
                tenant.tenant_id()
            ))),
            None => Ok(report),
        }
    }
}

fn load_active_courts(conn: &Connection) -> AppResult<Vec<CourtRow>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, COALESCE(c.address, ''), COALESCE(c.city, ''), cc.data_hash
         FROM data_courts c
         LEFT JOIN court_coordinates cc ON cc.court_id = c.id
         WHERE c.status = ?1 AND c.deleted_at IS NULL
         ORDER BY c.id",
    )?;
    let rows = stmt
        .query_map([ACTIVE_COURT_STATUS], |row| {
            Ok(CourtRow {
                id: row.get(0)?,
                address: row.get(1)?,
                city: row.get(2)?,
                stored_hash: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn upsert_coordinate(
    conn: &Connection,
    court_id: i64,
    location: &GeocodedLocation,
    data_hash: &str,
) -> AppResult<()> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO court_coordinates
            (court_id, latitude, longitude, geocoded_address, data_hash, created_at, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL)
         ON CONFLICT(court_id) DO UPDATE SET
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            geocoded_address = excluded.geocoded_address,
            data_hash = excluded.data_hash,
            updated_at = excluded.updated_at,
            deleted_at = NULL",
        params![
            court_id,
            location.latitude,
            location.longitude,
            location.formatted_address,
            data_hash,
            now
        ],
    )?;
    Ok(())
}

fn reconcile_soft_deletes(conn: &Connection, report: &mut SyncReport) -> AppResult<()> {
    let now = now_timestamp();
    report.deactivated = conn.execute(
        "UPDATE court_coordinates SET deleted_at = ?1, updated_at = ?1
         WHERE deleted_at IS NULL
           AND court_id IN (SELECT id FROM data_courts WHERE deleted_at IS NOT NULL)",
        [&now],
    )?;
    report.restored = conn.execute(
        "UPDATE court_coordinates SET deleted_at = NULL, updated_at = ?1
         WHERE deleted_at IS NOT NULL
           AND court_id IN (SELECT id FROM data_courts WHERE deleted_at IS NULL)",
        [&now],
    )?;
    report.orphaned = conn.execute(
        "UPDATE court_coordinates SET deleted_at = ?1, updated_at = ?1
         WHERE deleted_at IS NULL
           AND court_id NOT IN (SELECT id FROM data_courts)",
        [&now],
    )?;
    Ok(())
}
