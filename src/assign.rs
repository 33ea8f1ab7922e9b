use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cities::{fold, CityNormalizer};
use crate::config::{AssignmentSettings, ReassignPolicy};
use crate::db::{fingerprint, now_timestamp, ACTIVE_COURT_STATUS, PENDING_LAWSUIT_STATUS};
use crate::errors::{AppError, AppResult};
use crate::geocode::{GeocodeOutcome, GeocodingService};
use crate::tenants::TenantConnection;
use crate::usage::UsageTracker;

pub const NO_ADDRESS_SENTINEL: &str = "Sin dirección";
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct AssignmentReport {
    pub processed: usize,
    pub assigned: usize,
    pub no_address: usize,
    pub errors: usize,
    pub no_court: usize,
    pub geocode_failed: usize,
    pub wrong_city: usize,
    pub skipped: usize,
    pub reused_coordinates: usize,
    pub quota_exhausted: bool,
    pub court_names_refreshed: usize,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Assigned,
    NoAddress,
    NoCourt,
    GeocodeFailed,
    WrongCity,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Assigned => "assigned",
            Outcome::NoAddress => "no_address",
            Outcome::NoCourt => "no_court",
            Outcome::GeocodeFailed => "geocode_failed",
            Outcome::WrongCity => "wrong_city",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "assigned" => Some(Outcome::Assigned),
            "no_address" => Some(Outcome::NoAddress),
            "no_court" => Some(Outcome::NoCourt),
            "geocode_failed" => Some(Outcome::GeocodeFailed),
            "wrong_city" => Some(Outcome::WrongCity),
            _ => None,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Outcome::NoCourt | Outcome::GeocodeFailed | Outcome::WrongCity
        )
    }
}

#[derive(Debug)]
struct PendingLawsuit {
    id: i64,
    client_id: i64,
    identification: Option<String>,
    cuantia: String,
    address: Option<String>,
    neighborhood: Option<String>,
    city: Option<String>,
    department: Option<String>,
}

impl PendingLawsuit {
    fn data_hash(&self) -> String {
        fingerprint(&[
            &self.id.to_string(),
            trimmed(&self.address),
            trimmed(&self.neighborhood),
            trimmed(&self.city),
            trimmed(&self.department),
            self.cuantia.trim(),
        ])
    }

    fn usable_address(&self) -> Option<(&str, &str)> {
        let address = self.address.as_deref().map(str::trim).filter(|a| !a.is_empty())?;
        let city = self.city.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
        if fold(address) == fold(NO_ADDRESS_SENTINEL) {
            return None;
        }
        Some((address, city))
    }

    fn query_address(&self, country: &str) -> String {
        [
            trimmed(&self.address),
            trimmed(&self.neighborhood),
            trimmed(&self.city),
            trimmed(&self.department),
            country.trim(),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
    }
}

fn trimmed(value: &Option<String>) -> &str {
    value.as_deref().map(str::trim).unwrap_or("")
}

#[derive(Debug)]
struct ExistingAssignment {
    outcome: Option<Outcome>,
    data_hash: String,
    court_id: Option<i64>,
    client_coordinates: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
struct CandidateCourt {
    id: i64,
    name: String,
    cuantia: String,
    city_key: String,
    cuantia_key: String,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug)]
struct Resolution {
    outcome: Outcome,
    client_address: String,
    client_coordinates: Option<(f64, f64)>,
    court: Option<(i64, String, String, f64)>,
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

pub struct AssignmentResolver<'a> {
    geocoding: &'a GeocodingService,
    usage: &'a UsageTracker,
    cities: &'a CityNormalizer,
    settings: &'a AssignmentSettings,
}

impl<'a> AssignmentResolver<'a> {
    pub fn new(
        geocoding: &'a GeocodingService,
        usage: &'a UsageTracker,
        cities: &'a CityNormalizer,
        settings: &'a AssignmentSettings,
    ) -> Self {
        Self {
            geocoding,
            usage,
            cities,
            settings,
        }
    }

    pub async fn assign(
        &self,
        tenant: &TenantConnection,
        limit: Option<usize>,
    ) -> AppResult<AssignmentReport> {
        let mut report = AssignmentReport::default();
        let (lawsuits, mut existing, courts) = {
            let conn = tenant.lock();
            report.court_names_refreshed = refresh_court_names(&conn)?;
            (
                load_pending_lawsuits(&conn)?,
                load_existing(&conn)?,
                load_candidate_courts(&conn, self.cities)?,
            )
        };
        let live_courts: HashSet<i64> = courts.iter().map(|court| court.id).collect();
        let mut consecutive_unreachable = 0_u32;

        for lawsuit in lawsuits {
            let data_hash = lawsuit.data_hash();
            let previous = existing.remove(&lawsuit.id);
            if !self.needs_resolution(previous.as_ref(), &data_hash, &live_courts) {
                report.skipped += 1;
                continue;
            }
            if limit.is_some_and(|limit| report.processed >= limit) {
                break;
            }

            let resolution = match lawsuit.usable_address() {
                None => Resolution {
                    outcome: Outcome::NoAddress,
                    client_address: NO_ADDRESS_SENTINEL.to_string(),
                    client_coordinates: None,
                    court: None,
                },
                Some((address, city)) => {
                    let cached = previous
                        .as_ref()
                        .filter(|row| row.data_hash == data_hash)
                        .and_then(|row| row.client_coordinates);
                    let coordinates = match cached {
                        Some(point) => {
                            report.reused_coordinates += 1;
                            Ok(point)
                        }
                        None => {
                            let query = lawsuit.query_address(&self.settings.country);
                            match self.geocoding.geocode_within_quota(&query, self.usage).await? {
                                GeocodeOutcome::Found(location) => {
                                    consecutive_unreachable = 0;
                                    match location.locality.as_deref() {
                                        Some(locality) if !self.cities.same_city(locality, city) => {
                                            debug!(
                                                target: "court_assignment",
                                                tenant = tenant.tenant_id(),
                                                lawsuit_id = lawsuit.id,
                                                locality,
                                                city,
                                                "geocoded locality does not match client city"
                                            );
                                            Err(Outcome::WrongCity)
                                        }
                                        _ => Ok((location.latitude, location.longitude)),
                                    }
                                }
                                GeocodeOutcome::QuotaDenied => {
                                    report.quota_exhausted = true;
                                    info!(
                                        target: "court_assignment",
                                        tenant = tenant.tenant_id(),
                                        "quota exhausted; stopping assignment"
                                    );
                                    break;
                                }
                                GeocodeOutcome::NotFound | GeocodeOutcome::Rejected(_) => {
                                    consecutive_unreachable = 0;
                                    Err(Outcome::GeocodeFailed)
                                }
                                GeocodeOutcome::Unreachable(message) => {
                                    consecutive_unreachable += 1;
                                    if consecutive_unreachable
                                        >= self.settings.provider_failure_threshold.max(1)
                                    {
                                        return Err(AppError::ProviderUnavailable(format!(
                                            "{consecutive_unreachable} consecutive failures geocoding clients of {}: {message}",
                                            tenant.tenant_id()
                                        )));
                                    }
                                    Err(Outcome::GeocodeFailed)
                                }
                            }
                        }
                    };
                    match coordinates {
                        Ok(point) => self.resolve_court(point, city, &lawsuit.cuantia, &courts, address),
                        Err(outcome) => Resolution {
                            outcome,
                            client_address: address.to_string(),
                            client_coordinates: None,
                            court: None,
                        },
                    }
                }
            };

            {
                let conn = tenant.lock();
                upsert_assignment(&conn, &lawsuit, &resolution, &data_hash)?;
            }
            report.processed += 1;
            match resolution.outcome {
                Outcome::Assigned => report.assigned += 1,
                Outcome::NoAddress => report.no_address += 1,
                Outcome::NoCourt => report.no_court += 1,
                Outcome::GeocodeFailed => report.geocode_failed += 1,
                Outcome::WrongCity => report.wrong_city += 1,
            }
            if resolution.outcome.is_error() {
                report.errors += 1;
                warn!(
                    target: "court_assignment",
                    tenant = tenant.tenant_id(),
                    lawsuit_id = lawsuit.id,
                    outcome = resolution.outcome.as_str(),
                    "lawsuit left without court"
                );
            }
        }

        info!(
            target: "court_assignment",
            tenant = tenant.tenant_id(),
            processed = report.processed,
            assigned = report.assigned,
            no_address = report.no_address,
            errors = report.errors,
            skipped = report.skipped,
            "assignment pass finished"
        );
        Ok(report)
    }

    fn needs_resolution(
        &self,
        previous: Option<&ExistingAssignment>,
        data_hash: &str,
        live_courts: &HashSet<i64>,
    ) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        let assigned = previous.outcome == Some(Outcome::Assigned);
        match self.settings.reassign_policy {
            ReassignPolicy::Always => true,
            ReassignPolicy::UnassignedOnly => !assigned,
            ReassignPolicy::OnChange => {
                if previous.data_hash != data_hash {
                    return true;
                }
                match previous.outcome {
                    Some(Outcome::Assigned) => previous
                        .court_id
                        .map(|court_id| !live_courts.contains(&court_id))
                        .unwrap_or(true),
                    Some(Outcome::NoCourt) | Some(Outcome::GeocodeFailed) | None => true,
                    Some(Outcome::NoAddress) | Some(Outcome::WrongCity) => false,
                }
            }
        }
    }

    fn resolve_court(
        &self,
        (latitude, longitude): (f64, f64),
        city: &str,
        cuantia: &str,
        courts: &[CandidateCourt],
        address: &str,
    ) -> Resolution {
        let city_key = self.cities.normalize(city);
        let cuantia_key = fold(cuantia);
        let in_city: Vec<&CandidateCourt> = courts
            .iter()
            .filter(|court| court.city_key == city_key)
            .collect();
        let tiered: Vec<&CandidateCourt> = in_city
            .iter()
            .copied()
            .filter(|court| court.cuantia_key == cuantia_key)
            .collect();
        let candidates = if tiered.is_empty() { in_city } else { tiered };

        let nearest = candidates
            .into_iter()
            .map(|court| {
                let distance = haversine_km(latitude, longitude, court.latitude, court.longitude);
                (court, distance)
            })
            .min_by(|(a, da), (b, db)| da.total_cmp(db).then(a.id.cmp(&b.id)));

        match nearest {
            Some((court, distance)) => Resolution {
                outcome: Outcome::Assigned,
                client_address: address.to_string(),
                client_coordinates: Some((latitude, longitude)),
                court: Some((
                    court.id,
                    court.name.clone(),
                    court.cuantia.clone(),
                    (distance * 1000.0).round() / 1000.0,
                )),
            },
            None => Resolution {
                outcome: Outcome::NoCourt,
                client_address: address.to_string(),
                client_coordinates: Some((latitude, longitude)),
                court: None,
            },
        }
    }
}

fn refresh_court_names(conn: &Connection) -> AppResult<usize> {
    let refreshed = conn.execute(
        "UPDATE lawsuit_court_assignments
         SET court_name = (SELECT d.name FROM data_courts d WHERE d.id = lawsuit_court_assignments.court_id),
             updated_at = ?1
         WHERE court_id IS NOT NULL
           AND EXISTS (
               SELECT 1 FROM data_courts d
               WHERE d.id = lawsuit_court_assignments.court_id
                 AND d.name IS NOT lawsuit_court_assignments.court_name
           )",
        [now_timestamp()],
    )?;
    Ok(refreshed)
}

fn load_pending_lawsuits(conn: &Connection) -> AppResult<Vec<PendingLawsuit>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.client_id, cl.identification, COALESCE(l.cuantia_type, ''),
                a.address, a.neighborhood, a.city, a.department
         FROM lawsuits l
         LEFT JOIN clients cl ON cl.id = l.client_id AND cl.deleted_at IS NULL
         LEFT JOIN client_addresses a ON a.id = (
             SELECT MIN(ca.id) FROM client_addresses ca
             WHERE ca.client_id = l.client_id AND ca.is_active = 1 AND ca.deleted_at IS NULL
         )
         WHERE l.lawsuit_status = ?1 AND l.deleted_at IS NULL
         ORDER BY l.id",
    )?;
    let rows = stmt
        .query_map([PENDING_LAWSUIT_STATUS], |row| {
            Ok(PendingLawsuit {
                id: row.get(0)?,
                client_id: row.get(1)?,
                identification: row.get(2)?,
                cuantia: row.get(3)?,
                address: row.get(4)?,
                neighborhood: row.get(5)?,
                city: row.get(6)?,
                department: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_existing(conn: &Connection) -> AppResult<HashMap<i64, ExistingAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT lawsuit_id, outcome, data_hash, court_id, client_latitude, client_longitude
         FROM lawsuit_court_assignments",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let outcome: String = row.get(1)?;
            let latitude: Option<f64> = row.get(4)?;
            let longitude: Option<f64> = row.get(5)?;
            Ok((
                row.get::<_, i64>(0)?,
                ExistingAssignment {
                    outcome: Outcome::parse(&outcome),
                    data_hash: row.get(2)?,
                    court_id: row.get(3)?,
                    client_coordinates: latitude.zip(longitude),
                },
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

fn load_candidate_courts(
    conn: &Connection,
    cities: &CityNormalizer,
) -> AppResult<Vec<CandidateCourt>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, COALESCE(c.city, ''), COALESCE(c.cuantia_type, ''), cc.latitude, cc.longitude
         FROM data_courts c
         JOIN court_coordinates cc ON cc.court_id = c.id AND cc.deleted_at IS NULL
         WHERE c.status = ?1 AND c.deleted_at IS NULL
         ORDER BY c.id",
    )?;
    let rows = stmt
        .query_map([ACTIVE_COURT_STATUS], |row| {
            let city: String = row.get(2)?;
            let cuantia: String = row.get(3)?;
            Ok(CandidateCourt {
                id: row.get(0)?,
                name: row.get(1)?,
                city_key: cities.normalize(&city),
                cuantia_key: fold(&cuantia),
                cuantia,
                latitude: row.get(4)?,
                longitude: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// Idempotent: an unchanged resolution leaves the row untouched, and
// `assigned_at` only moves when the court changes.
fn upsert_assignment(
    conn: &Connection,
    lawsuit: &PendingLawsuit,
    resolution: &Resolution,
    data_hash: &str,
) -> AppResult<()> {
    let now = now_timestamp();
    let (court_id, court_name, court_cuantia, distance) = match &resolution.court {
        Some((id, name, cuantia, distance)) => (
            Some(*id),
            Some(name.as_str()),
            Some(cuantia.as_str()),
            Some(*distance),
        ),
        None => (None, None, None, None),
    };
    let cuantia = court_cuantia.unwrap_or(lawsuit.cuantia.as_str());
    let (client_latitude, client_longitude) = resolution.client_coordinates.unzip();
    conn.execute(
        "INSERT INTO lawsuit_court_assignments
            (lawsuit_id, client_id, client_identification, client_address, client_city,
             client_latitude, client_longitude, court_id, court_name, cuantia_type,
             distance_km, outcome, data_hash, assigned_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
         ON CONFLICT(lawsuit_id) DO UPDATE SET
            client_id = excluded.client_id,
            client_identification = excluded.client_identification,
            client_address = excluded.client_address,
            client_city = excluded.client_city,
            client_latitude = excluded.client_latitude,
            client_longitude = excluded.client_longitude,
            court_id = excluded.court_id,
            court_name = excluded.court_name,
            cuantia_type = excluded.cuantia_type,
            distance_km = excluded.distance_km,
            outcome = excluded.outcome,
            data_hash = excluded.data_hash,
            assigned_at = CASE
                WHEN lawsuit_court_assignments.court_id IS excluded.court_id
                THEN lawsuit_court_assignments.assigned_at
                ELSE excluded.assigned_at
            END,
            updated_at = excluded.updated_at
         WHERE lawsuit_court_assignments.client_id IS NOT excluded.client_id
            OR lawsuit_court_assignments.client_identification IS NOT excluded.client_identification
            OR lawsuit_court_assignments.client_address IS NOT excluded.client_address
            OR lawsuit_court_assignments.client_city IS NOT excluded.client_city
            OR lawsuit_court_assignments.client_latitude IS NOT excluded.client_latitude
            OR lawsuit_court_assignments.client_longitude IS NOT excluded.client_longitude
            OR lawsuit_court_assignments.court_id IS NOT excluded.court_id
            OR lawsuit_court_assignments.court_name IS NOT excluded.court_name
            OR lawsuit_court_assignments.cuantia_type IS NOT excluded.cuantia_type
            OR lawsuit_court_assignments.distance_km IS NOT excluded.distance_km
            OR lawsuit_court_assignments.outcome IS NOT excluded.outcome
            OR lawsuit_court_assignments.data_hash IS NOT excluded.data_hash",
        params![
            lawsuit.id,
            lawsuit.client_id,
            lawsuit.identification,
            resolution.client_address,
            lawsuit.city.as_deref().map(str::trim),
            client_latitude,
            client_longitude,
            court_id,
            court_name,
            cuantia,
            distance,
            resolution.outcome.as_str(),
            data_hash,
            now,
        ],
    )?;
    Ok(())
}
