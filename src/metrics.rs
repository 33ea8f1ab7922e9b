use std::cmp;

use rusqlite::{Connection, Row};
use serde::Serialize;

use crate::db::{engine_tables_ready, ACTIVE_COURT_STATUS};
use crate::errors::AppResult;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct TenantStats {
    pub processed: usize,
    pub assigned: usize,
    pub no_address: usize,
    pub errors: usize,
    pub courts_geocoded: usize,
    pub active_courts: usize,
    pub percentage_assigned: f64,
}

impl TenantStats {
    fn accumulate(&mut self, other: &TenantStats) {
        self.processed += other.processed;
        self.assigned += other.assigned;
        self.no_address += other.no_address;
        self.errors += other.errors;
        self.courts_geocoded += other.courts_geocoded;
        self.active_courts += other.active_courts;
        self.percentage_assigned = percentage(self.assigned, self.processed);
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct TenantStatsEntry {
    pub tenant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<TenantStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct StatsReport {
    pub environment: String,
    pub tenants: Vec<TenantStatsEntry>,
    pub totals: TenantStats,
}

impl StatsReport {
    // Totals only cover tenants that could be read.
    pub fn from_entries(environment: &str, tenants: Vec<TenantStatsEntry>) -> Self {
        let mut totals = TenantStats::default();
        for stats in tenants.iter().filter_map(|entry| entry.stats.as_ref()) {
            totals.accumulate(stats);
        }
        Self {
            environment: environment.to_string(),
            tenants,
            totals,
        }
    }
}

pub fn tenant_stats(conn: &Connection) -> AppResult<TenantStats> {
    let active_courts: i64 = conn.query_row(
        "SELECT COUNT(*) FROM data_courts WHERE status = ?1 AND deleted_at IS NULL",
        [ACTIVE_COURT_STATUS],
        |row| row.get(0),
    )?;
    if !engine_tables_ready(conn)? {
        return Ok(TenantStats {
            active_courts: active_courts as usize,
            ..TenantStats::default()
        });
    }

    let (processed, assigned, no_address, errors) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(outcome = 'assigned'), 0),
                COALESCE(SUM(outcome = 'no_address'), 0),
                COALESCE(SUM(outcome IN ('no_court', 'geocode_failed', 'wrong_city')), 0)
         FROM lawsuit_court_assignments",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        },
    )?;
    let courts_geocoded: i64 = conn.query_row(
        "SELECT COUNT(*) FROM court_coordinates WHERE deleted_at IS NULL",
        [],
        |row| row.get(0),
    )?;

    Ok(TenantStats {
        processed: processed as usize,
        assigned: assigned as usize,
        no_address: no_address as usize,
        errors: errors as usize,
        courts_geocoded: courts_geocoded as usize,
        active_courts: active_courts as usize,
        percentage_assigned: percentage(assigned as usize, processed as usize),
    })
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 10000.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentFilter {
    All,
    Assigned,
    NoAddress,
    Error,
}

impl AssignmentFilter {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(AssignmentFilter::All),
            "assigned" => Some(AssignmentFilter::Assigned),
            "no_address" => Some(AssignmentFilter::NoAddress),
            "error" | "errors" => Some(AssignmentFilter::Error),
            _ => None,
        }
    }

    fn clause(self) -> &'static str {
        match self {
            AssignmentFilter::All => "1 = 1",
            AssignmentFilter::Assigned => "outcome = 'assigned'",
            AssignmentFilter::NoAddress => "outcome = 'no_address'",
            AssignmentFilter::Error => "outcome IN ('no_court', 'geocode_failed', 'wrong_city')",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
}

impl Pagination {
    pub fn new(page: Option<usize>, page_size: Option<usize>) -> Self {
        let sanitized_page_size = page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let sanitized_page = page.unwrap_or(1).max(1);
        Self {
            page: sanitized_page,
            page_size: sanitized_page_size,
        }
    }

    pub fn with_total(self, total: usize) -> Self {
        if total == 0 {
            return Self {
                page: 1,
                page_size: self.page_size,
            };
        }
        let pages = total.div_ceil(self.page_size);
        Self {
            page: cmp::min(self.page, pages).max(1),
            page_size: self.page_size,
        }
    }

    fn offset(&self) -> i64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size) as i64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct AssignmentRow {
    pub lawsuit_id: i64,
    pub client_identification: Option<String>,
    pub client_address: String,
    pub client_city: Option<String>,
    pub court_id: Option<i64>,
    pub court_name: Option<String>,
    pub cuantia_type: Option<String>,
    pub distance_km: Option<f64>,
    pub outcome: String,
    pub assigned_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct AssignmentPage {
    pub rows: Vec<AssignmentRow>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub fn list_assignments(
    conn: &Connection,
    filter: AssignmentFilter,
    pagination: Pagination,
) -> AppResult<AssignmentPage> {
    if !engine_tables_ready(conn)? {
        return Ok(AssignmentPage {
            rows: Vec::new(),
            total: 0,
            page: 1,
            page_size: pagination.page_size,
        });
    }
    let clause = filter.clause();
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM lawsuit_court_assignments WHERE {clause}"),
        [],
        |row| row.get(0),
    )?;
    let total = total as usize;
    let pagination = pagination.with_total(total);

    let mut stmt = conn.prepare(&format!(
        "SELECT lawsuit_id, client_identification, client_address, client_city, court_id,
                court_name, cuantia_type, distance_km, outcome, assigned_at, updated_at
         FROM lawsuit_court_assignments
         WHERE {clause}
         ORDER BY lawsuit_id
         LIMIT ?1 OFFSET ?2"
    ))?;
    let rows = stmt
        .query_map(
            (pagination.page_size as i64, pagination.offset()),
            parse_assignment_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AssignmentPage {
        rows,
        total,
        page: pagination.page,
        page_size: pagination.page_size,
    })
}

fn parse_assignment_row(row: &Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok(AssignmentRow {
        lawsuit_id: row.get(0)?,
        client_identification: row.get(1)?,
        client_address: row.get(2)?,
        client_city: row.get(3)?,
        court_id: row.get(4)?,
        court_name: row.get(5)?,
        cuantia_type: row.get(6)?,
        distance_km: row.get(7)?,
        outcome: row.get(8)?,
        assigned_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
