use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::assign::{AssignmentReport, AssignmentResolver};
use crate::cities::CityNormalizer;
use crate::config::EnvironmentConfig;
use crate::db::now_timestamp;
use crate::errors::AppError;
use crate::geocode::GeocodingService;
use crate::sync::{CourtSynchronizer, SyncReport};
use crate::tenants::{TenantConnection, TenantDatabase};
use crate::usage::UsageTracker;

// Polled before each tenant starts.
pub type StopSignal = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
pub enum RunStatus {
    Completed,
    QuotaExhausted,
    Stopped,
    Failed(String),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TenantReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assign: Option<AssignmentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl TenantReport {
    fn skipped(reason: &str) -> Self {
        Self {
            skipped: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub environment: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: RunStatus,
    pub per_tenant: BTreeMap<String, TenantReport>,
}

pub struct RunContext<'a> {
    pub environment: &'a str,
    pub config: &'a EnvironmentConfig,
    pub geocoding: &'a GeocodingService,
    pub usage: &'a UsageTracker,
    pub cities: &'a CityNormalizer,
    pub limit: Option<usize>,
}

#[derive(Default)]
struct RunFlags {
    quota_exhausted: AtomicBool,
    stopped: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl RunFlags {
    fn halted(&self) -> bool {
        self.quota_exhausted.load(Ordering::SeqCst) || self.fatal.lock().is_some()
    }

    fn record_fatal(&self, message: String) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(message);
        }
    }
}

pub struct Orchestrator<'a> {
    ctx: RunContext<'a>,
    stop: StopSignal,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: RunContext<'a>, stop: StopSignal) -> Self {
        Self { ctx, stop }
    }

    pub async fn run_all(&self) -> RunReport {
        let started_at = now_timestamp();
        let flags = RunFlags::default();
        let parallel = self.ctx.config.max_parallel_tenants.max(1);
        info!(
            target: "orchestrator",
            environment = self.ctx.environment,
            tenants = self.ctx.config.tenant_databases.len(),
            parallel,
            "run started"
        );

        let per_tenant: BTreeMap<String, TenantReport> =
            stream::iter(self.ctx.config.tenant_databases.iter())
                .map(|tenant| self.run_tenant(tenant, &flags))
                .buffer_unordered(parallel)
                .collect()
                .await;

        let status = if let Some(message) = flags.fatal.lock().clone() {
            RunStatus::Failed(message)
        } else if flags.quota_exhausted.load(Ordering::SeqCst) {
            RunStatus::QuotaExhausted
        } else if flags.stopped.load(Ordering::SeqCst) {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        };
        info!(
            target: "orchestrator",
            environment = self.ctx.environment,
            ?status,
            "run finished"
        );
        RunReport {
            environment: self.ctx.environment.to_string(),
            started_at,
            finished_at: now_timestamp(),
            status,
            per_tenant,
        }
    }

    async fn run_tenant(&self, tenant: &TenantDatabase, flags: &RunFlags) -> (String, TenantReport) {
        let id = tenant.id.clone();
        if flags.halted() {
            return (id, TenantReport::skipped("run halted before this tenant started"));
        }
        if (self.stop)() {
            flags.stopped.store(true, Ordering::SeqCst);
            return (id, TenantReport::skipped("stop requested"));
        }

        let connection = match TenantConnection::open(tenant) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(target: "orchestrator", tenant = %id, error = %err, "tenant unavailable");
                return (
                    id,
                    TenantReport {
                        error: Some(err.to_string()),
                        ..TenantReport::default()
                    },
                );
            }
        };

        let mut report = TenantReport::default();
        let sync = CourtSynchronizer::new(
            self.ctx.geocoding,
            self.ctx.usage,
            &self.ctx.config.assignment,
        )
        .sync(&connection)
        .await;
        match sync {
            Ok(sync) => {
                if sync.quota_exhausted {
                    flags.quota_exhausted.store(true, Ordering::SeqCst);
                }
                report.sync = Some(sync);
            }
            Err(err) => {
                Self::record_failure(&id, err, flags, &mut report);
                return (id, report);
            }
        }

        let assign = AssignmentResolver::new(
            self.ctx.geocoding,
            self.ctx.usage,
            self.ctx.cities,
            &self.ctx.config.assignment,
        )
        .assign(&connection, self.ctx.limit)
        .await;
        match assign {
            Ok(assign) => {
                if assign.quota_exhausted {
                    flags.quota_exhausted.store(true, Ordering::SeqCst);
                }
                report.assign = Some(assign);
            }
            Err(err) => Self::record_failure(&id, err, flags, &mut report),
        }
        (id, report)
    }

    fn record_failure(tenant: &str, err: AppError, flags: &RunFlags, report: &mut TenantReport) {
        if err.is_run_fatal() {
            error!(target: "orchestrator", tenant, error = %err, "run-fatal failure");
            flags.record_fatal(err.to_string());
        } else {
            warn!(target: "orchestrator", tenant, error = %err, "tenant pass failed");
        }
        report.error = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rusqlite::Connection;
    use tempfile::tempdir;

    use super::*;
    use crate::config::{ApiLimits, AssignmentSettings, LogConfig, ScheduleWindow};
    use crate::db::test_support::{create_tenant_db, insert_court, insert_lawsuit};
    use crate::geocode::test_support::{found, service, StubGeocoder};
    use crate::geocode::GeocodeError;
    use crate::state::StateStore;

    fn environment(tenants: Vec<TenantDatabase>, parallel: usize) -> EnvironmentConfig {
        EnvironmentConfig {
            tenant_databases: tenants,
            api_limits: ApiLimits {
                daily_max: 100,
                monthly_max: 1000,
            },
            geocoding_api_key: None,
            geocoding_endpoint: String::new(),
            city_variant_groups: Vec::new(),
            log_config: LogConfig::default(),
            assignment: AssignmentSettings::default(),
            utc_offset_minutes: -300,
            max_parallel_tenants: parallel,
            schedule: ScheduleWindow::default(),
        }
    }

    fn seeded_tenant(dir: &std::path::Path, id: &str) -> TenantDatabase {
        let path = create_tenant_db(dir, &format!("{id}.db"));
        let conn = Connection::open(&path).unwrap();
        insert_court(&conn, 1, "Juzgado", "Calle 1", "Cúcuta", "Minima");
        insert_lawsuit(&conn, 1, 1, "Minima", Some("Calle 2"), Some("Cúcuta"));
        TenantDatabase {
            id: id.into(),
            path,
        }
    }

    fn usage(daily_max: u64) -> UsageTracker {
        UsageTracker::new(
            StateStore::in_memory().unwrap(),
            "qa",
            ApiLimits {
                daily_max,
                monthly_max: 1000,
            },
            -300,
        )
        .unwrap()
    }

    fn never_stop() -> StopSignal {
        Arc::new(|| false)
    }

    #[tokio::test]
    async fn isolates_unreachable_tenants() {
        let dir = tempdir().unwrap();
        let config = environment(
            vec![
                seeded_tenant(dir.path(), "a"),
                TenantDatabase {
                    id: "ghost".into(),
                    path: dir.path().join("ghost.db"),
                },
                seeded_tenant(dir.path(), "c"),
            ],
            2,
        );
        let geocoding = service(Arc::new(StubGeocoder::answering(found(7.9, -72.5, None))));
        let usage = usage(100);
        let cities = CityNormalizer::default();
        let ctx = RunContext {
            environment: "qa",
            config: &config,
            geocoding: &geocoding,
            usage: &usage,
            cities: &cities,
            limit: None,
        };

        let report = Orchestrator::new(ctx, never_stop()).run_all().await;
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.per_tenant["ghost"].error.is_some());
        assert_eq!(report.per_tenant["a"].assign.as_ref().unwrap().assigned, 1);
        assert_eq!(report.per_tenant["c"].sync.as_ref().unwrap().geocoded, 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_blocks_later_tenants() {
        let dir = tempdir().unwrap();
        let config = environment(
            vec![seeded_tenant(dir.path(), "a"), seeded_tenant(dir.path(), "b")],
            1,
        );
        let stub = Arc::new(StubGeocoder::answering(found(7.9, -72.5, None)));
        let geocoding = service(stub.clone());
        let usage = usage(1);
        let cities = CityNormalizer::default();
        let ctx = RunContext {
            environment: "qa",
            config: &config,
            geocoding: &geocoding,
            usage: &usage,
            cities: &cities,
            limit: None,
        };

        let report = Orchestrator::new(ctx, never_stop()).run_all().await;
        assert_eq!(report.status, RunStatus::QuotaExhausted);
        assert!(report.per_tenant["a"].assign.as_ref().unwrap().quota_exhausted);
        assert!(report.per_tenant["b"].skipped.is_some());
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn stop_is_observed_between_tenants() {
        let dir = tempdir().unwrap();
        let config = environment(
            vec![seeded_tenant(dir.path(), "a"), seeded_tenant(dir.path(), "b")],
            1,
        );
        let geocoding = service(Arc::new(StubGeocoder::answering(found(7.9, -72.5, None))));
        let usage = usage(100);
        let cities = CityNormalizer::default();
        let ctx = RunContext {
            environment: "qa",
            config: &config,
            geocoding: &geocoding,
            usage: &usage,
            cities: &cities,
            limit: None,
        };
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let stop: StopSignal = Arc::new(move || counter.fetch_add(1, Ordering::SeqCst) >= 1);

        let report = Orchestrator::new(ctx, stop).run_all().await;
        assert_eq!(report.status, RunStatus::Stopped);
        assert!(report.per_tenant["a"].sync.is_some());
        assert_eq!(report.per_tenant["b"].skipped.as_deref(), Some("stop requested"));
    }

    #[tokio::test]
    async fn provider_outage_fails_the_run() {
        let dir = tempdir().unwrap();
        let mut config = environment(
            vec![seeded_tenant(dir.path(), "a"), seeded_tenant(dir.path(), "b")],
            1,
        );
        config.assignment.provider_failure_threshold = 1;
        let geocoding = service(Arc::new(StubGeocoder::answering(Err(
            GeocodeError::Transient("timeout".into()),
        ))));
        let usage = usage(100);
        let cities = CityNormalizer::default();
        let ctx = RunContext {
            environment: "qa",
            config: &config,
            geocoding: &geocoding,
            usage: &usage,
            cities: &cities,
            limit: None,
        };

        let report = Orchestrator::new(ctx, never_stop()).run_all().await;
        assert!(matches!(report.status, RunStatus::Failed(_)));
        assert!(report.per_tenant["b"].skipped.is_some());
    }
}
