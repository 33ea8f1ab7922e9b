pub mod assign;
pub mod cities;
pub mod commands;
pub mod config;
pub mod controller;
pub mod db;
pub mod errors;
pub mod geocode;
pub mod metrics;
pub mod orchestrator;
pub mod state;
pub mod sync;
pub mod tenants;
pub mod usage;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cities::CityNormalizer;
use crate::config::{AppConfig, ConfigStore, EnvironmentConfig, FileConfigStore, PublicEnvironmentConfig};
use crate::controller::{BotController, BotRunState, RunOutcome, RunTrigger};
use crate::errors::{AppError, AppResult};
use crate::geocode::{Geocoder, GeocodingService, RetryPolicy};
use crate::metrics::{AssignmentFilter, AssignmentPage, Pagination, StatsReport, TenantStatsEntry};
use crate::orchestrator::{Orchestrator, RunContext, RunReport, RunStatus, StopSignal};
use crate::state::StateStore;
use crate::tenants::{ConnectionCheck, TenantConnection};
use crate::usage::{Clock, UsageSnapshot, UsageTracker};

pub struct Engine {
    app: AppConfig,
    configs: Arc<dyn ConfigStore>,
    state: StateStore,
    normalizers: RwLock<HashMap<String, Arc<CityNormalizer>>>,
    // Stop flag of the run this process has in flight, per environment.
    active_runs: Mutex<HashMap<String, Arc<AtomicBool>>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    clock: Clock,
}

impl Engine {
    pub fn new(app: AppConfig) -> AppResult<Self> {
        let configs = Arc::new(FileConfigStore::new(app.config_path.clone()));
        let state = StateStore::open(&app.state_db_path)?;
        Ok(Self::with_parts(app, configs, state))
    }

    pub fn with_parts(app: AppConfig, configs: Arc<dyn ConfigStore>, state: StateStore) -> Self {
        Self {
            app,
            configs,
            state,
            normalizers: RwLock::new(HashMap::new()),
            active_runs: Mutex::new(HashMap::new()),
            geocoder: None,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    // Drives the schedule window and the quota calendar.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn log_filter(&self, environment: &str) -> Option<String> {
        self.configs
            .get_config(environment)
            .ok()
            .and_then(|config| config.log_config.filter.clone())
    }

    pub async fn start(&self, environment: &str) -> AppResult<RunReport> {
        self.run(environment, RunTrigger::Operator, None).await
    }

    pub async fn execute_once(&self, environment: &str, limit: Option<usize>) -> AppResult<RunReport> {
        self.run(environment, RunTrigger::Manual, limit).await
    }

    pub async fn run_scheduled(&self, environment: &str) -> AppResult<Option<RunReport>> {
        let config = self.configs.get_config(environment)?;
        let offset = utc_offset(&config)?;
        let now = (self.clock)().with_timezone(&offset);
        if !config.schedule.admits(now) {
            info!(
                target: "orchestrator",
                environment,
                local_time = %now.format("%a %H:%M"),
                "outside schedule window; skipping"
            );
            return Ok(None);
        }
        self.run(environment, RunTrigger::Scheduled, None).await.map(Some)
    }

    pub fn stop(&self, environment: &str) -> AppResult<BotRunState> {
        if let Some(flag) = self.active_runs.lock().get(environment) {
            flag.store(true, Ordering::SeqCst);
        }
        self.controller(environment).stop()
    }

    pub fn get_status(&self, environment: &str) -> AppResult<BotRunState> {
        self.controller(environment).state()
    }

    pub fn get_stats(&self, environment: &str, tenant: Option<&str>) -> AppResult<StatsReport> {
        let config = self.configs.get_config(environment)?;
        let tenants = match tenant {
            Some(id) => vec![config.tenant(id)?.clone()],
            None => config.tenant_databases.clone(),
        };
        let entries = tenants
            .iter()
            .map(|tenant| {
                let stats = TenantConnection::open_read_only(tenant).and_then(|connection| {
                    let conn = connection.lock();
                    metrics::tenant_stats(&conn)
                });
                match stats {
                    Ok(stats) => TenantStatsEntry {
                        tenant: tenant.id.clone(),
                        stats: Some(stats),
                        error: None,
                    },
                    Err(err) => {
                        warn!(target: "tenant_db", tenant = %tenant.id, error = %err, "stats unavailable");
                        TenantStatsEntry {
                            tenant: tenant.id.clone(),
                            stats: None,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .collect();
        Ok(StatsReport::from_entries(environment, entries))
    }

    pub fn list_tenants(&self, environment: &str) -> AppResult<Vec<String>> {
        let config = self.configs.get_config(environment)?;
        Ok(config
            .tenant_databases
            .iter()
            .map(|tenant| tenant.id.clone())
            .collect())
    }

    pub fn reload_config(&self, environment: &str) -> AppResult<PublicEnvironmentConfig> {
        self.configs.reload()?;
        self.normalizers.write().clear();
        let config = self.configs.get_config(environment)?;
        Ok(config.public_profile(environment))
    }

    pub fn test_connections(&self, environment: &str) -> AppResult<Vec<ConnectionCheck>> {
        let config = self.configs.get_config(environment)?;
        Ok(tenants::test_connections(&config.tenant_databases))
    }

    pub fn api_usage(&self, environment: &str) -> AppResult<UsageSnapshot> {
        let config = self.configs.get_config(environment)?;
        self.usage_tracker(environment, &config)?.snapshot()
    }

    pub fn reset_daily_usage(&self, environment: &str) -> AppResult<u64> {
        let config = self.configs.get_config(environment)?;
        self.usage_tracker(environment, &config)?.reset_today()
    }

    pub fn list_assignments(
        &self,
        environment: &str,
        tenant: &str,
        filter: AssignmentFilter,
        pagination: Pagination,
    ) -> AppResult<AssignmentPage> {
        let config = self.configs.get_config(environment)?;
        let connection = TenantConnection::open_read_only(config.tenant(tenant)?)?;
        let conn = connection.lock();
        metrics::list_assignments(&conn, filter, pagination)
    }

    async fn run(
        &self,
        environment: &str,
        trigger: RunTrigger,
        limit: Option<usize>,
    ) -> AppResult<RunReport> {
        let controller = self.controller(environment);
        let run_id = controller.begin_run(trigger)?.run_id.unwrap_or_default();

        let prepared = self.configs.get_config(environment).and_then(|config| {
            let usage = self.usage_tracker(environment, &config)?;
            let geocoding = self.geocoding_service(&config)?;
            Ok((config, usage, geocoding))
        });
        let (config, usage, geocoding) = match prepared {
            Ok(parts) => parts,
            Err(err) => {
                controller.finish_run(&run_id, &RunOutcome::Failed(err.to_string()))?;
                return Err(err);
            }
        };
        let cities = self.normalizer(environment, &config);

        let flag = Arc::new(AtomicBool::new(false));
        self.active_runs
            .lock()
            .insert(environment.to_string(), Arc::clone(&flag));
        let stop: StopSignal = {
            let controller = controller.clone();
            let flag = Arc::clone(&flag);
            let run_id = run_id.clone();
            Arc::new(move || {
                flag.load(Ordering::SeqCst)
                    || controller
                        .is_current(&run_id)
                        .map(|current| !current)
                        .unwrap_or(false)
            })
        };

        let ctx = RunContext {
            environment,
            config: &config,
            geocoding: &geocoding,
            usage: &usage,
            cities: &cities,
            limit,
        };
        let report = Orchestrator::new(ctx, stop).run_all().await;
        {
            let mut active = self.active_runs.lock();
            if active
                .get(environment)
                .is_some_and(|current| Arc::ptr_eq(current, &flag))
            {
                active.remove(environment);
            }
        }

        let outcome = match &report.status {
            RunStatus::Completed | RunStatus::Stopped => RunOutcome::Completed,
            RunStatus::QuotaExhausted => RunOutcome::QuotaExhausted(quota_reason(&usage)),
            RunStatus::Failed(message) => RunOutcome::Failed(message.clone()),
        };
        controller.finish_run(&run_id, &outcome)?;
        Ok(report)
    }

    fn controller(&self, environment: &str) -> BotController {
        BotController::new(
            self.state.clone(),
            environment,
            self.app.run_stale_after_minutes,
        )
    }

    fn usage_tracker(&self, environment: &str, config: &EnvironmentConfig) -> AppResult<UsageTracker> {
        Ok(UsageTracker::new(
            self.state.clone(),
            environment,
            config.api_limits,
            config.utc_offset_minutes,
        )?
        .with_clock(Arc::clone(&self.clock)))
    }

    fn geocoding_service(&self, config: &EnvironmentConfig) -> AppResult<GeocodingService> {
        match &self.geocoder {
            Some(geocoder) => Ok(GeocodingService::from_geocoder(
                Arc::clone(geocoder),
                self.app.geocoding_rate_limit_qps,
                RetryPolicy::from_config(&self.app),
                StdRng::from_entropy(),
            )),
            None => GeocodingService::from_config(&self.app, config),
        }
    }

    fn normalizer(&self, environment: &str, config: &EnvironmentConfig) -> Arc<CityNormalizer> {
        if let Some(cached) = self.normalizers.read().get(environment) {
            return Arc::clone(cached);
        }
        let built = Arc::new(CityNormalizer::new(&config.city_variant_groups));
        self.normalizers
            .write()
            .entry(environment.to_string())
            .or_insert(built)
            .clone()
    }
}

fn quota_reason(usage: &UsageTracker) -> String {
    match usage.snapshot() {
        Ok(snapshot) if snapshot.monthly.remaining == 0 => format!(
            "monthly geocoding quota exhausted ({}/{} calls in {})",
            snapshot.monthly.calls, snapshot.monthly.limit, snapshot.monthly.period_key
        ),
        Ok(snapshot) if snapshot.daily.remaining == 0 => format!(
            "daily geocoding quota exhausted ({}/{} calls on {})",
            snapshot.daily.calls, snapshot.daily.limit, snapshot.daily.period_key
        ),
        _ => "geocoding quota exhausted (reported by the provider)".to_string(),
    }
}

fn utc_offset(config: &EnvironmentConfig) -> AppResult<FixedOffset> {
    FixedOffset::east_opt(config.utc_offset_minutes * 60)
        .ok_or_else(|| AppError::Config(format!("invalid utc offset {}", config.utc_offset_minutes)))
}

pub fn init_tracing(filter: Option<&str>) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| match filter {
                Some(directives) => EnvFilter::try_new(directives),
                None => EnvFilter::try_new("info,court_assignment_engine=debug"),
            })
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
