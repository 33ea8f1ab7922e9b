use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs, io};

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Weekday};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::tenants::TenantDatabase;

pub const DEFAULT_GEOCODING_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_UTC_OFFSET_MINUTES: i32 = -5 * 60;
const DEFAULT_COUNTRY: &str = "Colombia";
const DEFAULT_PROVIDER_FAILURE_THRESHOLD: u32 = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub environment: String,
    pub config_path: PathBuf,
    pub state_db_path: PathBuf,
    pub geocoding_http_timeout_secs: u64,
    pub geocoding_rate_limit_qps: u32,
    pub geocoding_max_attempts: u32,
    pub geocoding_base_backoff_ms: u64,
    pub run_stale_after_minutes: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            environment: env::var("ENVIRONMENT")
                .map(|v| v.trim().to_lowercase())
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "production".to_string()),
            config_path: env::var("ENGINE_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("engine-config.json")),
            state_db_path: env::var("ENGINE_STATE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("engine-state.db")),
            geocoding_http_timeout_secs: parse_u64("GEOCODING_HTTP_TIMEOUT_SECS", 10).max(1),
            geocoding_rate_limit_qps: parse_u32("GEOCODING_RATE_LIMIT_QPS", 10).max(1),
            geocoding_max_attempts: parse_u32("GEOCODING_MAX_ATTEMPTS", 3).max(1),
            geocoding_base_backoff_ms: parse_u64("GEOCODING_BASE_BACKOFF_MS", 250),
            run_stale_after_minutes: parse_i64("RUN_STALE_AFTER_MINUTES", 30).max(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiLimits {
    pub daily_max: u64,
    pub monthly_max: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReassignPolicy {
    UnassignedOnly,
    #[default]
    OnChange,
    Always,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignmentSettings {
    #[serde(default)]
    pub reassign_policy: ReassignPolicy,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_failure_threshold")]
    pub provider_failure_threshold: u32,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            reassign_policy: ReassignPolicy::default(),
            country: default_country(),
            provider_failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub weekdays_only: bool,
}

impl ScheduleWindow {
    pub fn admits(&self, at: DateTime<FixedOffset>) -> bool {
        if self.weekdays_only && matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let hour = at.hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self {
            start_hour: 7,
            end_hour: 22,
            weekdays_only: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnvironmentConfig {
    pub tenant_databases: Vec<TenantDatabase>,
    pub api_limits: ApiLimits,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub geocoding_api_key: Option<SecretString>,
    #[serde(default = "default_endpoint")]
    pub geocoding_endpoint: String,
    #[serde(default)]
    pub city_variant_groups: Vec<Vec<String>>,
    #[serde(default)]
    pub log_config: LogConfig,
    #[serde(default)]
    pub assignment: AssignmentSettings,
    #[serde(default = "default_offset")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_parallel")]
    pub max_parallel_tenants: usize,
    #[serde(default)]
    pub schedule: ScheduleWindow,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicEnvironmentConfig {
    pub environment: String,
    pub tenants: Vec<String>,
    pub api_limits: ApiLimits,
    pub has_geocoding_key: bool,
    pub geocoding_endpoint: String,
    pub city_variant_groups: usize,
    pub reassign_policy: ReassignPolicy,
    pub max_parallel_tenants: usize,
    pub utc_offset_minutes: i32,
}

impl EnvironmentConfig {
    pub fn validate(&self, environment: &str) -> AppResult<()> {
        if self.tenant_databases.is_empty() {
            return Err(AppError::Config(format!(
                "environment {environment} lists no tenant databases"
            )));
        }
        let mut seen = HashSet::new();
        for tenant in &self.tenant_databases {
            if tenant.id.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "environment {environment} has a tenant without id"
                )));
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(AppError::Config(format!(
                    "environment {environment} lists tenant {} twice",
                    tenant.id
                )));
            }
        }
        if self.api_limits.daily_max == 0 || self.api_limits.monthly_max == 0 {
            return Err(AppError::Config(format!(
                "environment {environment} has zero api limits"
            )));
        }
        let has_key = self
            .geocoding_api_key
            .as_ref()
            .map(|key| !key.expose_secret().trim().is_empty())
            .unwrap_or(false);
        if !has_key {
            return Err(AppError::Config(format!(
                "environment {environment} is missing geocoding_api_key"
            )));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(AppError::Config(format!(
                "environment {environment} has an invalid utc offset"
            )));
        }
        Ok(())
    }

    pub fn tenant(&self, tenant_id: &str) -> AppResult<&TenantDatabase> {
        self.tenant_databases
            .iter()
            .find(|tenant| tenant.id == tenant_id)
            .ok_or_else(|| AppError::UnknownTenant(tenant_id.to_string()))
    }

    pub fn public_profile(&self, environment: &str) -> PublicEnvironmentConfig {
        PublicEnvironmentConfig {
            environment: environment.to_string(),
            tenants: self
                .tenant_databases
                .iter()
                .map(|tenant| tenant.id.clone())
                .collect(),
            api_limits: self.api_limits,
            has_geocoding_key: self.geocoding_api_key.is_some(),
            geocoding_endpoint: self.geocoding_endpoint.clone(),
            city_variant_groups: self.city_variant_groups.len(),
            reassign_policy: self.assignment.reassign_policy,
            max_parallel_tenants: self.max_parallel_tenants,
            utc_offset_minutes: self.utc_offset_minutes,
        }
    }
}

pub trait ConfigStore: Send + Sync {
    fn get_config(&self, environment: &str) -> AppResult<Arc<EnvironmentConfig>>;
    fn reload(&self) -> AppResult<()>;
}

// JSON document keyed by environment name, parsed lazily and cached.
pub struct FileConfigStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, Arc<EnvironmentConfig>>>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn load(&self, environment: &str) -> AppResult<EnvironmentConfig> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AppError::Config(format!(
                    "configuration file {} not found",
                    self.path.display()
                )))
            }
            Err(err) => return Err(AppError::Io(err)),
        };
        let mut document: HashMap<String, serde_json::Value> = serde_json::from_str(&contents)
            .map_err(|err| AppError::Config(format!("invalid configuration document: {err}")))?;
        let raw = document.remove(environment).ok_or_else(|| {
            AppError::Config(format!("no configuration for environment {environment}"))
        })?;
        let config: EnvironmentConfig = serde_json::from_value(raw).map_err(|err| {
            AppError::Config(format!("invalid configuration for {environment}: {err}"))
        })?;
        config.validate(environment)?;
        Ok(config)
    }
}

impl ConfigStore for FileConfigStore {
    fn get_config(&self, environment: &str) -> AppResult<Arc<EnvironmentConfig>> {
        if let Some(config) = self.cache.lock().get(environment) {
            return Ok(Arc::clone(config));
        }
        let config = Arc::new(self.load(environment)?);
        debug!(
            target: "config_store",
            environment,
            tenants = config.tenant_databases.len(),
            "loaded environment configuration"
        );
        self.cache
            .lock()
            .insert(environment.to_string(), Arc::clone(&config));
        Ok(config)
    }

    fn reload(&self) -> AppResult<()> {
        let dropped = {
            let mut cache = self.cache.lock();
            let dropped = cache.len();
            cache.clear();
            dropped
        };
        info!(
            target: "config_store",
            path = %self.path.display(),
            dropped,
            "configuration cache cleared"
        );
        Ok(())
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from))
}

fn default_endpoint() -> String {
    DEFAULT_GEOCODING_ENDPOINT.to_string()
}

fn default_country() -> String {
    DEFAULT_COUNTRY.to_string()
}

fn default_failure_threshold() -> u32 {
    DEFAULT_PROVIDER_FAILURE_THRESHOLD
}

fn default_offset() -> i32 {
    DEFAULT_UTC_OFFSET_MINUTES
}

fn default_parallel() -> usize {
    1
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_document(dir: &Path, document: serde_json::Value) -> PathBuf {
        let path = dir.join("engine-config.json");
        fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
        path
    }

    fn qa_document() -> serde_json::Value {
        json!({
            "qa": {
                "tenant_databases": [
                    { "id": "cartera_a", "path": "a.db" },
                    { "id": "cartera_b", "path": "b.db" }
                ],
                "api_limits": { "daily_max": 700, "monthly_max": 8000 },
                "geocoding_api_key": "secret-key",
                "city_variant_groups": [["Bogotá", "Bogotá D.C."]]
            }
        })
    }

    #[test]
    fn reads_environment_with_defaults() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(write_document(dir.path(), qa_document()));
        let config = store.get_config("qa").unwrap();

        assert_eq!(config.tenant_databases.len(), 2);
        assert_eq!(config.api_limits.daily_max, 700);
        assert_eq!(config.utc_offset_minutes, -300);
        assert_eq!(config.max_parallel_tenants, 1);
        assert_eq!(config.assignment.reassign_policy, ReassignPolicy::OnChange);
        assert_eq!(config.geocoding_endpoint, DEFAULT_GEOCODING_ENDPOINT);

        let public = config.public_profile("qa");
        assert!(public.has_geocoding_key);
        assert_eq!(public.tenants, vec!["cartera_a", "cartera_b"]);
        assert!(!serde_json::to_string(&public).unwrap().contains("secret-key"));
    }

    #[test]
    fn missing_environment_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(write_document(dir.path(), qa_document()));
        let err = store.get_config("production").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn rejects_missing_api_key_and_duplicate_tenants() {
        let dir = tempdir().unwrap();
        let path = write_document(
            dir.path(),
            json!({
                "nokey": {
                    "tenant_databases": [{ "id": "a", "path": "a.db" }],
                    "api_limits": { "daily_max": 1, "monthly_max": 1 }
                },
                "dupes": {
                    "tenant_databases": [
                        { "id": "a", "path": "a.db" },
                        { "id": "a", "path": "b.db" }
                    ],
                    "api_limits": { "daily_max": 1, "monthly_max": 1 },
                    "geocoding_api_key": "k"
                }
            }),
        );
        let store = FileConfigStore::new(path);
        assert!(matches!(store.get_config("nokey"), Err(AppError::Config(_))));
        assert!(matches!(store.get_config("dupes"), Err(AppError::Config(_))));
    }

    #[test]
    fn schedule_window_covers_business_hours_on_weekdays() {
        let window = ScheduleWindow::default();
        let bogota = FixedOffset::west_opt(5 * 3600).unwrap();
        let at = |rfc: &str| DateTime::parse_from_rfc3339(rfc).unwrap().with_timezone(&bogota);

        assert!(window.admits(at("2024-03-04T07:00:00-05:00")));
        assert!(window.admits(at("2024-03-04T21:59:00-05:00")));
        assert!(!window.admits(at("2024-03-04T22:00:00-05:00")));
        assert!(!window.admits(at("2024-03-04T06:59:00-05:00")));
        assert!(!window.admits(at("2024-03-09T10:00:00-05:00")));
        // 03:00 UTC Monday is still Sunday evening in Bogotá.
        assert!(!window.admits(at("2024-03-04T03:00:00Z")));
    }

    #[test]
    fn reload_picks_up_edits() {
        let dir = tempdir().unwrap();
        let path = write_document(dir.path(), qa_document());
        let store = FileConfigStore::new(&path);
        assert_eq!(store.get_config("qa").unwrap().api_limits.daily_max, 700);

        let mut document = qa_document();
        document["qa"]["api_limits"]["daily_max"] = json!(50);
        write_document(dir.path(), document);
        assert_eq!(store.get_config("qa").unwrap().api_limits.daily_max, 700);

        store.reload().unwrap();
        assert_eq!(store.get_config("qa").unwrap().api_limits.daily_max, 50);
    }
}
