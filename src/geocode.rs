use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::{AppConfig, EnvironmentConfig};
use crate::errors::{AppError, AppResult};
use crate::usage::UsageTracker;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GeocodedLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
    pub locality: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GeocodeResponse {
    Found(GeocodedLocation),
    NotFound,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GeocodeError {
    // Timeouts, transport failures, 5xx and UNKNOWN_ERROR. Retried.
    #[error("transient geocoding failure: {0}")]
    Transient(String),
    #[error("geocoding request rejected: {0}")]
    Rejected(String),
    // Key or account refused; every further request would fail the same way.
    #[error("geocoding credentials denied: {0}")]
    Denied(String),
    #[error("geocoding provider quota exceeded")]
    OverQuota,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<GeocodeResponse, GeocodeError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum GeocodeOutcome {
    Found(GeocodedLocation),
    NotFound,
    QuotaDenied,
    Rejected(String),
    Unreachable(String),
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.geocoding_max_attempts.max(1),
            base_backoff_ms: config.geocoding_base_backoff_ms,
        }
    }
}

pub struct GeocodingService {
    inner: Arc<dyn Geocoder>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    jitter_rng: Mutex<StdRng>,
}

impl GeocodingService {
    pub fn from_config(app: &AppConfig, environment: &EnvironmentConfig) -> AppResult<Self> {
        let api_key = environment
            .geocoding_api_key
            .as_ref()
            .ok_or_else(|| AppError::Config("geocoding_api_key is not configured".into()))?;
        let client = HttpGeocoder::new(
            SecretString::from(api_key.expose_secret().to_string()),
            environment.geocoding_endpoint.clone(),
            Duration::from_secs(app.geocoding_http_timeout_secs),
        )?;
        Ok(Self::from_geocoder(
            Arc::new(client),
            app.geocoding_rate_limit_qps,
            RetryPolicy::from_config(app),
            StdRng::from_entropy(),
        ))
    }

    pub fn from_geocoder(
        geocoder: Arc<dyn Geocoder>,
        qps: u32,
        retry: RetryPolicy,
        jitter_rng: StdRng,
    ) -> Self {
        Self {
            inner: geocoder,
            rate_limiter: RateLimiter::new(qps.max(1)),
            retry,
            jitter_rng: Mutex::new(jitter_rng),
        }
    }

    /// Every attempt reserves one call first; a denied reservation means no
    /// request leaves the process. Denied credentials abort with
    /// `ProviderUnavailable`.
    pub async fn geocode_within_quota(
        &self,
        address: &str,
        usage: &UsageTracker,
    ) -> AppResult<GeocodeOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !usage.try_reserve(1)? {
                return Ok(GeocodeOutcome::QuotaDenied);
            }
            self.rate_limiter.wait().await;
            trace!(target: "geocoding", attempt, address, "geocoding request");
            match self.inner.geocode(address).await {
                Ok(GeocodeResponse::Found(location)) => {
                    usage.report(1)?;
                    return Ok(GeocodeOutcome::Found(location));
                }
                Ok(GeocodeResponse::NotFound) => {
                    usage.report(1)?;
                    debug!(target: "geocoding", address, "no results for address");
                    return Ok(GeocodeOutcome::NotFound);
                }
                Err(GeocodeError::Rejected(message)) => {
                    usage.report(1)?;
                    warn!(target: "geocoding", address, %message, "geocoding request rejected");
                    return Ok(GeocodeOutcome::Rejected(message));
                }
                Err(GeocodeError::Denied(message)) => {
                    usage.report(1)?;
                    warn!(target: "geocoding", environment = usage.environment(), %message, "geocoding credentials denied");
                    return Err(AppError::ProviderUnavailable(format!(
                        "geocoding provider denied the request: {message}"
                    )));
                }
                Err(GeocodeError::OverQuota) => {
                    warn!(
                        target: "geocoding",
                        environment = usage.environment(),
                        "provider reported quota exhaustion"
                    );
                    return Ok(GeocodeOutcome::QuotaDenied);
                }
                Err(GeocodeError::Transient(message)) if attempt < self.retry.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "geocoding",
                        %message,
                        attempt, "geocoding failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(GeocodeError::Transient(message)) => {
                    return Ok(GeocodeOutcome::Unreachable(message));
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.retry.base_backoff_ms;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(base_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..base_ms))
        };
        base + jitter
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Self::interval(qps),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn interval(qps: u32) -> Duration {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        Duration::from_millis(interval_ms.max(20))
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

pub struct HttpGeocoder {
    http: reqwest::Client,
    api_key: SecretString,
    endpoint: String,
}

impl HttpGeocoder {
    pub fn new(api_key: SecretString, endpoint: String, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key,
            endpoint,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    results: Vec<ApiResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    formatted_address: Option<String>,
    geometry: ApiGeometry,
    #[serde(default)]
    address_components: Vec<ApiComponent>,
}

#[derive(Debug, Deserialize)]
struct ApiGeometry {
    location: ApiLocation,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct ApiComponent {
    long_name: String,
    #[serde(default)]
    types: Vec<String>,
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeocodeResponse, GeocodeError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("address", address), ("key", self.api_key.expose_secret())])
            .send()
            .await
            .map_err(|err| GeocodeError::Transient(err.without_url().to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GeocodeError::Transient(format!("http status {status}")));
        }
        if status.as_u16() == 429 {
            return Err(GeocodeError::OverQuota);
        }
        if matches!(status.as_u16(), 401 | 403) {
            return Err(GeocodeError::Denied(format!("http status {status}")));
        }
        if status.is_client_error() {
            return Err(GeocodeError::Rejected(format!("http status {status}")));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|err| GeocodeError::Transient(err.without_url().to_string()))?;
        interpret(body)
    }
}

fn interpret(body: ApiResponse) -> Result<GeocodeResponse, GeocodeError> {
    let detail = || body.error_message.clone().unwrap_or_else(|| body.status.clone());
    match body.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" => return Ok(GeocodeResponse::NotFound),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => return Err(GeocodeError::OverQuota),
        "UNKNOWN_ERROR" => return Err(GeocodeError::Transient(detail())),
        "REQUEST_DENIED" => return Err(GeocodeError::Denied(detail())),
        _ => return Err(GeocodeError::Rejected(detail())),
    }
    let Some(first) = body.results.into_iter().next() else {
        return Ok(GeocodeResponse::NotFound);
    };
    let locality = pick_component(&first.address_components, "locality")
        .or_else(|| pick_component(&first.address_components, "administrative_area_level_2"));
    Ok(GeocodeResponse::Found(GeocodedLocation {
        latitude: first.geometry.location.lat,
        longitude: first.geometry.location.lng,
        formatted_address: first.formatted_address.unwrap_or_default(),
        locality,
    }))
}

fn pick_component(components: &[ApiComponent], kind: &str) -> Option<String> {
    components
        .iter()
        .find(|component| component.types.iter().any(|t| t == kind))
        .map(|component| component.long_name.clone())
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::test_support::{found, service, StubGeocoder};
    use super::*;
    use crate::config::ApiLimits;
    use crate::state::StateStore;

    fn tracker(daily_max: u64) -> UsageTracker {
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

    #[tokio::test]
    async fn retries_transient_failures_and_reserves_each_attempt() {
        let stub = Arc::new(StubGeocoder::answering(Ok(GeocodeResponse::NotFound)).script(
            "Calle 1",
            vec![
                Err(GeocodeError::Transient("timeout".into())),
                found(4.6, -74.08, Some("Bogotá")),
            ],
        ));
        let service = service(stub.clone());
        let usage = tracker(10);

        let outcome = service.geocode_within_quota("Calle 1", &usage).await.unwrap();
        assert!(matches!(outcome, GeocodeOutcome::Found(ref loc) if loc.latitude == 4.6));
        assert_eq!(stub.calls(), 2);
        let snapshot = usage.snapshot().unwrap();
        assert_eq!(snapshot.daily.calls, 2);
        assert_eq!(snapshot.daily.reported, 1);
    }

    #[tokio::test]
    async fn rejected_addresses_are_not_retried() {
        let stub = Arc::new(StubGeocoder::answering(Err(GeocodeError::Rejected(
            "INVALID_REQUEST".into(),
        ))));
        let service = service(stub.clone());
        let usage = tracker(10);

        let outcome = service.geocode_within_quota("???", &usage).await.unwrap();
        assert_eq!(outcome, GeocodeOutcome::Rejected("INVALID_REQUEST".into()));
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn denied_credentials_abort_after_one_call() {
        let stub = Arc::new(StubGeocoder::answering(Err(GeocodeError::Denied(
            "The provided API key is invalid.".into(),
        ))));
        let service = service(stub.clone());
        let usage = tracker(10);

        let err = service.geocode_within_quota("Calle 4", &usage).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable(ref message) if message.contains("API key")));
        assert!(err.is_run_fatal());
        assert_eq!(stub.calls(), 1);
        assert_eq!(usage.snapshot().unwrap().daily.reported, 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let stub = Arc::new(StubGeocoder::answering(Err(GeocodeError::Transient(
            "connection refused".into(),
        ))));
        let service = service(stub.clone());
        let usage = tracker(10);

        let outcome = service.geocode_within_quota("Calle 2", &usage).await.unwrap();
        assert!(matches!(outcome, GeocodeOutcome::Unreachable(_)));
        assert_eq!(stub.calls(), 3);
        assert_eq!(usage.remaining_today().unwrap(), 7);
    }

    #[tokio::test]
    async fn denied_reservation_makes_no_call() {
        let stub = Arc::new(StubGeocoder::answering(found(1.0, 1.0, None)));
        let service = service(stub.clone());
        let usage = tracker(1);
        assert!(usage.try_reserve(1).unwrap());

        let outcome = service.geocode_within_quota("Calle 3", &usage).await.unwrap();
        assert_eq!(outcome, GeocodeOutcome::QuotaDenied);
        assert_eq!(stub.calls(), 0);
    }

    #[test]
    fn interprets_provider_statuses() {
        let ok: ApiResponse = serde_json::from_value(json!({
            "status": "OK",
            "results": [{
                "formatted_address": "Cl. 10 #5-20, Cúcuta, Norte de Santander, Colombia",
                "geometry": { "location": { "lat": 7.8891, "lng": -72.4967 } },
                "address_components": [
                    { "long_name": "Norte de Santander", "types": ["administrative_area_level_1", "political"] },
                    { "long_name": "Cúcuta", "types": ["locality", "political"] }
                ]
            }]
        }))
        .unwrap();
        match interpret(ok).unwrap() {
            GeocodeResponse::Found(location) => {
                assert_eq!(location.locality.as_deref(), Some("Cúcuta"));
                assert_eq!(location.longitude, -72.4967);
            }
            other => panic!("unexpected {other:?}"),
        }

        let status = |status: &str| -> ApiResponse {
            serde_json::from_value(json!({ "status": status, "results": [] })).unwrap()
        };
        assert_eq!(interpret(status("ZERO_RESULTS")).unwrap(), GeocodeResponse::NotFound);
        assert_eq!(interpret(status("OVER_QUERY_LIMIT")).unwrap_err(), GeocodeError::OverQuota);
        assert!(matches!(
            interpret(status("UNKNOWN_ERROR")).unwrap_err(),
            GeocodeError::Transient(_)
        ));
        assert!(matches!(
            interpret(status("INVALID_REQUEST")).unwrap_err(),
            GeocodeError::Rejected(_)
        ));
        assert!(matches!(
            interpret(status("REQUEST_DENIED")).unwrap_err(),
            GeocodeError::Denied(_)
        ));
    }

    #[test]
    fn rate_limiter_spacing_has_a_floor() {
        assert_eq!(RateLimiter::new(10).min_interval, Duration::from_millis(100));
        assert_eq!(RateLimiter::new(1000).min_interval, Duration::from_millis(20));
        assert_eq!(RateLimiter::new(0).min_interval, Duration::from_millis(1000));
    }
}
