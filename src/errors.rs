use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("tenant {tenant} is unreachable: {message}")]
    TenantConnectivity { tenant: String, message: String },
    #[error("tenant {tenant} schema mismatch: missing table {table}")]
    TenantSchema { tenant: String, table: String },
    #[error("unknown tenant {0}")]
    UnknownTenant(String),
    #[error("geocoding provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("a run is already in progress for environment {0}")]
    ConcurrentRunRejected(String),
    #[error("run not admitted for environment {environment}: {reason}")]
    RunBlocked { environment: String, reason: String },
}

impl AppError {
    // Failures that end the whole run and move the controller to `Error`.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::ProviderUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_and_provider_outages_are_fatal() {
        assert!(AppError::Config("missing".into()).is_run_fatal());
        assert!(AppError::ProviderUnavailable("down".into()).is_run_fatal());
        assert!(!AppError::TenantConnectivity {
            tenant: "a".into(),
            message: "refused".into()
        }
        .is_run_fatal());
        assert!(!AppError::ConcurrentRunRejected("qa".into()).is_run_fatal());
    }
}
