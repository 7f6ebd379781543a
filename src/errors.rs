use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("place provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("place provider quota exceeded: {0}")]
    ProviderQuotaExceeded(String),
    #[error("malformed provider record {external_id}: {reason}")]
    MalformedRecord { external_id: String, reason: String },
    #[error("invalid state for place {place_id}: cannot {action} while {status}")]
    InvalidState {
        place_id: i64,
        status: String,
        action: &'static str,
    },
    #[error("place {place_id} is already claimed ({status})")]
    AlreadyClaimed { place_id: i64, status: String },
    #[error("external id {provider}/{external_id} already exists in the catalog")]
    DuplicateExternalId {
        provider: String,
        external_id: String,
    },
    #[error("place {0} was modified concurrently")]
    ConcurrentModification(i64),
    #[error("import cancelled")]
    Cancelled,
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    /// Only transient upstream failures are worth a fresh run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ProviderUnavailable(_))
    }

    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            AppError::MalformedRecord { .. } | AppError::DuplicateExternalId { .. }
        )
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(429) {
            return AppError::ProviderQuotaExceeded(err.to_string());
        }
        AppError::ProviderUnavailable(err.to_string())
    }
}
