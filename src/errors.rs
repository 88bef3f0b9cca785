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
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("geocoding provider returned status {status}")]
    Provider { status: String },
    #[error("failed to persist cache entry for {key}: {reason}")]
    CacheWrite { key: String, reason: String },
    #[error("invalid input: {0}")]
    Input(String),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    /// Transport failures are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.is_request()
                    || err.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            AppError::Io(_) => true,
            _ => false,
        }
    }

    /// Status label used in reports for a row that failed with this error.
    pub fn status_label(&self) -> String {
        match self {
            AppError::Provider { status } => status.clone(),
            AppError::Http(err) => err
                .status()
                .map(|status| format!("HTTP_{}", status.as_u16()))
                .unwrap_or_else(|| "NETWORK_ERROR".to_string()),
            AppError::Io(_) => "NETWORK_ERROR".to_string(),
            AppError::CacheWrite { .. } | AppError::Database(_) => "CACHE_ERROR".to_string(),
            AppError::Input(_) => "INVALID_ADDRESS".to_string(),
            _ => "ERROR".to_string(),
        }
    }
}

/// Cloneable summary of why an address could not be resolved, shared with
/// every row waiting on the same address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionError {
    pub status: String,
    pub message: String,
}

impl ResolutionError {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }
}

impl From<&AppError> for ResolutionError {
    fn from(err: &AppError) -> Self {
        Self::new(err.status_label(), err.to_string())
    }
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}
