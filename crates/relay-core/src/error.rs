//! Error types for asset-relay.
//!
//! Only configuration, enumeration, ledger-open and lock errors abort a run.
//! Everything else is captured per asset or per document and written to the
//! ledger.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the relay library.
#[derive(Debug, Error)]
pub enum RelayError {
    // Run-fatal errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Enumeration failed: {message}")]
    Enumeration { message: String },

    #[error("Ledger {path} is locked by another run")]
    RunLocked { path: PathBuf },

    #[error("Ledger {path} has unexpected header: {header}")]
    LedgerSchema { path: PathBuf, header: String },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited by {service}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    // Destination store errors
    #[error("Asset already exists at destination: {id}")]
    AssetExists { id: String },

    #[error("Upload failed for {id}: {message}")]
    Upload { id: String, message: String },

    // Record store errors
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("CSV error: {message}")]
    Csv {
        message: String,
        #[source]
        source: Option<csv::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<csv::Error> for RelayError {
    fn from(err: csv::Error) -> Self {
        RelayError::Csv {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Database {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(std::time::Duration::from_secs(0))
        } else {
            RelayError::Network {
                message: err.to_string(),
                cause: err.url().map(|u| u.to_string()),
            }
        }
    }
}

impl RelayError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RelayError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        RelayError::Config {
            message: message.into(),
        }
    }

    /// Check if this error should trigger a transfer retry.
    ///
    /// Collisions and local failures are permanent; anything the destination
    /// or network reported is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Network { .. }
                | RelayError::Timeout(_)
                | RelayError::RateLimited { .. }
                | RelayError::Upload { .. }
        )
    }

    /// Whether this error must abort the whole run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Config { .. }
                | RelayError::Enumeration { .. }
                | RelayError::RunLocked { .. }
                | RelayError::LedgerSchema { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::AssetExists {
            id: "folder/abc123".into(),
        };
        assert_eq!(
            err.to_string(),
            "Asset already exists at destination: folder/abc123"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RelayError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(RelayError::Upload {
            id: "a".into(),
            message: "502".into()
        }
        .is_retryable());
        assert!(!RelayError::AssetExists { id: "a".into() }.is_retryable());
        assert!(!RelayError::config("missing key").is_retryable());
    }

    #[test]
    fn test_run_fatal_errors() {
        assert!(RelayError::config("missing").is_run_fatal());
        assert!(RelayError::Enumeration {
            message: "500".into()
        }
        .is_run_fatal());
        assert!(!RelayError::Database {
            message: "write conflict".into()
        }
        .is_run_fatal());
    }
}
