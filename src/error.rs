// src/error.rs

//! Unified error handling for the ingestion job.

use std::fmt;

use thiserror::Error;

/// Result type alias for buildhub operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// AWS S3 error
    #[error("S3 error: {0}")]
    S3(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Inventory CSV row could not be read
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// URL or filename does not follow a known archive layout
    #[error("Cannot parse {url}: {message}")]
    Parse { url: String, message: String },

    /// Platform string has no known OS family
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// A candidate build is listed but publishes no metadata file
    #[error("Missing metadata for candidate {url}")]
    MissingMetadata { url: String },

    /// Request timed out after exhausting retries
    #[error("Timed out fetching {url}")]
    FetchTimeout { url: String },

    /// Retryable HTTP status after exhausting retries
    #[error("Transient HTTP {status} from {url}")]
    TransientHttp { url: String, status: u16 },

    /// Non-retryable HTTP status
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Directory listing did not have the expected shape
    #[error("Bad listing at {url}: {message}")]
    Listing { url: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record or configuration failed sanity checks
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote store rejected or failed a request
    #[error("Remote store error: {0}")]
    RemoteStore(String),

    /// Per-item failures reported by a batch publish
    #[error("Batch publish failed for {} record(s): {}", errors.len(), errors.join("; "))]
    PublishBatch { errors: Vec<String> },
}

impl AppError {
    /// Create a parse error for a URL.
    pub fn parse(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create a listing shape error.
    pub fn listing(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Listing {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a remote store error.
    pub fn remote(message: impl fmt::Display) -> Self {
        Self::RemoteStore(message.to_string())
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::FetchTimeout { .. } | Self::TransientHttp { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Whether an HTTP status should be retried.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            AppError::FetchTimeout {
                url: "https://a/".into()
            }
            .is_transient()
        );
        assert!(
            AppError::TransientHttp {
                url: "https://a/".into(),
                status: 503
            }
            .is_transient()
        );
        assert!(
            !AppError::HttpStatus {
                url: "https://a/".into(),
                status: 403
            }
            .is_transient()
        );
        assert!(!AppError::validation("bad").is_transient());
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(400));
    }

    #[test]
    fn test_publish_batch_message() {
        let err = AppError::PublishBatch {
            errors: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Batch publish failed for 2 record(s): a; b"
        );
    }
}
