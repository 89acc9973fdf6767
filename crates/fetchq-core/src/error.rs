//! Error types for fetchq core

use fetchq_types::{FailureReason, JobId, JobStatus};
use thiserror::Error;

/// Errors that can occur in fetchq core
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Server error: HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Service has shut down")]
    ServiceStopped,
}

impl FetchError {
    /// Check if a transfer failing with this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::TransientIo(_) | FetchError::Io(_) => true,
            FetchError::Network(e) => {
                !e.is_redirect() && (e.is_timeout() || e.is_connect() || e.is_body() || e.is_request())
            }
            FetchError::HttpStatus { status } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// The reason recorded on a job that failed with this error
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            FetchError::Cancelled => FailureReason::Cancelled,
            FetchError::HttpStatus { status } => FailureReason::HttpStatus(*status),
            FetchError::Network(e) if e.is_redirect() => FailureReason::TooManyRedirects,
            FetchError::SizeMismatch { expected, actual } => FailureReason::SizeMismatch {
                expected: *expected,
                actual: *actual,
            },
            FetchError::UnsupportedSource(uri) => FailureReason::UnsupportedSource(uri.clone()),
            FetchError::Io(e) => FailureReason::FileError(e.to_string()),
            other => FailureReason::Unknown(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        FetchError::Serialization(error.to_string())
    }
}
