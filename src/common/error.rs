//! Error types for pageshard

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Routing Errors ===
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    // === Lock Errors ===
    #[error("Lock not acquired on {key} within {waited_ms}ms")]
    LockAcquisition { key: String, waited_ms: u64 },

    #[error("Lock broker unavailable: {0}")]
    LockBrokerUnavailable(String),

    // === Migration Errors ===
    #[error("Status transition conflict on page {page_id}: {detail}")]
    StatusTransitionConflict { page_id: String, detail: String },

    #[error("Illegal status transition on page {page_id}: {from} -> {to}")]
    IllegalStatusTransition {
        page_id: String,
        from: String,
        to: String,
    },

    #[error("Data integrity mismatch on page {page_id}: {detail}")]
    DataIntegrityMismatch { page_id: String, detail: String },

    #[error("Source cleanup failed for page {page_id}: {reason}")]
    SourceCleanupFailed { page_id: String, reason: String },

    #[error("Transient failure: {0}")]
    Transient(String),

    // === Storage Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Write attempted inside a read-only transaction")]
    ReadOnlyTransaction,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

/// How the orchestrator reacts to a failed migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Someone else already moved the page. Not an error.
    Skip,
    /// Lock held elsewhere; leave the page eligible for a later pass.
    Busy,
    /// Count against the per-page retry budget.
    Retry,
    /// Mutual exclusion can no longer be guaranteed; stop the run.
    AbortRun,
    /// Give up on this page for the current run and mark it FAILED.
    Fatal,
}

impl Error {
    /// Classify the error for the batch loop.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::StatusTransitionConflict { .. } => FailureKind::Skip,
            Error::LockAcquisition { .. } => FailureKind::Busy,
            Error::LockBrokerUnavailable(_) => FailureKind::AbortRun,
            Error::InvalidIdentifier(_)
            | Error::SourceCleanupFailed { .. }
            | Error::IllegalStatusTransition { .. }
            | Error::InvalidConfig(_)
            | Error::Config(_)
            | Error::ReadOnlyTransaction => FailureKind::Fatal,
            _ => FailureKind::Retry,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidIdentifier(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::StatusTransitionConflict { .. } => StatusCode::CONFLICT,
            Error::LockAcquisition { .. } => StatusCode::REQUEST_TIMEOUT,
            Error::LockBrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
