//! Error types for audit-sync
//!
//! This module provides the error taxonomy for a sync run:
//! - Transient delivery failures (retryable sink statuses, network hiccups)
//! - Fatal delivery failures (non-retryable status, retry budget exhausted)
//! - Clock/schedule violations (a computed window starting in the future)
//! - Fetch-layer partial failures surfaced as explicit outcomes
//! - Store and configuration errors

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for audit-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for audit-sync
///
/// Any error raised before the checkpoint writer runs is terminal for the run:
/// nothing is committed and the next run re-derives the same (or an overlapping)
/// fetch target.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "sources[0].batch_size")
        key: Option<String>,
    },

    /// Checkpoint/dedup store operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Delivery to the sink failed
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Fetching from the vendor API failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// The persisted schedule has gotten ahead of real time
    #[error("fetch window {start} - {end} is in the future (now: {now})")]
    FutureWindow {
        /// Computed window start
        start: DateTime<Utc>,
        /// Computed window end
        end: DateTime<Utc>,
        /// Wall-clock time the window was computed at
        now: DateTime<Utc>,
    },

    /// Another run for the same source is still active
    #[error("a run for source {0} is already in progress")]
    RunInProgress(String),

    /// No source registered under this id
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// Store key is not a safe identifier
    #[error("invalid store key {0:?}: expected 1-48 chars of [a-z0-9_] starting with a letter")]
    InvalidStoreKey(String),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Sink delivery errors
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The sink answered with a non-success status
    #[error("sink {url} returned status {status}: {body}")]
    Status {
        /// HTTP status code returned by the sink
        status: u16,
        /// Endpoint that was called
        url: String,
        /// Response body (truncated)
        body: String,
        /// Whether the status is in the configured transient set
        transient: bool,
    },
}

/// Fetch-layer errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// Pagination stopped early and the source is configured to treat that as fatal
    #[error("partial fetch for source {source_id}: pagination failed after {collected} events")]
    Partial {
        /// Source whose fetch was truncated
        source_id: String,
        /// Events collected before the failing page
        collected: usize,
    },

    /// Vendor adapter reported an error
    #[error("vendor error: {0}")]
    Vendor(String),
}

impl Error {
    /// Machine-readable error code, used in logs and run summaries
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Delivery(DeliveryError::Status {
                transient: true, ..
            }) => "delivery_transient",
            Error::Delivery(DeliveryError::Status { .. }) => "delivery_rejected",
            Error::Fetch(FetchError::Partial { .. }) => "partial_fetch",
            Error::Fetch(FetchError::Vendor(_)) => "vendor_error",
            Error::FutureWindow { .. } => "future_window",
            Error::RunInProgress(_) => "run_in_progress",
            Error::UnknownSource(_) => "unknown_source",
            Error::InvalidStoreKey(_) => "invalid_store_key",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Shorthand for a configuration error tied to a key
    pub(crate) fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Wrap a sqlx failure with context about the query that failed
    pub(crate) fn query(context: &str, e: sqlx::Error) -> Self {
        Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
    }
}
