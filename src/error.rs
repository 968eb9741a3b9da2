//! Error types for the tiered memory engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered memory engine
///
/// A missing key is not an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed key, value or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid startup settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Bounded tier cannot admit an item even after eviction
    #[error("Tier {tier} cannot admit key {key}: {reason}")]
    Capacity {
        tier: String,
        key: String,
        reason: String,
    },

    /// Backend failure
    #[error("Storage error in {backend}: {message}")]
    Storage {
        backend: String,
        message: String,
        retryable: bool,
    },

    /// Relational backend failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Deadline exceeded
    #[error("Operation {operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// The engine has been shut down
    #[error("Engine is closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Storage failure that is worth retrying once
    pub fn transient(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            backend: backend.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Storage failure that will not go away on retry
    pub fn permanent(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            backend: backend.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a single local retry may succeed
    ///
    /// Validation and configuration errors are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            Error::Io(_) => true,
            Error::Database(e) => is_transient_database_error(e),
            _ => false,
        }
    }

    /// Stable label used in metrics and batch results
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Config(_) | Error::ConfigParse(_) => "configuration",
            Error::Capacity { .. } => "capacity",
            Error::Storage { .. } | Error::Database(_) | Error::Io(_) => "storage",
            Error::Timeout { .. } => "timeout",
            Error::Serialization(_) => "serialization",
            Error::CompressionFailed { .. } | Error::DecompressionFailed { .. } => "serialization",
            Error::Closed => "closed",
            Error::Internal(_) => "internal",
        }
    }
}

fn is_transient_database_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
