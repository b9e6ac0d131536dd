//! Error types for quota operations.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::quota::RateLimit;

/// Main error type for quotaflow operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// A rate was exceeded; every increment of the call has been rolled back.
    #[error("Quota limit exceeded for `{}` per {}, next available at {next_available}", .limit.key, .limit.unit)]
    QuotaExceeded {
        /// The first rate found over its limit
        limit: RateLimit,
        /// End of the violated window
        next_available: DateTime<Utc>,
    },

    /// A counter identifier that does not follow `<prefix>-<millis>-<<key>>`
    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    /// The document store answered an upsert without a document.
    #[error("Record missing after upsert: namespace={namespace} key={key} ttl={ttl}")]
    RecordMissing {
        namespace: String,
        key: String,
        /// Window length in milliseconds
        ttl: i64,
    },

    /// Store replied with something the protocol did not ask for
    #[error("Backend error: {0}")]
    Backend(String),

    /// Redis transport or command errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaError {
    /// Whether this is the recoverable over-limit outcome.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, QuotaError::QuotaExceeded { .. })
    }

    /// The retry instant carried by a quota violation.
    pub fn next_available(&self) -> Option<DateTime<Utc>> {
        match self {
            QuotaError::QuotaExceeded { next_available, .. } => Some(*next_available),
            _ => None,
        }
    }
}

/// Result type alias for quotaflow operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
