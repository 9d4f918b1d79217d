//! Result and error types for the core library

use rust_decimal::Decimal;
use thiserror::Error;

/// Core library error type
///
/// `Unreachable` is the only variant callers are expected to recover from
/// locally (by switching to the offline path). Everything else propagates
/// to the outer layer verbatim.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Durable store unreachable: {0}")]
    Unreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not enough funds ({balance:.2}) for a {delta:.2} transaction")]
    InsufficientFunds { balance: Decimal, delta: Decimal },

    #[error("User #{0} is not available for offline processing")]
    UserUnavailable(i64),

    #[error("Reconciliation of {delta:.2} for user #{user_id} failed: {reason}")]
    ReconciliationFailed {
        user_id: i64,
        delta: Decimal,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an unreachable-store error
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error should send the caller down the offline path
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<duckdb::Error> for Error {
    fn from(err: duckdb::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Core library result type
pub type Result<T> = std::result::Result<T, Error>;
