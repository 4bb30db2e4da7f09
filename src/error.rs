//! Error types for trigstream operations
//!
//! A single crate-wide error enum with constructor helpers and a
//! retriability classification for transient database faults.

use thiserror::Error;

/// Errors produced by trigstream.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (prefix, column name, operation set)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue table pre-exists with a different column signature
    #[error("Queue table exists but is not valid: {0}")]
    SchemaMismatch(String),

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool error
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A user handler returned an error and handler failures are surfaced
    #[error("Handler error: {0}")]
    Handler(String),

    /// The listener connection closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new schema mismatch error
    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient faults that the reconciler or a
    /// liveness-driven reconnect can be expected to recover from.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Timeout(_) => true,
            Self::Pool(_) => true,
            Self::Postgres(e) => is_transient_pg_error(e),
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Config(_)
            | Self::SchemaMismatch(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Handler(_)
            | Self::Other(_) => false,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::Postgres(_) => "postgres_error",
            Self::Pool(_) => "pool_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Handler(_) => "handler_error",
            Self::ConnectionClosed => "connection_closed",
            Self::Timeout(_) => "timeout",
            Self::Other(_) => "unknown",
        }
    }
}

/// Check if a PostgreSQL error is transient.
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention class (57xxx) - except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
        return false;
    }

    // No SQLSTATE available: driver-level failures are connection-shaped
    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for trigstream operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("prefix must match ^[a-z_-]+$");
        assert!(err.to_string().contains("Configuration error"));

        let err = Error::schema_mismatch("column operation has type integer, expected text");
        assert!(err
            .to_string()
            .starts_with("Queue table exists but is not valid"));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(Error::ConnectionClosed.is_retriable());
        assert!(Error::timeout("5s").is_retriable());

        assert!(!Error::config("bad prefix").is_retriable());
        assert!(!Error::schema_mismatch("missing column").is_retriable());
        assert!(!Error::handler("callback failed").is_retriable());
        assert!(!Error::other("unknown").is_retriable());
    }

    #[test]
    fn test_io_retriability_by_kind() {
        let reset = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(reset.is_retriable());

        let not_found = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!not_found.is_retriable());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(Error::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(Error::config("x").error_code(), "config_error");
        assert_eq!(Error::schema_mismatch("x").error_code(), "schema_mismatch");
        assert_eq!(Error::timeout("x").error_code(), "timeout");
    }
}
