//! # Record Store Error Types
//!
//! Error types for durable storage operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)          File Error (std::io::Error)       │
//! │       │                                   │                             │
//! │       ▼                                   ▼                             │
//! │  StoreError (this module) ← Adds context and categorization            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  RecordStore absorbs primary-backend failures (fallback write);        │
//! │  only a failure on BOTH backends reaches the caller                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No backend could be initialized at all.
    ///
    /// ## When This Occurs
    /// - SQLite file cannot be created AND the fallback directory is
    ///   unwritable
    #[error("No storage backend available: {0}")]
    NoBackendAvailable(String),

    /// Primary backend connection failed (store degrades to fallback).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Record payload could not be serialized or deserialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Fallback file I/O failed.
    #[error("Fallback storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Both the primary write and the fallback write failed.
    #[error("Write lost on both backends: primary: {primary}; fallback: {fallback}")]
    WriteLost { primary: String, fallback: String },

    /// Internal store error.
    #[error("Internal store error: {0}")]
    Internal(String),
}

/// Convert sqlx errors to StoreError.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                StoreError::ConnectionFailed("connection pool exhausted".to_string())
            }
            sqlx::Error::PoolClosed => StoreError::ConnectionFailed("pool is closed".to_string()),
            sqlx::Error::Database(db_err) => StoreError::QueryFailed(db_err.message().to_string()),
            other => StoreError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
