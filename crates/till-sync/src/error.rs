//! # Sync Error Types
//!
//! Error types for the offline sync engine.
//!
//! ## Error Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │       Queue             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  network/5xx →  │  │  TransactionNotFound    │ │
//! │  │  MissingDeviceId│  │    retryable    │  │  InvalidTransition      │ │
//! │  │  InvalidEndpoint│  │  4xx/validation │  │  QueueClosed            │ │
//! │  └─────────────────┘  │    → permanent  │  └─────────────────────────┘ │
//! │                       │  conflict →     │                              │
//! │  ┌─────────────────┐  │  conflict engine│  ┌─────────────────────────┐ │
//! │  │    Storage      │  └─────────────────┘  │      Conflict           │ │
//! │  │                 │                       │                         │ │
//! │  │  fallback first;│  Lock contention is   │  ConflictNotFound       │ │
//! │  │  only dual loss │  NOT an error: it is  │  NoPendingPrompt        │ │
//! │  │  surfaces       │  a defined no-op      │                         │ │
//! │  └─────────────────┘  outcome              └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use till_core::{CoreError, FailureKind, ValidationError};
use till_store::StoreError;

use crate::remote::RemoteError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all engine failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required to attribute queued sales).
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    /// Invalid remote endpoint URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// Transaction does not exist in the queue.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// A status transition that the state machine forbids.
    #[error("Transaction {id}: illegal transition {from} → {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// The queue worker has shut down.
    #[error("Transaction queue is closed")]
    QueueClosed,

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// A remote sync call failed.
    #[error("Remote sync failed: {0}")]
    Remote(#[from] RemoteError),

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    /// Conflict record does not exist.
    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    /// A user decision arrived for a conflict with no pending prompt.
    #[error("No pending user prompt for conflict {0}")]
    NoPendingPrompt(String),

    // =========================================================================
    // Wrapped Lower-Layer Errors
    // =========================================================================
    /// Durable store failure (already past the fallback).
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Domain rule violation.
    #[error("Domain error: {0}")]
    Core(#[from] CoreError),

    /// Serialization failure.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Operation requires an initialized engine.
    #[error("Offline engine not initialized")]
    NotInitialized,

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Core(CoreError::Validation(err))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns the failure classification for this error, when it maps to
    /// a per-transaction failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Remote(remote) => remote.failure_kind(),
            SyncError::Storage(_) => FailureKind::Unknown,
            SyncError::Core(_) => FailureKind::Validation,
            _ => FailureKind::Unknown,
        }
    }

    /// Returns true if this error is recoverable and the operation can be
    /// retried.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_retryable() && !matches!(self, SyncError::Core(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidEndpoint(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_categorized() {
        assert!(SyncError::MissingDeviceId.is_config_error());
        assert!(SyncError::InvalidEndpoint("nope".into()).is_config_error());
        assert!(!SyncError::QueueClosed.is_config_error());
    }

    #[test]
    fn test_remote_errors_carry_failure_kind() {
        let err = SyncError::Remote(RemoteError::Timeout);
        assert_eq!(err.failure_kind(), FailureKind::Timeout);
        assert!(err.is_retryable());

        let err = SyncError::Remote(RemoteError::Validation {
            message: "bad payload".into(),
        });
        assert_eq!(err.failure_kind(), FailureKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_wraps_into_core() {
        let err: SyncError = ValidationError::Required {
            field: "store_id".into(),
        }
        .into();
        assert!(matches!(err, SyncError::Core(CoreError::Validation(_))));
        assert!(!err.is_retryable());
    }
}
