//! # Error Types
//!
//! Domain-specific error types for till-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  till-core errors (this file)                                          │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  till-store errors (separate crate)                                    │
//! │  └── StoreError       - Record store operation failures                │
//! │                                                                         │
//! │  till-sync errors (separate crate)                                     │
//! │  └── SyncError        - Queue / orchestration / conflict failures      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → external consumer     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (receipt number, id, etc.)
//! 3. Errors are enum variants, never String
//! 4. Each error variant maps to a user-facing message

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// These errors represent business rule violations or domain logic failures.
/// They should be caught and translated to user-friendly messages.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Transaction cannot be found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Transaction is not in a state that allows the requested operation.
    ///
    /// ## When This Occurs
    /// - Trying to mutate a transaction that is already `synced`
    /// - Trying to pull a `syncing` transaction into a second batch
    #[error("Transaction {id} is {current_status}, cannot perform operation")]
    InvalidTransactionStatus { id: String, current_status: String },

    /// The offline queue has reached its capacity limit.
    ///
    /// ## User Workflow
    /// ```text
    /// Complete Sale (offline)
    ///      │
    ///      ▼
    /// Queue holds 500 unsynced transactions
    ///      │
    ///      ▼
    /// QueueFull { capacity: 500 }
    ///      │
    ///      ▼
    /// UI shows: "Offline queue is full, reconnect to sync"
    /// ```
    #[error("Offline queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Transaction has more line items than allowed.
    #[error("Transaction cannot have more than {max} line items")]
    TooManyItems { max: usize },

    /// Payment amount is invalid.
    #[error("Invalid payment amount: {reason}")]
    InvalidPaymentAmount { reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These errors occur when a recorded sale doesn't meet requirements.
/// Used for early validation before the transaction is persisted.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Monetary amounts disagree with each other.
    ///
    /// ## When This Occurs
    /// - line_total ≠ quantity × unit_price
    /// - total ≠ subtotal - discount + tax
    /// - cash tendered below the transaction total
    #[error("{field} is inconsistent: {reason}")]
    Inconsistent { field: String, reason: String },

    /// Invalid format (e.g., invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::QueueFull { capacity: 500 };
        assert_eq!(err.to_string(), "Offline queue is full (capacity 500)");

        let err = CoreError::InvalidTransactionStatus {
            id: "txn-1".to_string(),
            current_status: "synced".to_string(),
        };
        assert!(err.to_string().contains("txn-1"));
        assert!(err.to_string().contains("synced"));
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "store_id".to_string(),
        };
        assert_eq!(err.to_string(), "store_id is required");

        let err = ValidationError::Inconsistent {
            field: "total".to_string(),
            reason: "does not equal subtotal - discount + tax".to_string(),
        };
        assert!(err.to_string().contains("total"));
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "store_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
