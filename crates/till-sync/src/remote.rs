//! # Remote Sync Interface
//!
//! The boundary between the engine and the central backend. The engine
//! never speaks a wire format itself; it is handed a [`RemoteSync`]
//! implementation and exchanges normalized payloads through it.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Remote Sync Contract                              │
//! │                                                                         │
//! │  push_transaction(TransactionPayload)                                  │
//! │       │                                                                 │
//! │       ├── Ok(ServerAck { server_id })          → mark synced           │
//! │       │                                                                 │
//! │       └── Err(RemoteError)                                             │
//! │             ├── Network / Timeout / Server(5xx) → retryable failure    │
//! │             ├── Validation / Rejected(4xx)      → permanent failure    │
//! │             └── Conflict(ConflictReport)        → conflict engine      │
//! │                                                                         │
//! │  ping() → ProbeSample { rtt, bandwidth }        → network monitor      │
//! │                                                                         │
//! │  The conflict payload is a CLOSED shape: unrecognized server fields    │
//! │  fail deserialization loudly instead of being silently dropped.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use till_core::{FailureKind, QueuedTransaction};

// =============================================================================
// Remote Sync Trait
// =============================================================================

/// The remote backend, as seen by the engine.
///
/// Implementations own the wire format (REST, gRPC, whatever the backend
/// speaks); tests substitute scripted fakes through the same constructor
/// parameters production uses.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Submits one offline transaction for reconciliation.
    async fn push_transaction(&self, payload: TransactionPayload)
        -> Result<ServerAck, RemoteError>;

    /// Probes the link, returning measured round-trip time and an
    /// optional bandwidth estimate.
    async fn ping(&self) -> Result<ProbeSample, RemoteError>;
}

/// Successful acknowledgement of a pushed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAck {
    /// Server-assigned transaction identifier.
    pub server_id: String,
}

/// One connectivity probe result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbeSample {
    /// Measured round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Bandwidth estimate in Mbps, when the probe can measure it.
    pub bandwidth_mbps: Option<f64>,
}

// =============================================================================
// Transaction Payload
// =============================================================================

/// A line item as sent to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadItem {
    pub product_id: String,
    pub variation_id: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
}

/// Marker identifying a payload as an offline reconciliation, carrying
/// the local identity so the server can deduplicate replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMarker {
    /// Local queue id of the transaction.
    pub local_id: String,
    /// Terminal receipt number (the downstream idempotency key).
    pub receipt_number: String,
    /// When the sale was recorded on the terminal.
    pub recorded_at: DateTime<Utc>,
}

/// Normalized transaction payload for the remote sync call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub store_id: String,
    pub user_id: String,
    pub shift_id: String,
    pub customer_id: Option<String>,

    pub items: Vec<PayloadItem>,

    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub tendered_cents: i64,
    pub change_cents: Option<i64>,

    pub payment_method: String,
    pub payment_details: Option<serde_json::Value>,

    pub order_type: Option<String>,
    pub delivery_platform: Option<String>,
    pub delivery_order_number: Option<String>,

    /// Always present: every payload this engine sends is an offline
    /// reconciliation.
    pub offline: OfflineMarker,
}

impl TransactionPayload {
    /// Normalizes a queued transaction into the remote payload shape.
    pub fn from_transaction(txn: &QueuedTransaction) -> Self {
        TransactionPayload {
            store_id: txn.store_id.clone(),
            user_id: txn.user_id.clone(),
            shift_id: txn.shift_id.clone(),
            customer_id: txn.customer_id.clone(),
            items: txn
                .items
                .iter()
                .map(|item| PayloadItem {
                    product_id: item.product_id.clone(),
                    variation_id: item.variation_id.clone(),
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                    line_total_cents: item.line_total_cents,
                })
                .collect(),
            subtotal_cents: txn.subtotal_cents,
            tax_cents: txn.tax_cents,
            discount_cents: txn.discount_cents,
            total_cents: txn.total_cents,
            tendered_cents: txn.tendered_cents,
            change_cents: txn.change_cents,
            payment_method: txn.payment_method.to_string(),
            payment_details: txn.payment_details.clone(),
            order_type: txn.order_type.clone(),
            delivery_platform: txn.delivery_platform.clone(),
            delivery_order_number: txn.delivery_order_number.clone(),
            offline: OfflineMarker {
                local_id: txn.id.clone(),
                receipt_number: txn.receipt_number.clone(),
                recorded_at: txn.created_at,
            },
        }
    }
}

// =============================================================================
// Remote Errors
// =============================================================================

/// Structured failure of a remote sync call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection-level failure (DNS, refused, reset).
    #[error("Network failure: {0}")]
    Network(String),

    /// The call did not complete in time.
    #[error("Remote call timed out")]
    Timeout,

    /// Server-side failure (5xx).
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The server rejected the payload as invalid.
    #[error("Validation rejected: {message}")]
    Validation { message: String },

    /// Other client-side rejection (4xx).
    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The server accepted the shape but reported data conflicts.
    #[error("Server reported {} conflict(s)", .0.len())]
    Conflict(ConflictReport),
}

impl RemoteError {
    /// Maps this error to the persisted failure classification.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RemoteError::Network(_) => FailureKind::Network,
            RemoteError::Timeout => FailureKind::Timeout,
            RemoteError::Server { .. } => FailureKind::Server,
            RemoteError::Validation { .. } | RemoteError::Rejected { .. } => {
                FailureKind::Validation
            }
            RemoteError::Conflict(_) => FailureKind::Conflict,
        }
    }

    /// Returns true if the operation can be retried automatically.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_retryable()
    }
}

// =============================================================================
// Conflict Report (closed tagged payload)
// =============================================================================

/// Structured conflict payload from the server.
///
/// The shape is CLOSED (`deny_unknown_fields`): a server that starts
/// sending a conflict category this engine does not know about fails the
/// sync loudly instead of having its data silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConflictReport {
    #[serde(default)]
    pub inventory_conflicts: Vec<InventoryConflict>,
    #[serde(default)]
    pub pricing_conflicts: Vec<PricingConflict>,
    #[serde(default)]
    pub customer_conflicts: Vec<CustomerConflict>,
    #[serde(default)]
    pub product_conflicts: Vec<ProductConflict>,
}

impl ConflictReport {
    /// Total number of reported conflicts.
    pub fn len(&self) -> usize {
        self.inventory_conflicts.len()
            + self.pricing_conflicts.len()
            + self.customer_conflicts.len()
            + self.product_conflicts.len()
    }

    /// Returns true if the server reported no conflicts at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stock disagreement: the terminal sold what the server says it no
/// longer has.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryConflict {
    pub product_id: String,
    /// Quantity the terminal sold.
    pub requested_quantity: i64,
    /// Stock level the terminal believed it had.
    pub expected_available: i64,
    /// Stock level the server holds.
    pub available_quantity: i64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Price disagreement between the terminal snapshot and the server
/// catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConflict {
    pub product_id: String,
    /// Unit price the terminal charged (cents).
    pub client_price_cents: i64,
    /// Unit price the server catalog holds (cents).
    pub server_price_cents: i64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PricingConflict {
    /// Percentage delta between client and server price, relative to the
    /// server price.
    pub fn percentage_delta(&self) -> f64 {
        if self.server_price_cents == 0 {
            return 100.0;
        }
        let diff = (self.client_price_cents - self.server_price_cents).abs() as f64;
        diff / self.server_price_cents as f64 * 100.0
    }
}

/// Customer record disagreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomerConflict {
    pub customer_id: String,
    pub client_data: serde_json::Value,
    pub server_data: serde_json::Value,
}

/// Product catalog disagreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductConflict {
    pub product_id: String,
    /// The server has discontinued this product.
    #[serde(default)]
    pub discontinued: bool,
    pub client_data: serde_json::Value,
    pub server_data: serde_json::Value,
}

// =============================================================================
// Unit Tests
// =============================================================================
