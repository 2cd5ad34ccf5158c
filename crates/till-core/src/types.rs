//! # Domain Types
//!
//! Core domain types used throughout the Till POS offline engine.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌───────────────────┐   ┌─────────────────┐   ┌─────────────────┐     │
//! │  │ QueuedTransaction │   │TransactionBatch │   │ ConflictRecord  │     │
//! │  │  ───────────────  │   │  ─────────────  │   │  ─────────────  │     │
//! │  │  id (UUID)        │   │  id (UUID)      │   │  id             │     │
//! │  │  receipt_number   │   │  priority       │   │  conflict_type  │     │
//! │  │  sync_status      │   │  transactions   │   │  severity       │     │
//! │  │  priority         │   │  estimated ms   │   │  client/server  │     │
//! │  └───────────────────┘   └─────────────────┘   └─────────────────┘     │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SyncStatus    │   │  SyncPriority   │   │  QualityLevel   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Pending        │   │  High           │   │  Excellent      │       │
//! │  │  Syncing        │   │  Medium         │   │  Good / Fair    │       │
//! │  │  Synced         │   │  Low            │   │  Poor           │       │
//! │  │  Failed         │   └─────────────────┘   │  Offline        │       │
//! │  │  Conflict       │                         └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every queued transaction has:
//! - `id`: UUID v4 - immutable, used for store relations and retry keying
//! - `receipt_number`: strictly increasing per terminal, human-readable,
//!   used downstream as an idempotency key (printing, notifications)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use ts_rs::TS;

use crate::money::Money;

// =============================================================================
// Sync Status
// =============================================================================

/// Lifecycle status of a queued transaction.
///
/// ## State Machine
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                                                                         │
/// │   enqueue          batch claim          remote ok                       │
/// │  ────────► Pending ───────────► Syncing ─────────► Synced (terminal)   │
/// │               ▲                   │  │                                  │
/// │               │      remote err   │  │  server conflict                │
/// │               │                   ▼  ▼                                 │
/// │               │                Failed  Conflict                        │
/// │               │                   │       │                            │
/// │               └── retry claim ────┘       └── resolution re-queues     │
/// │                                                                         │
/// │  The Pending/Failed → Syncing flip is the mutual-exclusion primitive:  │
/// │  a transaction already Syncing can never enter a second batch.         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Recorded locally, waiting for a sync cycle.
    Pending,
    /// Claimed by an active batch or retry; in flight to the server.
    Syncing,
    /// Acknowledged by the server. Terminal: immutable apart from the
    /// server-assigned identifier.
    Synced,
    /// Last attempt failed; eligible for retry unless permanent.
    Failed,
    /// Server reported a data conflict; owned by the conflict engine.
    Conflict,
}

impl SyncStatus {
    /// Canonical string form (used for store index columns).
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }

    /// Returns true if the transaction still needs reconciliation.
    pub const fn is_unsynced(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }

    /// Returns true if the transaction can be claimed into a batch.
    pub const fn is_claimable(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(format!("unknown sync status: '{other}'")),
        }
    }
}

// =============================================================================
// Sync Priority
// =============================================================================

/// Reconciliation priority tier for a queued transaction.
///
/// Tiers are fully drained high → medium → low within one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncPriority {
    High,
    Medium,
    Low,
}

impl SyncPriority {
    /// Canonical string form (used for store index columns).
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncPriority::High => "high",
            SyncPriority::Medium => "medium",
            SyncPriority::Low => "low",
        }
    }

    /// Numeric rank for ordering (higher = more urgent).
    pub const fn rank(&self) -> u8 {
        match self {
            SyncPriority::High => 3,
            SyncPriority::Medium => 2,
            SyncPriority::Low => 1,
        }
    }

    /// Assigns the priority for a completed sale.
    ///
    /// ## Rules
    /// - Cash payment → high (physical money needs immediate reconciliation)
    /// - Total above the configured threshold → medium
    /// - Everything else (card, e-wallet) → low
    pub fn for_sale(method: PaymentMethod, total: Money, medium_threshold: Money) -> Self {
        if method == PaymentMethod::Cash {
            SyncPriority::High
        } else if total > medium_threshold {
            SyncPriority::Medium
        } else {
            SyncPriority::Low
        }
    }
}

impl std::fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(SyncPriority::High),
            "medium" => Ok(SyncPriority::Medium),
            "low" => Ok(SyncPriority::Low),
            other => Err(format!("unknown sync priority: '{other}'")),
        }
    }
}

// =============================================================================
// Payment Method
// =============================================================================

/// How the customer paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Physical cash payment.
    Cash,
    /// Card payment on external terminal.
    Card,
    /// Mobile wallet / QR payment.
    EWallet,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethod::Cash => write!(f, "cash"),
            PaymentMethod::Card => write!(f, "card"),
            PaymentMethod::EWallet => write!(f, "e_wallet"),
        }
    }
}

// =============================================================================
// Failure Kind
// =============================================================================

/// Classification of the last sync failure, persisted on the transaction.
///
/// ## Taxonomy
/// ```text
/// Network / Timeout / Server (5xx)  → retryable, backoff + attempt count
/// Validation / Rejected (4xx)       → permanent, needs manual attention
/// Conflict                          → routed to the conflict engine
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection-level failure (DNS, refused, reset).
    Network,
    /// The remote call timed out.
    Timeout,
    /// Server-side failure (5xx).
    Server,
    /// The server rejected the payload as invalid (4xx / validation).
    Validation,
    /// The server reported a data conflict.
    Conflict,
    /// Unclassified failure.
    Unknown,
}

impl FailureKind {
    /// Returns true if a failure of this kind should be retried
    /// automatically.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Network | FailureKind::Timeout | FailureKind::Server | FailureKind::Unknown
        )
    }

    /// Returns true if this failure requires manual correction.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, FailureKind::Validation)
    }
}

// =============================================================================
// Line Item
// =============================================================================

/// A line item in a queued sale.
/// Uses snapshot pattern: product data is frozen at time of sale.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LineItem {
    /// Product reference.
    pub product_id: String,
    /// Optional variation (size, flavor) reference.
    pub variation_id: Option<String>,
    /// Product name at time of sale (frozen).
    pub name: String,
    /// Quantity sold.
    pub quantity: i64,
    /// Unit price in cents at time of sale (frozen).
    pub unit_price_cents: i64,
    /// Line total (unit_price × quantity).
    pub line_total_cents: i64,
    /// Optional category for reporting.
    pub category: Option<String>,
    /// Optional SKU snapshot.
    pub sku: Option<String>,
}

impl LineItem {
    /// Returns the unit price as Money.
    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }

    /// Returns the line total as Money.
    #[inline]
    pub fn line_total(&self) -> Money {
        Money::from_cents(self.line_total_cents)
    }
}

// =============================================================================
// Transaction Draft
// =============================================================================

/// A completed sale as recorded by the terminal, before the queue assigns
/// engine-owned fields (id, receipt number, status, priority).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransactionDraft {
    pub store_id: String,
    pub user_id: String,
    pub shift_id: String,
    pub customer_id: Option<String>,

    /// Line items with frozen product data.
    pub items: Vec<LineItem>,

    // Financial totals (cents)
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub tendered_cents: i64,
    pub change_cents: Option<i64>,

    /// How the customer paid.
    pub payment_method: PaymentMethod,
    /// Payment processor details (auth codes, wallet refs).
    #[ts(type = "any")]
    pub payment_details: Option<serde_json::Value>,

    // Order metadata
    pub order_type: Option<String>,
    pub delivery_platform: Option<String>,
    pub delivery_order_number: Option<String>,
}

// =============================================================================
// Queued Transaction
// =============================================================================

/// A sale recorded while offline, awaiting reconciliation with the server.
///
/// ## Lifecycle
/// Created the instant a sale completes offline; mutated only by the sync
/// orchestrator (status transitions) and the conflict engine (conflict
/// data); deleted by the retention sweep once synced and older than the
/// configured window.
///
/// ## Invariant
/// Once `sync_status == Synced` the record is immutable except for the
/// server-assigned identifier.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueuedTransaction {
    /// Stable unique identifier (UUID v4).
    pub id: String,
    /// Strictly increasing, unique-per-terminal receipt number.
    /// Downstream collaborators use this as an idempotency key.
    pub receipt_number: String,
    /// When the sale completed.
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    pub store_id: String,
    pub user_id: String,
    pub shift_id: String,
    pub customer_id: Option<String>,
    /// Terminal that recorded the sale.
    pub device_id: Option<String>,

    /// Line items with frozen product data.
    pub items: Vec<LineItem>,

    // Financial totals (cents)
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub tendered_cents: i64,
    pub change_cents: Option<i64>,

    pub payment_method: PaymentMethod,
    #[ts(type = "any")]
    pub payment_details: Option<serde_json::Value>,

    // Order metadata
    pub order_type: Option<String>,
    pub delivery_platform: Option<String>,
    pub delivery_order_number: Option<String>,

    // Sync management
    pub sync_status: SyncStatus,
    /// Number of sync attempts. Never decreases.
    pub sync_attempts: u32,
    #[ts(as = "Option<String>")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Last error text, if the last attempt failed.
    pub last_error: Option<String>,
    /// Classification of the last failure.
    pub last_error_kind: Option<FailureKind>,

    /// Reconciliation priority tier.
    pub priority: SyncPriority,
    /// Network quality level observed at enqueue time.
    pub network_quality: Option<String>,

    /// Server-assigned identifier, recorded once synced.
    pub server_id: Option<String>,

    /// Conflict annotation, set by the conflict engine.
    pub conflict: Option<ConflictAnnotation>,
}

impl QueuedTransaction {
    /// Returns the transaction total as Money.
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    /// Returns true if this transaction has been permanently failed:
    /// either its last failure was non-retryable, or it has exhausted
    /// the retry ceiling.
    pub fn is_permanently_failed(&self, retry_ceiling: u32) -> bool {
        if self.sync_status != SyncStatus::Failed {
            return false;
        }
        self.sync_attempts >= retry_ceiling
            || self.last_error_kind.map(|k| k.is_permanent()).unwrap_or(false)
    }
}

/// Summary of the conflict state attached to a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictAnnotation {
    /// Category of the most severe detected conflict.
    pub conflict_type: ConflictType,
    /// Strategy chosen when the conflict was resolved.
    pub resolution_strategy: Option<ResolutionStrategy>,
    /// When resolution completed.
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Transaction Batch
// =============================================================================

/// An ephemeral grouping of same-priority transactions selected for a
/// single sync attempt.
///
/// A transaction belongs to at most one *active* batch at a time: batch
/// creation atomically flips members to `Syncing`, and only
/// `Pending`/`Failed` transactions are eligible for selection.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransactionBatch {
    pub id: String,
    pub priority: SyncPriority,
    /// Members, ordered by creation time ascending.
    pub transactions: Vec<QueuedTransaction>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    /// Estimated time to sync this batch, in milliseconds.
    pub estimated_sync_ms: u64,
}

impl TransactionBatch {
    /// Number of transactions in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Returns true if the batch is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

// =============================================================================
// Conflict Types
// =============================================================================

/// Category of a detected client/server disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Inventory,
    Pricing,
    Customer,
    Product,
    Discount,
    Other,
}

impl ConflictType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictType::Inventory => "inventory",
            ConflictType::Pricing => "pricing",
            ConflictType::Customer => "customer",
            ConflictType::Product => "product",
            ConflictType::Discount => "discount",
            ConflictType::Other => "other",
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a detected conflict, drives rule-table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Critical => "critical",
        }
    }

    /// Severity of an inventory conflict: stock exhausted is critical,
    /// anything else is high (the server's stock count is authoritative).
    pub const fn for_inventory(available_quantity: i64) -> Self {
        if available_quantity == 0 {
            ConflictSeverity::Critical
        } else {
            ConflictSeverity::High
        }
    }

    /// Severity of a pricing conflict from the percentage delta between
    /// the client and server price: >20% critical, >10% high, else medium.
    pub fn for_price_delta(percentage_delta: f64) -> Self {
        if percentage_delta > 20.0 {
            ConflictSeverity::Critical
        } else if percentage_delta > 10.0 {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        }
    }

    /// Severity of a product conflict: discontinued products are critical.
    pub const fn for_product(discontinued: bool) -> Self {
        if discontinued {
            ConflictSeverity::Critical
        } else {
            ConflictSeverity::High
        }
    }
}

impl std::fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Copy the server value (authoritative data).
    ServerWins,
    /// Keep the client value.
    ClientWins,
    /// Combine both via a type-specific merge function.
    Merge,
    /// Suspend resolution behind an external user decision.
    UserPrompt,
    /// Mark resolved with no data change.
    Skip,
    /// Leave the conflict and its transaction for the next cycle.
    RetryLater,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::ServerWins => write!(f, "server_wins"),
            ResolutionStrategy::ClientWins => write!(f, "client_wins"),
            ResolutionStrategy::Merge => write!(f, "merge"),
            ResolutionStrategy::UserPrompt => write!(f, "user_prompt"),
            ResolutionStrategy::Skip => write!(f, "skip"),
            ResolutionStrategy::RetryLater => write!(f, "retry_later"),
        }
    }
}

/// One detected disagreement between local and server state.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictRecord {
    pub id: String,
    /// The transaction the conflict was detected on.
    pub transaction_id: String,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    /// The value the client expected.
    #[ts(type = "any")]
    pub client_data: serde_json::Value,
    /// The value the server holds.
    #[ts(type = "any")]
    pub server_data: serde_json::Value,
    #[ts(as = "String")]
    pub detected_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Strategy that settled the conflict.
    pub resolution_strategy: Option<ResolutionStrategy>,
    /// The winning data after resolution.
    #[ts(type = "any")]
    pub resolution_data: Option<serde_json::Value>,
    /// True when resolution happened without user input.
    pub auto_resolved: bool,
}

impl ConflictRecord {
    /// Returns true if the conflict is still awaiting resolution.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.resolved_at.is_none()
    }
}

// =============================================================================
// Network Quality
// =============================================================================

/// Discrete connectivity quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Offline,
}

impl QualityLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::Offline => "offline",
        }
    }

    /// Classifies link quality from round-trip time (ms) and bandwidth
    /// (Mbps). Either signal may be missing; no signal at all while
    /// online defaults to `Fair`.
    ///
    /// ## Thresholds
    /// ```text
    /// RTT < 50ms  && bandwidth > 5 Mbps → Excellent
    /// RTT < 100ms && bandwidth > 2 Mbps → Good
    /// RTT < 200ms && bandwidth > 1 Mbps → Fair
    /// otherwise                         → Poor
    /// ```
    pub fn classify(rtt_ms: Option<f64>, bandwidth_mbps: Option<f64>) -> Self {
        match (rtt_ms, bandwidth_mbps) {
            (Some(rtt), Some(bw)) => {
                if rtt < 50.0 && bw > 5.0 {
                    QualityLevel::Excellent
                } else if rtt < 100.0 && bw > 2.0 {
                    QualityLevel::Good
                } else if rtt < 200.0 && bw > 1.0 {
                    QualityLevel::Fair
                } else {
                    QualityLevel::Poor
                }
            }
            (Some(rtt), None) => {
                if rtt < 50.0 {
                    QualityLevel::Excellent
                } else if rtt < 100.0 {
                    QualityLevel::Good
                } else if rtt < 200.0 {
                    QualityLevel::Fair
                } else {
                    QualityLevel::Poor
                }
            }
            (None, Some(bw)) => {
                if bw > 5.0 {
                    QualityLevel::Excellent
                } else if bw > 2.0 {
                    QualityLevel::Good
                } else if bw > 1.0 {
                    QualityLevel::Fair
                } else {
                    QualityLevel::Poor
                }
            }
            (None, None) => QualityLevel::Fair,
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time network quality classification.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QualityObservation {
    pub level: QualityLevel,
    /// Round-trip time in milliseconds, when measured.
    pub rtt_ms: Option<f64>,
    /// Bandwidth estimate in Mbps, when measured.
    pub bandwidth_mbps: Option<f64>,
    #[ts(as = "String")]
    pub sampled_at: DateTime<Utc>,
}

impl QualityObservation {
    /// Builds an observation from raw measurements, classifying the level.
    pub fn from_sample(rtt_ms: Option<f64>, bandwidth_mbps: Option<f64>, now: DateTime<Utc>) -> Self {
        QualityObservation {
            level: QualityLevel::classify(rtt_ms, bandwidth_mbps),
            rtt_ms,
            bandwidth_mbps,
            sampled_at: now,
        }
    }

    /// An offline observation (no connectivity).
    pub fn offline(now: DateTime<Utc>) -> Self {
        QualityObservation {
            level: QualityLevel::Offline,
            rtt_ms: None,
            bandwidth_mbps: None,
            sampled_at: now,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
    pub conflict: u64,
    pub high_priority: u64,
    pub medium_priority: u64,
    pub low_priority: u64,
    #[ts(as = "Option<String>")]
    pub oldest: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub newest: Option<DateTime<Utc>>,
    /// Estimated total remaining sync time for pending+failed work, ms.
    pub estimated_sync_ms: u64,
}

impl QueueStats {
    /// Transactions that a sync cycle would try to reconcile.
    #[inline]
    pub fn reconcilable(&self) -> u64 {
        self.pending + self.failed
    }
}

/// Aggregate conflict statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictStats {
    pub total: u64,
    pub resolved: u64,
    pub pending: u64,
    pub auto_resolved: u64,
    pub user_resolved: u64,
    /// Conflicts currently suspended behind a user prompt.
    pub pending_prompts: u64,
    pub by_type: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Synced,
            SyncStatus::Failed,
            SyncStatus::Conflict,
        ] {
            let parsed: SyncStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_priority_for_sale() {
        let threshold = Money::from_cents(100_000);

        // Cash always wins, regardless of amount
        assert_eq!(
            SyncPriority::for_sale(PaymentMethod::Cash, Money::from_cents(100), threshold),
            SyncPriority::High
        );

        // Large non-cash → medium
        assert_eq!(
            SyncPriority::for_sale(PaymentMethod::Card, Money::from_cents(150_000), threshold),
            SyncPriority::Medium
        );

        // Small non-cash → low
        assert_eq!(
            SyncPriority::for_sale(PaymentMethod::EWallet, Money::from_cents(5_000), threshold),
            SyncPriority::Low
        );

        // Exactly at the threshold is NOT above it
        assert_eq!(
            SyncPriority::for_sale(PaymentMethod::Card, Money::from_cents(100_000), threshold),
            SyncPriority::Low
        );
    }

    #[test]
    fn test_failure_kind_classification() {
        assert!(FailureKind::Network.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::Server.is_retryable());
        assert!(FailureKind::Unknown.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());

        assert!(FailureKind::Validation.is_permanent());
        assert!(!FailureKind::Network.is_permanent());
    }

    #[test]
    fn test_quality_classification_combined() {
        assert_eq!(
            QualityLevel::classify(Some(30.0), Some(10.0)),
            QualityLevel::Excellent
        );
        assert_eq!(
            QualityLevel::classify(Some(80.0), Some(3.0)),
            QualityLevel::Good
        );
        assert_eq!(
            QualityLevel::classify(Some(150.0), Some(1.5)),
            QualityLevel::Fair
        );
        assert_eq!(
            QualityLevel::classify(Some(500.0), Some(0.5)),
            QualityLevel::Poor
        );
        // Fast RTT but starved bandwidth is not excellent
        assert_eq!(
            QualityLevel::classify(Some(30.0), Some(0.5)),
            QualityLevel::Poor
        );
    }

    #[test]
    fn test_quality_classification_partial_signals() {
        assert_eq!(QualityLevel::classify(Some(40.0), None), QualityLevel::Excellent);
        assert_eq!(QualityLevel::classify(None, Some(6.0)), QualityLevel::Excellent);
        assert_eq!(QualityLevel::classify(Some(250.0), None), QualityLevel::Poor);
        // No signal at all defaults to fair
        assert_eq!(QualityLevel::classify(None, None), QualityLevel::Fair);
    }

    #[test]
    fn test_severity_derivations() {
        assert_eq!(ConflictSeverity::for_inventory(0), ConflictSeverity::Critical);
        assert_eq!(ConflictSeverity::for_inventory(3), ConflictSeverity::High);

        assert_eq!(ConflictSeverity::for_price_delta(25.0), ConflictSeverity::Critical);
        assert_eq!(ConflictSeverity::for_price_delta(15.0), ConflictSeverity::High);
        assert_eq!(ConflictSeverity::for_price_delta(5.0), ConflictSeverity::Medium);

        assert_eq!(ConflictSeverity::for_product(true), ConflictSeverity::Critical);
        assert_eq!(ConflictSeverity::for_product(false), ConflictSeverity::High);
    }

    #[test]
    fn test_permanently_failed() {
        let mut txn = sample_txn();
        txn.sync_status = SyncStatus::Failed;
        txn.sync_attempts = 5;
        txn.last_error_kind = Some(FailureKind::Network);
        assert!(txn.is_permanently_failed(5));

        txn.sync_attempts = 2;
        assert!(!txn.is_permanently_failed(5));

        txn.last_error_kind = Some(FailureKind::Validation);
        assert!(txn.is_permanently_failed(5));

        txn.sync_status = SyncStatus::Pending;
        assert!(!txn.is_permanently_failed(5));
    }

    fn sample_txn() -> QueuedTransaction {
        QueuedTransaction {
            id: "txn-1".into(),
            receipt_number: "OFF000001".into(),
            created_at: Utc::now(),
            store_id: "store-1".into(),
            user_id: "user-1".into(),
            shift_id: "shift-1".into(),
            customer_id: None,
            device_id: None,
            items: vec![],
            subtotal_cents: 0,
            tax_cents: 0,
            discount_cents: 0,
            total_cents: 0,
            tendered_cents: 0,
            change_cents: None,
            payment_method: PaymentMethod::Cash,
            payment_details: None,
            order_type: None,
            delivery_platform: None,
            delivery_order_number: None,
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_attempt_at: None,
            last_error: None,
            last_error_kind: None,
            priority: SyncPriority::High,
            network_quality: None,
            server_id: None,
            conflict: None,
        }
    }
}
