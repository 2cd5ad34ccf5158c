//! # Priority Transaction Queue
//!
//! Assigns priority to each offline transaction, allocates receipt
//! numbers, groups transactions into sync batches, and tracks
//! per-transaction retry state.
//!
//! ## Serialized Command Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Queue Worker Architecture                           │
//! │                                                                         │
//! │   QueueHandle (Clone)            QueueHandle (Clone)                   │
//! │   (orchestrator)                 (facade, conflict engine)             │
//! │        │                              │                                 │
//! │        └────────────┬─────────────────┘                                │
//! │                     │  mpsc commands + oneshot replies                 │
//! │                     ▼                                                   │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               TransactionQueue worker (ONE task)                │   │
//! │  │                                                                 │   │
//! │  │  Every mutation to every transaction funnels through here in   │   │
//! │  │  arrival order. The Pending/Failed → Syncing flip is therefore │   │
//! │  │  atomic with batch creation BY CONSTRUCTION: no transaction    │   │
//! │  │  can enter two concurrently active batches, and no             │   │
//! │  │  read-modify-write race exists between an in-memory view and   │   │
//! │  │  the backing store.                                            │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │  every write awaited                   │
//! │                               ▼                                         │
//! │                      RecordStore ("transactions")                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Priority Assignment
//! Cash → high (physical money reconciles first); total above the
//! configured threshold → medium; everything else → low.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use till_core::{
    validation, ConflictAnnotation, CoreError, FailureKind, Money, QueueStats, QueuedTransaction,
    SyncPriority, SyncStatus, TransactionBatch, TransactionDraft,
};
use till_store::{IndexField, RecordEnvelope, RecordMetadata, RecordQuery, RecordStore};

use crate::config::OfflineConfig;
use crate::error::{SyncError, SyncResult};

use std::sync::Arc;

// =============================================================================
// Collections
// =============================================================================

/// Collection holding queued transactions.
pub const TRANSACTIONS_COLLECTION: &str = "transactions";

/// Collection holding engine counters (receipt sequence).
const COUNTERS_COLLECTION: &str = "counters";

/// Record id of the receipt sequence counter.
const RECEIPT_COUNTER_ID: &str = "receipt_sequence";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReceiptCounter {
    value: u64,
}

// =============================================================================
// Settings & Events
// =============================================================================

/// Queue behavior settings, extracted from the engine config.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub device_id: String,
    pub receipt_prefix: String,
    pub medium_priority_threshold_cents: i64,
    pub retry_ceiling: u32,
    pub capacity: usize,
    pub base_sync_cost_ms: u64,
    pub per_item_sync_cost_ms: u64,
    pub retention_days: u32,
}

impl QueueSettings {
    /// Extracts queue settings from the engine configuration.
    pub fn from_config(config: &OfflineConfig) -> Self {
        QueueSettings {
            device_id: config.device.id.clone(),
            receipt_prefix: config.sync.receipt_prefix.clone(),
            medium_priority_threshold_cents: config.sync.medium_priority_threshold_cents,
            retry_ceiling: config.sync.retry_ceiling,
            capacity: config.sync.queue_capacity,
            base_sync_cost_ms: config.sync.base_sync_cost_ms,
            per_item_sync_cost_ms: config.sync.per_item_sync_cost_ms,
            retention_days: config.storage.retention_days,
        }
    }
}

/// Fired exactly once per transaction when it reaches `synced`.
///
/// Keyed by receipt number so downstream collaborators (printing,
/// notifications) can use it as an idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionCompleted {
    pub receipt_number: String,
    pub transaction_id: String,
    pub server_id: String,
    pub completed_at: DateTime<Utc>,
}

// =============================================================================
// Commands
// =============================================================================

enum QueueCommand {
    Enqueue {
        draft: Box<TransactionDraft>,
        network_quality: Option<String>,
        reply: oneshot::Sender<SyncResult<QueuedTransaction>>,
    },
    CreateBatch {
        priority: SyncPriority,
        max: u32,
        reply: oneshot::Sender<SyncResult<Option<TransactionBatch>>>,
    },
    ClaimForRetry {
        id: String,
        reply: oneshot::Sender<SyncResult<Option<QueuedTransaction>>>,
    },
    MarkSynced {
        id: String,
        server_id: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    MarkFailed {
        id: String,
        error: String,
        kind: FailureKind,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    MarkConflict {
        id: String,
        annotation: Box<ConflictAnnotation>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Requeue {
        id: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<SyncResult<Option<QueuedTransaction>>>,
    },
    ListByPriority {
        priority: Option<SyncPriority>,
        limit: u32,
        reply: oneshot::Sender<SyncResult<Vec<QueuedTransaction>>>,
    },
    Stats {
        reply: oneshot::Sender<SyncResult<QueueStats>>,
    },
    NeedsAttention {
        reply: oneshot::Sender<SyncResult<Vec<QueuedTransaction>>>,
    },
    Cleanup {
        reply: oneshot::Sender<SyncResult<u64>>,
    },
    Shutdown,
}

// =============================================================================
// Queue Handle
// =============================================================================

/// Handle for talking to the queue worker.
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::Sender<QueueCommand>,
    completions: broadcast::Sender<TransactionCompleted>,
}

impl QueueHandle {
    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> QueueCommand,
    ) -> SyncResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SyncError::QueueClosed)?;
        reply_rx.await.map_err(|_| SyncError::QueueClosed)?
    }

    /// Validates and persists a recorded sale, assigning id, receipt
    /// number, and priority. Returns the stored transaction.
    pub async fn enqueue(
        &self,
        draft: TransactionDraft,
        network_quality: Option<String>,
    ) -> SyncResult<QueuedTransaction> {
        self.send(|reply| QueueCommand::Enqueue {
            draft: Box::new(draft),
            network_quality,
            reply,
        })
        .await
    }

    /// Creates a sync batch of up to `max` transactions for one tier,
    /// atomically flipping members to `syncing`. Returns `None` when the
    /// tier has no claimable transactions.
    pub async fn create_batch(
        &self,
        priority: SyncPriority,
        max: u32,
    ) -> SyncResult<Option<TransactionBatch>> {
        self.send(|reply| QueueCommand::CreateBatch { priority, max, reply })
            .await
    }

    /// Atomically claims a single transaction for an individual retry.
    /// Returns `None` if it is not in a claimable state.
    pub async fn claim_for_retry(&self, id: &str) -> SyncResult<Option<QueuedTransaction>> {
        self.send(|reply| QueueCommand::ClaimForRetry {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Marks a transaction synced, recording the server identifier and
    /// firing the completion event (exactly once).
    pub async fn mark_synced(&self, id: &str, server_id: &str) -> SyncResult<()> {
        self.send(|reply| QueueCommand::MarkSynced {
            id: id.to_string(),
            server_id: server_id.to_string(),
            reply,
        })
        .await
    }

    /// Marks a transaction failed, incrementing the attempt count and
    /// demoting priority to low once the retry ceiling is reached.
    pub async fn mark_failed(&self, id: &str, error: &str, kind: FailureKind) -> SyncResult<()> {
        self.send(|reply| QueueCommand::MarkFailed {
            id: id.to_string(),
            error: error.to_string(),
            kind,
            reply,
        })
        .await
    }

    /// Marks a transaction as conflicted, attaching the annotation.
    pub async fn mark_conflict(&self, id: &str, annotation: ConflictAnnotation) -> SyncResult<()> {
        self.send(|reply| QueueCommand::MarkConflict {
            id: id.to_string(),
            annotation: Box::new(annotation),
            reply,
        })
        .await
    }

    /// Returns a conflicted transaction to `pending` after resolution.
    pub async fn requeue(&self, id: &str) -> SyncResult<()> {
        self.send(|reply| QueueCommand::Requeue {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Fetches one transaction.
    pub async fn get(&self, id: &str) -> SyncResult<Option<QueuedTransaction>> {
        self.send(|reply| QueueCommand::Get {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Lists claimable (pending/failed) transactions, optionally
    /// restricted to one tier, ordered by priority then enqueue time.
    pub async fn list_by_priority(
        &self,
        priority: Option<SyncPriority>,
        limit: u32,
    ) -> SyncResult<Vec<QueuedTransaction>> {
        self.send(|reply| QueueCommand::ListByPriority { priority, limit, reply })
            .await
    }

    /// Aggregate queue statistics.
    pub async fn stats(&self) -> SyncResult<QueueStats> {
        self.send(|reply| QueueCommand::Stats { reply }).await
    }

    /// Permanently-failed transactions needing manual attention.
    pub async fn needs_attention(&self) -> SyncResult<Vec<QueuedTransaction>> {
        self.send(|reply| QueueCommand::NeedsAttention { reply }).await
    }

    /// Deletes synced transactions older than the retention window.
    /// Returns the number removed.
    pub async fn cleanup(&self) -> SyncResult<u64> {
        self.send(|reply| QueueCommand::Cleanup { reply }).await
    }

    /// Subscribes to completion events.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<TransactionCompleted> {
        self.completions.subscribe()
    }

    /// Stops the queue worker.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(QueueCommand::Shutdown).await;
    }
}

// =============================================================================
// Queue Worker
// =============================================================================

/// The queue worker. Spawn with [`TransactionQueue::run`]; interact
/// through the [`QueueHandle`].
pub struct TransactionQueue {
    store: Arc<RecordStore>,
    settings: QueueSettings,
    commands: mpsc::Receiver<QueueCommand>,
    completions: broadcast::Sender<TransactionCompleted>,
}

impl TransactionQueue {
    /// Creates the worker and its handle.
    pub fn new(store: Arc<RecordStore>, settings: QueueSettings) -> (Self, QueueHandle) {
        let (completion_tx, _) = broadcast::channel(64);
        Self::with_completion_sender(store, settings, completion_tx)
    }

    /// Creates the worker with an externally owned completion-event
    /// sender, so subscribers can exist before the worker does.
    pub fn with_completion_sender(
        store: Arc<RecordStore>,
        settings: QueueSettings,
        completion_tx: broadcast::Sender<TransactionCompleted>,
    ) -> (Self, QueueHandle) {
        let (command_tx, command_rx) = mpsc::channel(64);

        let worker = TransactionQueue {
            store,
            settings,
            commands: command_rx,
            completions: completion_tx.clone(),
        };

        let handle = QueueHandle {
            commands: command_tx,
            completions: completion_tx,
        };

        (worker, handle)
    }

    /// Runs the worker loop. Spawn as a background task.
    pub async fn run(mut self) {
        info!("Transaction queue worker starting");

        while let Some(command) = self.commands.recv().await {
            match command {
                QueueCommand::Enqueue {
                    draft,
                    network_quality,
                    reply,
                } => {
                    let _ = reply.send(self.enqueue(*draft, network_quality).await);
                }
                QueueCommand::CreateBatch { priority, max, reply } => {
                    let _ = reply.send(self.create_batch(priority, max).await);
                }
                QueueCommand::ClaimForRetry { id, reply } => {
                    let _ = reply.send(self.claim_for_retry(&id).await);
                }
                QueueCommand::MarkSynced { id, server_id, reply } => {
                    let _ = reply.send(self.mark_synced(&id, &server_id).await);
                }
                QueueCommand::MarkFailed {
                    id,
                    error,
                    kind,
                    reply,
                } => {
                    let _ = reply.send(self.mark_failed(&id, &error, kind).await);
                }
                QueueCommand::MarkConflict { id, annotation, reply } => {
                    let _ = reply.send(self.mark_conflict(&id, *annotation).await);
                }
                QueueCommand::Requeue { id, reply } => {
                    let _ = reply.send(self.requeue(&id).await);
                }
                QueueCommand::Get { id, reply } => {
                    let _ = reply.send(self.load(&id).await);
                }
                QueueCommand::ListByPriority { priority, limit, reply } => {
                    let _ = reply.send(self.list_by_priority(priority, limit).await);
                }
                QueueCommand::Stats { reply } => {
                    let _ = reply.send(self.stats().await);
                }
                QueueCommand::NeedsAttention { reply } => {
                    let _ = reply.send(self.needs_attention().await);
                }
                QueueCommand::Cleanup { reply } => {
                    let _ = reply.send(self.cleanup().await);
                }
                QueueCommand::Shutdown => {
                    info!("Transaction queue worker shutting down");
                    break;
                }
            }
        }

        info!("Transaction queue worker stopped");
    }

    // =========================================================================
    // Persistence Helpers
    // =========================================================================

    async fn persist(&self, txn: &QueuedTransaction) -> SyncResult<()> {
        let metadata = RecordMetadata {
            status: Some(txn.sync_status.as_str().to_string()),
            priority: Some(txn.priority.as_str().to_string()),
            timestamp: Some(txn.created_at.timestamp_millis()),
        };
        let envelope = RecordEnvelope::new(&txn.id, txn, metadata)?;
        self.store.put(TRANSACTIONS_COLLECTION, &envelope).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> SyncResult<Option<QueuedTransaction>> {
        let Some(envelope) = self.store.get(TRANSACTIONS_COLLECTION, id).await? else {
            return Ok(None);
        };
        Ok(Some(envelope.decode()?))
    }

    async fn load_required(&self, id: &str) -> SyncResult<QueuedTransaction> {
        self.load(id)
            .await?
            .ok_or_else(|| SyncError::TransactionNotFound(id.to_string()))
    }

    /// Loads every stored transaction, oldest first. Undecodable records
    /// are logged and skipped rather than poisoning the whole queue.
    async fn load_all(&self) -> SyncResult<Vec<QueuedTransaction>> {
        let envelopes = self
            .store
            .query(&RecordQuery::all(TRANSACTIONS_COLLECTION))
            .await?;

        let mut transactions = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match envelope.decode::<QueuedTransaction>() {
                Ok(txn) => transactions.push(txn),
                Err(e) => warn!(?e, id = %envelope.id, "Skipping undecodable transaction record"),
            }
        }
        Ok(transactions)
    }

    /// Allocates the next receipt number from the persisted counter.
    ///
    /// The counter survives retention sweeps and restarts, so receipt
    /// numbers are strictly increasing and never reused.
    async fn next_receipt_number(&self) -> SyncResult<String> {
        let current = match self.store.get(COUNTERS_COLLECTION, RECEIPT_COUNTER_ID).await? {
            Some(envelope) => envelope.decode::<ReceiptCounter>()?.value,
            None => 0,
        };

        let next = ReceiptCounter { value: current + 1 };
        let envelope =
            RecordEnvelope::new(RECEIPT_COUNTER_ID, &next, RecordMetadata::default())?;
        self.store.put(COUNTERS_COLLECTION, &envelope).await?;

        Ok(format!("{}{:06}", self.settings.receipt_prefix, next.value))
    }

    fn estimate_sync_ms(&self, transactions: &[QueuedTransaction]) -> u64 {
        transactions
            .iter()
            .map(|txn| {
                self.settings.base_sync_cost_ms
                    + txn.items.len() as u64 * self.settings.per_item_sync_cost_ms
            })
            .sum()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn enqueue(
        &self,
        draft: TransactionDraft,
        network_quality: Option<String>,
    ) -> SyncResult<QueuedTransaction> {
        validation::validate_transaction(&draft)?;

        let unsynced = self
            .load_all()
            .await?
            .iter()
            .filter(|txn| txn.sync_status.is_unsynced())
            .count();
        if unsynced >= self.settings.capacity {
            return Err(CoreError::QueueFull {
                capacity: self.settings.capacity,
            }
            .into());
        }

        let receipt_number = self.next_receipt_number().await?;
        let priority = SyncPriority::for_sale(
            draft.payment_method,
            Money::from_cents(draft.total_cents),
            Money::from_cents(self.settings.medium_priority_threshold_cents),
        );

        let txn = QueuedTransaction {
            id: Uuid::new_v4().to_string(),
            receipt_number,
            created_at: Utc::now(),
            store_id: draft.store_id,
            user_id: draft.user_id,
            shift_id: draft.shift_id,
            customer_id: draft.customer_id,
            device_id: Some(self.settings.device_id.clone()),
            items: draft.items,
            subtotal_cents: draft.subtotal_cents,
            tax_cents: draft.tax_cents,
            discount_cents: draft.discount_cents,
            total_cents: draft.total_cents,
            tendered_cents: draft.tendered_cents,
            change_cents: draft.change_cents,
            payment_method: draft.payment_method,
            payment_details: draft.payment_details,
            order_type: draft.order_type,
            delivery_platform: draft.delivery_platform,
            delivery_order_number: draft.delivery_order_number,
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_attempt_at: None,
            last_error: None,
            last_error_kind: None,
            priority,
            network_quality,
            server_id: None,
            conflict: None,
        };

        self.persist(&txn).await?;

        info!(
            receipt = %txn.receipt_number,
            priority = %txn.priority,
            total = %txn.total(),
            "Queued offline transaction"
        );

        Ok(txn)
    }

    async fn create_batch(
        &self,
        priority: SyncPriority,
        max: u32,
    ) -> SyncResult<Option<TransactionBatch>> {
        if max == 0 {
            return Ok(None);
        }

        let envelopes = self
            .store
            .query(&RecordQuery::by_index(
                TRANSACTIONS_COLLECTION,
                IndexField::Priority,
                priority.as_str(),
            ))
            .await?;

        // Already timestamp-ordered by the store; claimability filtering
        // happens here because status is a second dimension.
        let mut members = Vec::new();
        for envelope in envelopes {
            let txn: QueuedTransaction = match envelope.decode() {
                Ok(txn) => txn,
                Err(e) => {
                    warn!(?e, id = %envelope.id, "Skipping undecodable transaction record");
                    continue;
                }
            };
            if txn.sync_status.is_claimable() {
                members.push(txn);
                if members.len() as u32 >= max {
                    break;
                }
            }
        }

        if members.is_empty() {
            return Ok(None);
        }

        // The claim: flip each member to syncing before the batch is
        // handed out. Each write is awaited, so a transaction is never
        // observable as claimable once it belongs to an active batch.
        let now = Utc::now();
        for txn in &mut members {
            txn.sync_status = SyncStatus::Syncing;
            txn.last_attempt_at = Some(now);
            self.persist(txn).await?;
        }

        let estimated_sync_ms = self.estimate_sync_ms(&members);
        let batch = TransactionBatch {
            id: Uuid::new_v4().to_string(),
            priority,
            transactions: members,
            created_at: now,
            estimated_sync_ms,
        };

        debug!(
            batch = %batch.id,
            priority = %priority,
            count = batch.len(),
            "Created sync batch"
        );

        Ok(Some(batch))
    }

    async fn claim_for_retry(&self, id: &str) -> SyncResult<Option<QueuedTransaction>> {
        let mut txn = self.load_required(id).await?;

        if !txn.sync_status.is_claimable() {
            debug!(id, status = %txn.sync_status, "Transaction not claimable for retry");
            return Ok(None);
        }

        txn.sync_status = SyncStatus::Syncing;
        txn.last_attempt_at = Some(Utc::now());
        self.persist(&txn).await?;

        Ok(Some(txn))
    }

    async fn mark_synced(&self, id: &str, server_id: &str) -> SyncResult<()> {
        let mut txn = self.load_required(id).await?;

        // Synced is terminal; a duplicate ack must not fire a second
        // completion event.
        if txn.sync_status == SyncStatus::Synced {
            debug!(id, "Transaction already synced, ignoring duplicate ack");
            return Ok(());
        }

        txn.sync_status = SyncStatus::Synced;
        txn.server_id = Some(server_id.to_string());
        txn.last_attempt_at = Some(Utc::now());
        txn.last_error = None;
        self.persist(&txn).await?;

        info!(receipt = %txn.receipt_number, server_id, "Transaction synced");

        let _ = self.completions.send(TransactionCompleted {
            receipt_number: txn.receipt_number.clone(),
            transaction_id: txn.id.clone(),
            server_id: server_id.to_string(),
            completed_at: Utc::now(),
        });

        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str, kind: FailureKind) -> SyncResult<()> {
        let mut txn = self.load_required(id).await?;

        if txn.sync_status == SyncStatus::Synced {
            warn!(id, "Ignoring failure report for already-synced transaction");
            return Ok(());
        }

        txn.sync_status = SyncStatus::Failed;
        txn.sync_attempts += 1;
        txn.last_attempt_at = Some(Utc::now());
        txn.last_error = Some(error.to_string());
        txn.last_error_kind = Some(kind);

        // Demotion to low happens once the ceiling is reached; setting it
        // again on later failures is a value-level no-op.
        if txn.sync_attempts >= self.settings.retry_ceiling && txn.priority != SyncPriority::Low {
            warn!(
                receipt = %txn.receipt_number,
                attempts = txn.sync_attempts,
                "Retry ceiling reached, demoting priority to low"
            );
            txn.priority = SyncPriority::Low;
        }

        self.persist(&txn).await?;

        debug!(
            receipt = %txn.receipt_number,
            attempts = txn.sync_attempts,
            ?kind,
            "Transaction marked failed"
        );

        Ok(())
    }

    async fn mark_conflict(&self, id: &str, annotation: ConflictAnnotation) -> SyncResult<()> {
        let mut txn = self.load_required(id).await?;

        if txn.sync_status == SyncStatus::Synced {
            warn!(id, "Ignoring conflict report for already-synced transaction");
            return Ok(());
        }

        txn.sync_status = SyncStatus::Conflict;
        txn.last_attempt_at = Some(Utc::now());
        txn.conflict = Some(annotation);
        self.persist(&txn).await?;

        info!(receipt = %txn.receipt_number, "Transaction marked conflicted");
        Ok(())
    }

    async fn requeue(&self, id: &str) -> SyncResult<()> {
        let mut txn = self.load_required(id).await?;

        if txn.sync_status != SyncStatus::Conflict {
            warn!(id, status = %txn.sync_status, "Requeue only applies to conflicted transactions");
            return Ok(());
        }

        txn.sync_status = SyncStatus::Pending;
        self.persist(&txn).await?;

        debug!(receipt = %txn.receipt_number, "Conflicted transaction re-queued as pending");
        Ok(())
    }

    async fn list_by_priority(
        &self,
        priority: Option<SyncPriority>,
        limit: u32,
    ) -> SyncResult<Vec<QueuedTransaction>> {
        let mut claimable: Vec<QueuedTransaction> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|txn| txn.sync_status.is_claimable())
            .filter(|txn| priority.map(|p| txn.priority == p).unwrap_or(true))
            .collect();

        claimable.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
        });
        claimable.truncate(limit as usize);

        Ok(claimable)
    }

    async fn stats(&self) -> SyncResult<QueueStats> {
        let transactions = self.load_all().await?;

        let mut stats = QueueStats {
            total: transactions.len() as u64,
            ..Default::default()
        };

        for txn in &transactions {
            match txn.sync_status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Syncing => stats.syncing += 1,
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Failed => stats.failed += 1,
                SyncStatus::Conflict => stats.conflict += 1,
            }
            match txn.priority {
                SyncPriority::High => stats.high_priority += 1,
                SyncPriority::Medium => stats.medium_priority += 1,
                SyncPriority::Low => stats.low_priority += 1,
            }

            stats.oldest = Some(match stats.oldest {
                Some(t) => t.min(txn.created_at),
                None => txn.created_at,
            });
            stats.newest = Some(match stats.newest {
                Some(t) => t.max(txn.created_at),
                None => txn.created_at,
            });

            if txn.sync_status.is_claimable() {
                stats.estimated_sync_ms += self.settings.base_sync_cost_ms
                    + txn.items.len() as u64 * self.settings.per_item_sync_cost_ms;
            }
        }

        Ok(stats)
    }

    async fn needs_attention(&self) -> SyncResult<Vec<QueuedTransaction>> {
        let ceiling = self.settings.retry_ceiling;
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|txn| txn.is_permanently_failed(ceiling))
            .collect())
    }

    async fn cleanup(&self) -> SyncResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(self.settings.retention_days as i64);
        let mut removed = 0u64;

        for txn in self.load_all().await? {
            if txn.sync_status == SyncStatus::Synced && txn.created_at < cutoff {
                self.store.remove(TRANSACTIONS_COLLECTION, &txn.id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Retention sweep removed old synced transactions");
        }

        Ok(removed)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use till_core::{LineItem, PaymentMethod};

    fn settings() -> QueueSettings {
        QueueSettings {
            device_id: "dev-1".into(),
            receipt_prefix: "OFF".into(),
            medium_priority_threshold_cents: 100_000,
            retry_ceiling: 5,
            capacity: 500,
            base_sync_cost_ms: 2000,
            per_item_sync_cost_ms: 1000,
            retention_days: 7,
        }
    }

    async fn spawn_queue(settings: QueueSettings) -> (QueueHandle, Arc<RecordStore>) {
        let dir = std::env::temp_dir().join(format!("till-queue-{}", Uuid::new_v4()));
        let store = Arc::new(RecordStore::open_in_memory(dir).await.unwrap());
        let (worker, handle) = TransactionQueue::new(store.clone(), settings);
        tokio::spawn(worker.run());
        (handle, store)
    }

    fn draft(method: PaymentMethod, total_cents: i64) -> TransactionDraft {
        TransactionDraft {
            store_id: "store-1".into(),
            user_id: "user-1".into(),
            shift_id: "shift-1".into(),
            customer_id: None,
            items: vec![LineItem {
                product_id: "prod-1".into(),
                variation_id: None,
                name: "Iced Latte 16oz".into(),
                quantity: 1,
                unit_price_cents: total_cents,
                line_total_cents: total_cents,
                category: None,
                sku: None,
            }],
            subtotal_cents: total_cents,
            tax_cents: 0,
            discount_cents: 0,
            total_cents,
            tendered_cents: total_cents,
            change_cents: Some(0),
            payment_method: method,
            payment_details: None,
            order_type: None,
            delivery_platform: None,
            delivery_order_number: None,
        }
    }

    #[tokio::test]
    async fn test_receipt_numbers_strictly_increasing_and_unique() {
        let (queue, _store) = spawn_queue(settings()).await;

        let mut receipts = Vec::new();
        for i in 0..5 {
            let method = if i % 2 == 0 {
                PaymentMethod::Cash
            } else {
                PaymentMethod::Card
            };
            let txn = queue.enqueue(draft(method, 5000), None).await.unwrap();
            receipts.push(txn.receipt_number);
        }

        assert_eq!(
            receipts,
            vec!["OFF000001", "OFF000002", "OFF000003", "OFF000004", "OFF000005"]
        );

        let mut sorted = receipts.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), receipts.len());
    }

    #[tokio::test]
    async fn test_priority_assignment() {
        let (queue, _store) = spawn_queue(settings()).await;

        let cash = queue.enqueue(draft(PaymentMethod::Cash, 500), None).await.unwrap();
        assert_eq!(cash.priority, SyncPriority::High);

        let large_card = queue
            .enqueue(draft(PaymentMethod::Card, 150_000), None)
            .await
            .unwrap();
        assert_eq!(large_card.priority, SyncPriority::Medium);

        let wallet = queue
            .enqueue(draft(PaymentMethod::EWallet, 5000), None)
            .await
            .unwrap();
        assert_eq!(wallet.priority, SyncPriority::Low);
    }

    #[tokio::test]
    async fn test_invalid_draft_rejected() {
        let (queue, _store) = spawn_queue(settings()).await;

        let mut bad = draft(PaymentMethod::Cash, 5000);
        bad.items.clear();
        assert!(queue.enqueue(bad, None).await.is_err());

        let mut short_tender = draft(PaymentMethod::Cash, 5000);
        short_tender.tendered_cents = 100;
        short_tender.change_cents = None;
        assert!(queue.enqueue(short_tender, None).await.is_err());
    }

    #[tokio::test]
    async fn test_capacity_guard() {
        let mut s = settings();
        s.capacity = 2;
        let (queue, _store) = spawn_queue(s).await;

        queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();

        let err = queue
            .enqueue(draft(PaymentMethod::Cash, 1000), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn test_batch_claims_exclusively() {
        let (queue, _store) = spawn_queue(settings()).await;

        let a = queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        let b = queue.enqueue(draft(PaymentMethod::Cash, 2000), None).await.unwrap();
        let c = queue.enqueue(draft(PaymentMethod::Cash, 3000), None).await.unwrap();

        let batch = queue
            .create_batch(SyncPriority::High, 10)
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<_> = batch.transactions.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone(), c.id.clone()]); // enqueue order
        assert!(batch
            .transactions
            .iter()
            .all(|t| t.sync_status == SyncStatus::Syncing));

        // Members of an active batch can never enter a second batch
        assert!(queue.create_batch(SyncPriority::High, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_respects_max() {
        let (queue, _store) = spawn_queue(settings()).await;

        for _ in 0..5 {
            queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        }

        let batch = queue
            .create_batch(SyncPriority::High, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.estimated_sync_ms, 2 * (2000 + 1000));

        // The remaining three are still claimable
        let rest = queue
            .create_batch(SyncPriority::High, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn test_mark_synced_removes_from_tier_queries_and_counts() {
        let (queue, _store) = spawn_queue(settings()).await;

        let txn = queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        queue.create_batch(SyncPriority::High, 10).await.unwrap();
        queue.mark_synced(&txn.id, "srv-1").await.unwrap();

        let listed = queue.list_by_priority(Some(SyncPriority::High), 50).await.unwrap();
        assert!(listed.is_empty());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.reconcilable(), 0);

        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.server_id.as_deref(), Some("srv-1"));
    }

    #[tokio::test]
    async fn test_completion_event_fires_exactly_once() {
        let (queue, _store) = spawn_queue(settings()).await;
        let mut completions = queue.subscribe_completions();

        let txn = queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        queue.mark_synced(&txn.id, "srv-1").await.unwrap();
        // Duplicate ack must not fire a second event
        queue.mark_synced(&txn.id, "srv-1").await.unwrap();

        let event = completions.recv().await.unwrap();
        assert_eq!(event.receipt_number, txn.receipt_number);
        assert_eq!(event.server_id, "srv-1");

        assert!(matches!(
            completions.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_failure_ceiling_demotes_once_and_surfaces() {
        let (queue, _store) = spawn_queue(settings()).await;

        let txn = queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        assert_eq!(txn.priority, SyncPriority::High);

        for attempt in 1..=5 {
            let claimed = queue.claim_for_retry(&txn.id).await.unwrap();
            assert!(claimed.is_some(), "attempt {attempt} should claim");
            queue
                .mark_failed(&txn.id, "connection reset", FailureKind::Network)
                .await
                .unwrap();
        }

        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.sync_attempts, 5);
        assert_eq!(stored.priority, SyncPriority::Low);

        let attention = queue.needs_attention().await.unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].id, txn.id);

        // Further failures never decrease attempts or demote again
        queue.claim_for_retry(&txn.id).await.unwrap();
        queue
            .mark_failed(&txn.id, "still down", FailureKind::Network)
            .await
            .unwrap();
        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_attempts, 6);
        assert_eq!(stored.priority, SyncPriority::Low);
    }

    #[tokio::test]
    async fn test_permanent_failure_needs_attention_immediately() {
        let (queue, _store) = spawn_queue(settings()).await;

        let txn = queue.enqueue(draft(PaymentMethod::Card, 1000), None).await.unwrap();
        queue.claim_for_retry(&txn.id).await.unwrap();
        queue
            .mark_failed(&txn.id, "invalid shift reference", FailureKind::Validation)
            .await
            .unwrap();

        let attention = queue.needs_attention().await.unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].sync_attempts, 1);
    }

    #[tokio::test]
    async fn test_conflict_and_requeue_round_trip() {
        let (queue, _store) = spawn_queue(settings()).await;

        let txn = queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        queue.claim_for_retry(&txn.id).await.unwrap();

        queue
            .mark_conflict(
                &txn.id,
                ConflictAnnotation {
                    conflict_type: till_core::ConflictType::Inventory,
                    resolution_strategy: None,
                    resolved_at: None,
                },
            )
            .await
            .unwrap();

        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);

        queue.requeue(&txn.id).await.unwrap();
        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_synced() {
        let (queue, store) = spawn_queue(settings()).await;

        let old = queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        let fresh = queue.enqueue(draft(PaymentMethod::Cash, 2000), None).await.unwrap();
        queue.mark_synced(&old.id, "srv-1").await.unwrap();
        queue.mark_synced(&fresh.id, "srv-2").await.unwrap();

        // Age the first record past the retention window
        let mut aged = queue.get(&old.id).await.unwrap().unwrap();
        aged.created_at = Utc::now() - ChronoDuration::days(10);
        let envelope = RecordEnvelope::new(
            &aged.id,
            &aged,
            RecordMetadata {
                status: Some(aged.sync_status.as_str().to_string()),
                priority: Some(aged.priority.as_str().to_string()),
                timestamp: Some(aged.created_at.timestamp_millis()),
            },
        )
        .unwrap();
        store.put(TRANSACTIONS_COLLECTION, &envelope).await.unwrap();

        let removed = queue.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get(&old.id).await.unwrap().is_none());
        assert!(queue.get(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_estimated_sync_time() {
        let (queue, _store) = spawn_queue(settings()).await;

        queue.enqueue(draft(PaymentMethod::Cash, 1000), None).await.unwrap();
        queue.enqueue(draft(PaymentMethod::Card, 2000), None).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 2);
        // 2 transactions × (2000ms base + 1 item × 1000ms)
        assert_eq!(stats.estimated_sync_ms, 2 * 3000);
        assert!(stats.oldest.is_some());
    }
}
