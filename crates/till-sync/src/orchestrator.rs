//! # Sync Orchestrator
//!
//! Drives sync cycles (manual or background), consults the network
//! monitor, pulls batches from the queue, and applies the retry policy.
//!
//! ## Cycle State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Cycle Phases                                │
//! │                                                                         │
//! │  idle → preparing → syncing → resolving_conflicts → finishing → idle   │
//! │           │                                                             │
//! │           └── recommendation says no (and trigger not immediate)       │
//! │               → skipped, straight back to idle                         │
//! │                                                                         │
//! │  SINGLE FLIGHT: entry is gated by try_lock on the cycle lock. A        │
//! │  concurrent trigger returns "already in progress" immediately; it      │
//! │  is never queued.                                                      │
//! │                                                                         │
//! │  ORDERING: tiers drain high → medium → low (low only when the          │
//! │  recommendation is not background); within a batch, transactions       │
//! │  sync strictly in timestamp order, one remote call at a time.          │
//! │                                                                         │
//! │  CANCELLATION: between batches only. The monitor is re-consulted       │
//! │  before each later tier; degradation stops the cycle with a            │
//! │  PARTIAL (non-error) outcome. Batches are created lazily, one tier     │
//! │  at a time, so an aborted cycle strands nothing in `syncing`.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Classification
//! network / timeout / 5xx → retryable: attempt count up, keyed backoff
//! timer while under the ceiling. 4xx / validation → permanent: failed,
//! no automatic retry. Server conflicts → conflict engine, not failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use till_core::{FailureKind, QualityLevel, QueuedTransaction, SyncPriority};

use crate::config::OfflineConfig;
use crate::conflict::ConflictEngine;
use crate::error::SyncResult;
use crate::network::{NetworkMonitor, SyncUrgency};
use crate::queue::QueueHandle;
use crate::remote::{RemoteError, RemoteSync, TransactionPayload};
use crate::retry::{retry_delay, RetryRegistry};

// =============================================================================
// Phases, Triggers, Reports
// =============================================================================

/// Phase of the sync cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Preparing,
    Syncing,
    ResolvingConflicts,
    Finishing,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Preparing => write!(f, "preparing"),
            SyncPhase::Syncing => write!(f, "syncing"),
            SyncPhase::ResolvingConflicts => write!(f, "resolving_conflicts"),
            SyncPhase::Finishing => write!(f, "finishing"),
        }
    }
}

/// What kicked off a cycle.
///
/// An immediate trigger (manual button, reconnect) bypasses a negative
/// sync recommendation; a background trigger honors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Immediate,
    Background,
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every eligible tier was drained.
    Completed,
    /// The cycle stopped between batches on network degradation.
    /// A normal, reported outcome, not an error.
    Partial,
    /// The recommendation said not to sync and the trigger honored it.
    Skipped,
    /// Another cycle already held the single-flight lock.
    AlreadyRunning,
    /// The whole cycle failed (e.g. the store was unreachable).
    Failed,
}

/// One itemized per-transaction failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItemError {
    pub transaction_id: String,
    pub receipt_number: String,
    pub error: String,
    pub kind: FailureKind,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub synced: u64,
    pub failed: u64,
    pub conflicted: u64,
    pub total_processed: u64,
    pub errors: Vec<SyncItemError>,
    pub duration_ms: u64,
    /// Network quality observed during the cycle.
    pub network_quality: QualityLevel,
    /// Why the cycle skipped or failed, when it did.
    pub reason: Option<String>,
}

impl SyncReport {
    fn empty(outcome: SyncOutcome, quality: QualityLevel, reason: Option<String>) -> Self {
        SyncReport {
            outcome,
            synced: 0,
            failed: 0,
            conflicted: 0,
            total_processed: 0,
            errors: Vec::new(),
            duration_ms: 0,
            network_quality: quality,
            reason,
        }
    }
}

/// Progress event, emitted on every phase transition and per processed
/// transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub current_batch: u32,
    pub total_batches: u32,
    pub current_transaction: u64,
    pub total_transactions: u64,
    pub estimated_ms_remaining: u64,
    pub network_quality: QualityLevel,
}

// =============================================================================
// Settings
// =============================================================================

/// Orchestrator settings, extracted from the engine config.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry_ceiling: u32,
    pub initial_retry_backoff: std::time::Duration,
    pub max_retry_backoff: std::time::Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &OfflineConfig) -> Self {
        OrchestratorSettings {
            retry_ceiling: config.sync.retry_ceiling,
            initial_retry_backoff: config.initial_retry_backoff(),
            max_retry_backoff: config.max_retry_backoff(),
        }
    }
}

// =============================================================================
// Cycle Bookkeeping
// =============================================================================

#[derive(Default)]
struct CycleCounters {
    synced: u64,
    failed: u64,
    conflicted: u64,
    errors: Vec<SyncItemError>,
}

enum TxnOutcome {
    Synced,
    Conflicted,
    Failed,
}

// =============================================================================
// Sync Orchestrator
// =============================================================================

/// Drives sync cycles over the queue, the monitor, the conflict engine,
/// and the injected remote. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    queue: QueueHandle,
    monitor: NetworkMonitor,
    conflicts: ConflictEngine,
    remote: Arc<dyn RemoteSync>,
    retries: RetryRegistry,
    cycle_lock: Arc<Mutex<()>>,
    phase: Arc<RwLock<SyncPhase>>,
    progress: broadcast::Sender<SyncProgress>,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
    settings: OrchestratorSettings,
}

impl SyncOrchestrator {
    /// Creates an orchestrator with its own progress channel.
    pub fn new(
        queue: QueueHandle,
        monitor: NetworkMonitor,
        conflicts: ConflictEngine,
        remote: Arc<dyn RemoteSync>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (progress, _) = broadcast::channel(64);
        Self::with_progress_sender(queue, monitor, conflicts, remote, settings, progress)
    }

    /// Creates an orchestrator emitting progress on an externally owned
    /// channel, so subscribers can exist before the orchestrator does.
    pub fn with_progress_sender(
        queue: QueueHandle,
        monitor: NetworkMonitor,
        conflicts: ConflictEngine,
        remote: Arc<dyn RemoteSync>,
        settings: OrchestratorSettings,
        progress: broadcast::Sender<SyncProgress>,
    ) -> Self {
        SyncOrchestrator {
            queue,
            monitor,
            conflicts,
            remote,
            retries: RetryRegistry::new(),
            cycle_lock: Arc::new(Mutex::new(())),
            phase: Arc::new(RwLock::new(SyncPhase::Idle)),
            progress,
            last_sync: Arc::new(RwLock::new(None)),
            settings,
        }
    }

    /// Subscribes to progress events.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Current cycle phase.
    pub async fn phase(&self) -> SyncPhase {
        *self.phase.read().await
    }

    /// Returns true while a cycle is running.
    pub async fn is_syncing(&self) -> bool {
        *self.phase.read().await != SyncPhase::Idle
    }

    /// When the last cycle finished.
    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().await
    }

    /// Cancels pending retry timers. Call on shutdown.
    pub async fn shutdown(&self) {
        self.retries.cancel_all().await;
    }

    // =========================================================================
    // Cycle Entry
    // =========================================================================

    /// Runs one sync cycle.
    ///
    /// Single-flight: a trigger while another cycle runs returns an
    /// `AlreadyRunning` report immediately, it is never queued.
    pub async fn run_cycle(&self, trigger: SyncTrigger) -> SyncReport {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("Sync already in progress, returning immediately");
            return SyncReport::empty(
                SyncOutcome::AlreadyRunning,
                self.current_quality().await,
                Some("sync already in progress".into()),
            );
        };

        let started = Instant::now();
        let report = match self.cycle_inner(trigger, started).await {
            Ok(report) => report,
            Err(e) => {
                error!(?e, "Sync cycle failed");
                let mut report = SyncReport::empty(
                    SyncOutcome::Failed,
                    self.current_quality().await,
                    Some(e.to_string()),
                );
                report.duration_ms = started.elapsed().as_millis() as u64;
                report
            }
        };

        self.set_phase(SyncPhase::Idle).await;
        report
    }

    /// Background tick: triggers a cycle only when the lock is free and
    /// there is queued work. A tick during a manual cycle is a silent
    /// no-op.
    pub async fn background_tick(&self) {
        if self.cycle_lock.try_lock().is_err() {
            debug!("Background tick while a cycle runs, ignoring");
            return;
        }

        match self.queue.stats().await {
            Ok(stats) if stats.reconcilable() > 0 => {
                debug!(pending = stats.reconcilable(), "Background sync triggered");
                let report = self.run_cycle(SyncTrigger::Background).await;
                debug!(outcome = ?report.outcome, synced = report.synced, "Background sync done");
            }
            Ok(_) => {}
            Err(e) => warn!(?e, "Background tick failed to read queue stats"),
        }
    }

    /// Cancels any stale retry timer for the transaction and retries it
    /// immediately. Returns false if it was not in a claimable state.
    pub async fn retry_transaction(&self, id: &str) -> SyncResult<bool> {
        self.retries.cancel(id).await;

        match self.queue.claim_for_retry(id).await? {
            Some(txn) => {
                info!(receipt = %txn.receipt_number, "Manual retry");
                let mut counters = CycleCounters::default();
                self.process_transaction(&txn, &mut counters).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Cycle Body
    // =========================================================================

    async fn cycle_inner(&self, trigger: SyncTrigger, started: Instant) -> SyncResult<SyncReport> {
        self.set_phase(SyncPhase::Preparing).await;

        let quality = self.current_quality().await;
        let stats = self.queue.stats().await?;
        let pending = stats.reconcilable();

        let recommendation = self.monitor.recommendation(pending).await;
        if !recommendation.should_sync && trigger != SyncTrigger::Immediate {
            debug!(reason = %recommendation.reason, "Sync postponed");
            let mut report =
                SyncReport::empty(SyncOutcome::Skipped, quality, Some(recommendation.reason));
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        // Tier order is fixed: high, then medium; low only when the
        // network supports more than opportunistic background syncing.
        let mut tiers = vec![SyncPriority::High, SyncPriority::Medium];
        if recommendation.urgency != SyncUrgency::Background {
            tiers.push(SyncPriority::Low);
        }

        let total_batches = tiers.len() as u32;
        let total_transactions = pending;
        let per_item_ms = recommendation.estimated_ms_per_item;
        let batch_size = recommendation.batch_size.max(1);

        self.emit_progress(
            SyncPhase::Preparing,
            0,
            total_batches,
            0,
            total_transactions,
            total_transactions * per_item_ms,
            quality,
        );

        self.set_phase(SyncPhase::Syncing).await;

        let mut counters = CycleCounters::default();
        let mut processed = 0u64;
        let mut partial = false;

        for (index, tier) in tiers.iter().enumerate() {
            // Between batches: re-consult the monitor and stop early if
            // conditions degraded. Never interrupt mid-transaction.
            if index > 0 {
                let remaining = total_transactions.saturating_sub(processed);
                let now = self.monitor.recommendation(remaining).await;
                if !now.should_sync {
                    info!(reason = %now.reason, "Network degraded, stopping remaining batches");
                    partial = true;
                    break;
                }
            }

            let Some(batch) = self.queue.create_batch(*tier, batch_size).await? else {
                continue;
            };

            let batch_number = index as u32 + 1;
            debug!(
                batch = %batch.id,
                priority = %tier,
                count = batch.len(),
                "Processing sync batch"
            );

            for txn in &batch.transactions {
                processed += 1;
                self.emit_progress(
                    SyncPhase::Syncing,
                    batch_number,
                    total_batches,
                    processed,
                    total_transactions,
                    total_transactions.saturating_sub(processed) * per_item_ms,
                    quality,
                );

                self.process_transaction(txn, &mut counters).await;
            }
        }

        self.set_phase(SyncPhase::ResolvingConflicts).await;
        if let Err(e) = self.conflicts.resolve_pending().await {
            warn!(?e, "Pending-conflict resolution pass failed");
        }

        self.set_phase(SyncPhase::Finishing).await;
        self.emit_progress(
            SyncPhase::Finishing,
            total_batches,
            total_batches,
            processed,
            total_transactions,
            0,
            quality,
        );

        *self.last_sync.write().await = Some(Utc::now());

        let report = SyncReport {
            outcome: if partial {
                SyncOutcome::Partial
            } else {
                SyncOutcome::Completed
            },
            synced: counters.synced,
            failed: counters.failed,
            conflicted: counters.conflicted,
            total_processed: processed,
            errors: counters.errors,
            duration_ms: started.elapsed().as_millis() as u64,
            network_quality: quality,
            reason: None,
        };

        info!(
            outcome = ?report.outcome,
            synced = report.synced,
            failed = report.failed,
            conflicted = report.conflicted,
            duration_ms = report.duration_ms,
            "Sync cycle finished"
        );

        Ok(report)
    }

    // =========================================================================
    // Per-Transaction Processing
    // =========================================================================

    /// Pushes one claimed transaction and classifies the outcome.
    /// Per-transaction failures are absorbed into record status and the
    /// cycle counters; they never fail the cycle.
    async fn process_transaction(&self, txn: &QueuedTransaction, counters: &mut CycleCounters) {
        match self.sync_one(txn).await {
            TxnOutcome::Synced => counters.synced += 1,
            TxnOutcome::Conflicted => counters.conflicted += 1,
            TxnOutcome::Failed => {
                counters.failed += 1;
                if let Some(last) = self.last_error_for(txn).await {
                    counters.errors.push(last);
                }
            }
        }
    }

    async fn sync_one(&self, txn: &QueuedTransaction) -> TxnOutcome {
        let payload = TransactionPayload::from_transaction(txn);

        match self.remote.push_transaction(payload).await {
            Ok(ack) => {
                if let Err(e) = self.queue.mark_synced(&txn.id, &ack.server_id).await {
                    error!(?e, receipt = %txn.receipt_number, "Failed to record sync success");
                }
                TxnOutcome::Synced
            }

            // An empty conflict payload is a server bug; it falls through
            // to the failure arm so the transaction cannot strand in
            // `syncing` with nothing to resolve.
            Err(RemoteError::Conflict(report)) if !report.is_empty() => {
                info!(
                    receipt = %txn.receipt_number,
                    conflicts = report.len(),
                    "Server reported conflicts"
                );
                if let Err(e) = self.conflicts.handle_server_conflicts(txn, &report).await {
                    error!(?e, receipt = %txn.receipt_number, "Conflict handling failed");
                }
                TxnOutcome::Conflicted
            }

            Err(remote_err) => {
                let kind = remote_err.failure_kind();
                let message = remote_err.to_string();
                warn!(
                    receipt = %txn.receipt_number,
                    ?kind,
                    error = %message,
                    "Transaction sync failed"
                );

                if let Err(e) = self.queue.mark_failed(&txn.id, &message, kind).await {
                    error!(?e, receipt = %txn.receipt_number, "Failed to record sync failure");
                }

                let attempts_after = txn.sync_attempts + 1;
                if kind.is_retryable() && attempts_after < self.settings.retry_ceiling {
                    self.schedule_retry(txn.id.clone(), attempts_after).await;
                }

                TxnOutcome::Failed
            }
        }
    }

    async fn last_error_for(&self, txn: &QueuedTransaction) -> Option<SyncItemError> {
        let stored = self.queue.get(&txn.id).await.ok().flatten()?;
        Some(SyncItemError {
            transaction_id: stored.id.clone(),
            receipt_number: stored.receipt_number.clone(),
            error: stored.last_error.unwrap_or_else(|| "unknown error".into()),
            kind: stored.last_error_kind.unwrap_or(FailureKind::Unknown),
            retryable: stored
                .last_error_kind
                .map(|k| k.is_retryable())
                .unwrap_or(true),
            timestamp: stored.last_attempt_at.unwrap_or_else(Utc::now),
        })
    }

    // =========================================================================
    // Keyed Retry Timers
    // =========================================================================

    async fn schedule_retry(&self, id: String, attempt: u32) {
        let delay = retry_delay(
            attempt,
            self.settings.initial_retry_backoff,
            self.settings.max_retry_backoff,
        );
        debug!(transaction = %id, attempt, ?delay, "Scheduling retry");
        let fut = self.retry_future(id.clone());
        self.retries.schedule(&id, delay, fut).await;
    }

    /// Boxed so the retry → fail → schedule-retry chain does not build an
    /// infinitely recursive future type.
    fn retry_future(&self, id: String) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let this = self.clone();
        Box::pin(async move {
            // Each retry goes through the same atomic claim; if the
            // transaction was synced, resolved, or claimed elsewhere in
            // the meantime, this is a no-op.
            match this.queue.claim_for_retry(&id).await {
                Ok(Some(txn)) => {
                    debug!(receipt = %txn.receipt_number, attempts = txn.sync_attempts, "Retrying");
                    let _ = this.sync_one(&txn).await;
                }
                Ok(None) => debug!(transaction = %id, "Retry skipped, not claimable"),
                Err(e) => warn!(?e, transaction = %id, "Retry claim failed"),
            }
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn current_quality(&self) -> QualityLevel {
        self.monitor.status().await.quality.level
    }

    async fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write().await = phase;
    }

    fn emit_progress(
        &self,
        phase: SyncPhase,
        current_batch: u32,
        total_batches: u32,
        current_transaction: u64,
        total_transactions: u64,
        estimated_ms_remaining: u64,
        network_quality: QualityLevel,
    ) {
        let _ = self.progress.send(SyncProgress {
            phase,
            current_batch,
            total_batches,
            current_transaction,
            total_transactions,
            estimated_ms_remaining,
            network_quality,
        });
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
