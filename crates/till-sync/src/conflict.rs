//! # Conflict Resolution Engine
//!
//! Detects and resolves disagreements surfaced by the server during
//! sync, using a rule table keyed by conflict type and severity.
//!
//! ## Resolution Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Conflict Resolution Flow                             │
//! │                                                                         │
//! │  server ConflictReport                                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  detect() ── severity from category thresholds:                        │
//! │       │        inventory: stock 0 → critical, else high                │
//! │       │        pricing:   Δ>20% → critical, Δ>10% → high, else medium  │
//! │       │        product:   discontinued → critical, else high           │
//! │       │        customer:  medium                                       │
//! │       ▼                                                                 │
//! │  rule table (type, severity) → strategy                                │
//! │       │                                                                 │
//! │       ├── server_wins / client_wins   deterministic copy               │
//! │       ├── merge                       type-specific merge function     │
//! │       ├── skip                        resolved, no data change         │
//! │       ├── retry_later                 left for the next cycle          │
//! │       └── user_prompt                 suspended behind the external    │
//! │                                       decision channel (optional       │
//! │                                       timeout → fallback strategy)     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  every conflict resolved → transaction re-queued as pending            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use till_core::{
    ConflictAnnotation, ConflictRecord, ConflictSeverity, ConflictStats, ConflictType,
    QueuedTransaction, ResolutionStrategy,
};
use till_store::{RecordEnvelope, RecordMetadata, RecordQuery, RecordStore};

use crate::config::OfflineConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::QueueHandle;
use crate::remote::ConflictReport;
use crate::retry::RetryRegistry;

/// Collection holding conflict records.
pub const CONFLICTS_COLLECTION: &str = "conflicts";

// =============================================================================
// Rule Table
// =============================================================================

/// One row of the resolution rule table.
#[derive(Debug, Clone)]
pub struct ConflictRule {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub strategy: ResolutionStrategy,
    pub auto_resolve: bool,
    /// Processing order: lower numbers resolve first.
    pub priority: u32,
}

/// The default rule table.
///
/// Inventory and pricing are server-authoritative at high severities;
/// customer data merges or keeps the client copy; anything unmatched
/// falls through to a user prompt.
pub fn default_rules() -> Vec<ConflictRule> {
    use ConflictSeverity::*;
    use ConflictType::*;
    use ResolutionStrategy::*;

    vec![
        // Inventory: the server's stock count is authoritative
        rule(Inventory, Critical, ServerWins, true, 1),
        rule(Inventory, High, ServerWins, true, 2),
        rule(Inventory, Medium, UserPrompt, false, 3),
        // Pricing: server wins for consistency across terminals
        rule(Pricing, Critical, ServerWins, true, 1),
        rule(Pricing, High, ServerWins, true, 2),
        rule(Pricing, Medium, UserPrompt, false, 3),
        // Customer: merge when possible, otherwise keep the client copy
        rule(Customer, Low, Merge, true, 4),
        rule(Customer, Medium, ClientWins, true, 3),
        // Product: catalog authority lives on the server
        rule(Product, High, ServerWins, true, 2),
        rule(Product, Critical, ServerWins, true, 1),
        // Discount: manual review
        rule(Discount, Medium, UserPrompt, false, 3),
        // Other: default to user prompt
        rule(Other, Medium, UserPrompt, false, 5),
    ]
}

fn rule(
    conflict_type: ConflictType,
    severity: ConflictSeverity,
    strategy: ResolutionStrategy,
    auto_resolve: bool,
    priority: u32,
) -> ConflictRule {
    ConflictRule {
        conflict_type,
        severity,
        strategy,
        auto_resolve,
        priority,
    }
}

/// Fallback for `(type, severity)` pairs with no matching rule.
fn fallback_rule() -> ConflictRule {
    rule(
        ConflictType::Other,
        ConflictSeverity::Medium,
        ResolutionStrategy::UserPrompt,
        false,
        999,
    )
}

// =============================================================================
// Settings & Outcomes
// =============================================================================

/// Conflict engine settings, extracted from the engine config.
#[derive(Debug, Clone)]
pub struct ConflictEngineSettings {
    pub retention_days: u32,
    /// How long a user prompt waits before the fallback strategy applies.
    /// `None` = wait indefinitely (surfaced in stats, never hidden).
    pub user_prompt_timeout: Option<Duration>,
    pub prompt_fallback_strategy: ResolutionStrategy,
}

impl ConflictEngineSettings {
    pub fn from_config(config: &OfflineConfig) -> Self {
        ConflictEngineSettings {
            retention_days: config.conflict.retention_days,
            user_prompt_timeout: config.user_prompt_timeout(),
            prompt_fallback_strategy: config.conflict.prompt_fallback_strategy,
        }
    }
}

/// Outcome of resolving one conflict record.
#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    /// Resolved with the given final record.
    Resolved(ConflictRecord),
    /// Suspended behind the external decision channel.
    AwaitingUser(String),
    /// Left unresolved for the next cycle (retry_later).
    Deferred(String),
}

/// Summary of one server conflict report after detection + resolution.
#[derive(Debug, Clone, Default)]
pub struct ConflictSummary {
    pub detected: usize,
    pub auto_resolved: usize,
    pub awaiting_user: usize,
    pub deferred: usize,
    /// True when every conflict resolved and the transaction was
    /// re-queued for the next cycle.
    pub transaction_requeued: bool,
}

// =============================================================================
// Conflict Engine
// =============================================================================

/// Rule-table conflict engine.
///
/// Cheap to clone; all state lives in the record store, the prompt
/// registry, and the shared pending-prompt set.
#[derive(Clone)]
pub struct ConflictEngine {
    store: Arc<RecordStore>,
    queue: QueueHandle,
    rules: Arc<Vec<ConflictRule>>,
    settings: ConflictEngineSettings,
    prompt_timeouts: RetryRegistry,
    pending_prompts: Arc<Mutex<HashSet<String>>>,
}

impl ConflictEngine {
    /// Creates an engine with the default rule table.
    pub fn new(
        store: Arc<RecordStore>,
        queue: QueueHandle,
        settings: ConflictEngineSettings,
    ) -> Self {
        ConflictEngine {
            store,
            queue,
            rules: Arc::new(default_rules()),
            settings,
            prompt_timeouts: RetryRegistry::new(),
            pending_prompts: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn rule_for(&self, record: &ConflictRecord) -> ConflictRule {
        self.rules
            .iter()
            .find(|r| r.conflict_type == record.conflict_type && r.severity == record.severity)
            .cloned()
            .unwrap_or_else(fallback_rule)
    }

    // =========================================================================
    // Detection
    // =========================================================================

    /// Builds and persists conflict records from a server report.
    pub async fn detect(
        &self,
        txn: &QueuedTransaction,
        report: &ConflictReport,
    ) -> SyncResult<Vec<ConflictRecord>> {
        let now = Utc::now();
        let mut records = Vec::new();

        for c in &report.inventory_conflicts {
            records.push(ConflictRecord {
                id: format!("inventory_{}_{}", txn.id, c.product_id),
                transaction_id: txn.id.clone(),
                conflict_type: ConflictType::Inventory,
                severity: ConflictSeverity::for_inventory(c.available_quantity),
                client_data: serde_json::json!({
                    "product_id": c.product_id,
                    "requested_quantity": c.requested_quantity,
                    "expected_available": c.expected_available,
                }),
                server_data: serde_json::json!({
                    "product_id": c.product_id,
                    "available_quantity": c.available_quantity,
                    "last_updated": c.last_updated,
                }),
                detected_at: now,
                resolved_at: None,
                resolution_strategy: None,
                resolution_data: None,
                auto_resolved: false,
            });
        }

        for c in &report.pricing_conflicts {
            records.push(ConflictRecord {
                id: format!("pricing_{}_{}", txn.id, c.product_id),
                transaction_id: txn.id.clone(),
                conflict_type: ConflictType::Pricing,
                severity: ConflictSeverity::for_price_delta(c.percentage_delta()),
                client_data: serde_json::json!({
                    "product_id": c.product_id,
                    "price_cents": c.client_price_cents,
                    "timestamp": txn.created_at,
                }),
                server_data: serde_json::json!({
                    "product_id": c.product_id,
                    "price_cents": c.server_price_cents,
                    "last_updated": c.last_updated,
                }),
                detected_at: now,
                resolved_at: None,
                resolution_strategy: None,
                resolution_data: None,
                auto_resolved: false,
            });
        }

        for c in &report.customer_conflicts {
            records.push(ConflictRecord {
                id: format!("customer_{}_{}", txn.id, c.customer_id),
                transaction_id: txn.id.clone(),
                conflict_type: ConflictType::Customer,
                severity: ConflictSeverity::Medium,
                client_data: c.client_data.clone(),
                server_data: c.server_data.clone(),
                detected_at: now,
                resolved_at: None,
                resolution_strategy: None,
                resolution_data: None,
                auto_resolved: false,
            });
        }

        for c in &report.product_conflicts {
            records.push(ConflictRecord {
                id: format!("product_{}_{}", txn.id, c.product_id),
                transaction_id: txn.id.clone(),
                conflict_type: ConflictType::Product,
                severity: ConflictSeverity::for_product(c.discontinued),
                client_data: c.client_data.clone(),
                server_data: c.server_data.clone(),
                detected_at: now,
                resolved_at: None,
                resolution_strategy: None,
                resolution_data: None,
                auto_resolved: false,
            });
        }

        for record in &records {
            self.persist(record).await?;
        }

        if !records.is_empty() {
            info!(
                receipt = %txn.receipt_number,
                count = records.len(),
                "Detected conflicts"
            );
        }

        Ok(records)
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Detects, annotates, and resolves a server conflict report for one
    /// transaction. The transaction must already be marked `conflict` or
    /// in flight; this method marks it and re-queues it when everything
    /// auto-resolves.
    pub async fn handle_server_conflicts(
        &self,
        txn: &QueuedTransaction,
        report: &ConflictReport,
    ) -> SyncResult<ConflictSummary> {
        let records = self.detect(txn, report).await?;

        // Annotate the transaction with the worst detected category
        if let Some(worst) = records.iter().max_by_key(|r| severity_rank(r.severity)) {
            self.queue
                .mark_conflict(
                    &txn.id,
                    ConflictAnnotation {
                        conflict_type: worst.conflict_type,
                        resolution_strategy: None,
                        resolved_at: None,
                    },
                )
                .await?;
        }

        let outcomes = self.resolve(records).await?;

        let mut summary = ConflictSummary {
            detected: outcomes.len(),
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome {
                ResolutionOutcome::Resolved(_) => summary.auto_resolved += 1,
                ResolutionOutcome::AwaitingUser(_) => summary.awaiting_user += 1,
                ResolutionOutcome::Deferred(_) => summary.deferred += 1,
            }
        }

        if summary.detected > 0 && self.all_resolved_for(&txn.id).await? {
            self.queue.requeue(&txn.id).await?;
            summary.transaction_requeued = true;
        }

        Ok(summary)
    }

    /// Resolves conflict records in ascending rule-priority order.
    ///
    /// Deterministic for auto-resolve strategies: identical
    /// `(type, severity, client_data, server_data)` inputs always produce
    /// identical resolved output.
    pub async fn resolve(
        &self,
        mut records: Vec<ConflictRecord>,
    ) -> SyncResult<Vec<ResolutionOutcome>> {
        records.sort_by_key(|record| self.rule_for(record).priority);

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.resolve_one(record).await?);
        }
        Ok(outcomes)
    }

    async fn resolve_one(&self, record: ConflictRecord) -> SyncResult<ResolutionOutcome> {
        let rule = self.rule_for(&record);

        debug!(
            conflict = %record.id,
            conflict_type = %record.conflict_type,
            severity = %record.severity,
            strategy = %rule.strategy,
            "Resolving conflict"
        );

        match rule.strategy {
            ResolutionStrategy::ServerWins
            | ResolutionStrategy::ClientWins
            | ResolutionStrategy::Merge
            | ResolutionStrategy::Skip => {
                let data = Self::resolution_data(rule.strategy, &record);
                let resolved = self.finalize(record, rule.strategy, data, true).await?;
                Ok(ResolutionOutcome::Resolved(resolved))
            }

            ResolutionStrategy::RetryLater => {
                debug!(conflict = %record.id, "Deferring conflict to the next cycle");
                Ok(ResolutionOutcome::Deferred(record.id))
            }

            ResolutionStrategy::UserPrompt => {
                self.register_prompt(&record).await;
                Ok(ResolutionOutcome::AwaitingUser(record.id))
            }
        }
    }

    /// Computes the winning data for a deterministic strategy.
    fn resolution_data(strategy: ResolutionStrategy, record: &ConflictRecord) -> Option<Value> {
        match strategy {
            ResolutionStrategy::ServerWins => Some(record.server_data.clone()),
            ResolutionStrategy::ClientWins => Some(record.client_data.clone()),
            ResolutionStrategy::Merge => Some(Self::merge(record)),
            ResolutionStrategy::Skip => None,
            ResolutionStrategy::UserPrompt | ResolutionStrategy::RetryLater => None,
        }
    }

    /// Type-specific merge dispatch.
    fn merge(record: &ConflictRecord) -> Value {
        match record.conflict_type {
            ConflictType::Customer => {
                Self::merge_customer(&record.client_data, &record.server_data)
            }
            // Default merge: server data annotated with the client
            // timestamp, so the client's view is not silently erased.
            _ => {
                let mut merged = record.server_data.clone();
                if let Value::Object(ref mut map) = merged {
                    let client_timestamp = record
                        .client_data
                        .get("timestamp")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!(record.detected_at));
                    map.insert("client_timestamp".to_string(), client_timestamp);
                }
                merged
            }
        }
    }

    /// Customer merge: prefer non-empty client contact fields, union the
    /// address lists, keep the latest of both update timestamps.
    fn merge_customer(client: &Value, server: &Value) -> Value {
        let mut merged = server.clone();
        let Value::Object(ref mut map) = merged else {
            return server.clone();
        };

        for field in ["email", "phone"] {
            let client_value = client.get(field);
            if let Some(value) = client_value {
                let non_empty = value.as_str().map(|s| !s.is_empty()).unwrap_or(false);
                if non_empty {
                    map.insert(field.to_string(), value.clone());
                }
            }
        }

        let mut addresses: Vec<Value> = server
            .get("addresses")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for address in client
            .get("addresses")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
        {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        map.insert("addresses".to_string(), Value::Array(addresses));

        let client_updated = client.get("last_updated").and_then(|v| v.as_i64()).unwrap_or(0);
        let server_updated = server.get("last_updated").and_then(|v| v.as_i64()).unwrap_or(0);
        map.insert(
            "last_updated".to_string(),
            serde_json::json!(client_updated.max(server_updated)),
        );

        merged
    }

    async fn finalize(
        &self,
        mut record: ConflictRecord,
        strategy: ResolutionStrategy,
        data: Option<Value>,
        auto: bool,
    ) -> SyncResult<ConflictRecord> {
        record.resolved_at = Some(Utc::now());
        record.resolution_strategy = Some(strategy);
        record.resolution_data = data;
        record.auto_resolved = auto;
        self.persist(&record).await?;
        Ok(record)
    }

    // =========================================================================
    // User Prompts
    // =========================================================================

    async fn register_prompt(&self, record: &ConflictRecord) {
        self.pending_prompts.lock().await.insert(record.id.clone());
        info!(conflict = %record.id, "Conflict awaiting user decision");

        if let Some(timeout) = self.settings.user_prompt_timeout {
            let engine = self.clone();
            let conflict_id = record.id.clone();
            self.prompt_timeouts
                .schedule(&record.id, timeout, async move {
                    engine.apply_prompt_fallback(&conflict_id).await;
                })
                .await;
        }
    }

    /// Applies an external user decision to a suspended conflict.
    ///
    /// `data` overrides the winning value; when absent, the strategy's
    /// deterministic copy applies.
    pub async fn submit_decision(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        data: Option<Value>,
    ) -> SyncResult<()> {
        let had_prompt = self.pending_prompts.lock().await.remove(conflict_id);
        self.prompt_timeouts.cancel(conflict_id).await;

        let record = self.load(conflict_id).await?;
        if record.resolved_at.is_some() {
            return Err(SyncError::NoPendingPrompt(conflict_id.to_string()));
        }
        if !had_prompt {
            debug!(conflict = conflict_id, "Decision for conflict without a live prompt");
        }

        let data = data.or_else(|| Self::resolution_data(strategy, &record));
        let transaction_id = record.transaction_id.clone();
        self.finalize(record, strategy, data, false).await?;

        info!(conflict = conflict_id, strategy = %strategy, "User decision applied");

        if self.all_resolved_for(&transaction_id).await? {
            self.queue.requeue(&transaction_id).await?;
        }

        Ok(())
    }

    /// Prompt timeout: applies the configured fallback strategy.
    async fn apply_prompt_fallback(&self, conflict_id: &str) {
        if !self.pending_prompts.lock().await.remove(conflict_id) {
            return; // decision arrived first
        }

        let fallback = self.settings.prompt_fallback_strategy;
        warn!(
            conflict = conflict_id,
            fallback = %fallback,
            "User prompt timed out, applying fallback strategy"
        );

        if fallback == ResolutionStrategy::RetryLater {
            // Stays unresolved; surfaced in stats and picked up by the
            // next resolution pass.
            return;
        }

        let record = match self.load(conflict_id).await {
            Ok(record) if record.resolved_at.is_none() => record,
            Ok(_) => return,
            Err(e) => {
                warn!(?e, conflict = conflict_id, "Failed to load conflict for fallback");
                return;
            }
        };

        let data = Self::resolution_data(fallback, &record);
        let transaction_id = record.transaction_id.clone();
        if let Err(e) = self.finalize(record, fallback, data, false).await {
            warn!(?e, conflict = conflict_id, "Failed to apply prompt fallback");
            return;
        }

        match self.all_resolved_for(&transaction_id).await {
            Ok(true) => {
                if let Err(e) = self.queue.requeue(&transaction_id).await {
                    warn!(?e, transaction = %transaction_id, "Failed to re-queue after fallback");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(?e, "Failed to check remaining conflicts after fallback"),
        }
    }

    // =========================================================================
    // Queries & Maintenance
    // =========================================================================

    async fn persist(&self, record: &ConflictRecord) -> SyncResult<()> {
        let metadata = RecordMetadata {
            status: Some(if record.is_pending() { "pending" } else { "resolved" }.to_string()),
            priority: None,
            timestamp: Some(record.detected_at.timestamp_millis()),
        };
        let envelope = RecordEnvelope::new(&record.id, record, metadata)?;
        self.store.put(CONFLICTS_COLLECTION, &envelope).await?;
        Ok(())
    }

    async fn load(&self, conflict_id: &str) -> SyncResult<ConflictRecord> {
        let envelope = self
            .store
            .get(CONFLICTS_COLLECTION, conflict_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        Ok(envelope.decode()?)
    }

    async fn load_all(&self) -> SyncResult<Vec<ConflictRecord>> {
        let envelopes = self.store.query(&RecordQuery::all(CONFLICTS_COLLECTION)).await?;
        let mut records = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match envelope.decode::<ConflictRecord>() {
                Ok(record) => records.push(record),
                Err(e) => warn!(?e, id = %envelope.id, "Skipping undecodable conflict record"),
            }
        }
        Ok(records)
    }

    async fn all_resolved_for(&self, transaction_id: &str) -> SyncResult<bool> {
        Ok(self
            .load_all()
            .await?
            .iter()
            .filter(|record| record.transaction_id == transaction_id)
            .all(|record| !record.is_pending()))
    }

    /// Unresolved conflict records.
    pub async fn pending_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|record| record.is_pending())
            .collect())
    }

    /// Re-attempts resolution of unresolved conflicts that are not
    /// suspended behind a user prompt (retry_later leftovers). Called by
    /// the orchestrator during the resolving-conflicts phase.
    pub async fn resolve_pending(&self) -> SyncResult<usize> {
        let prompts = self.pending_prompts.lock().await.clone();
        let leftovers: Vec<ConflictRecord> = self
            .pending_conflicts()
            .await?
            .into_iter()
            .filter(|record| !prompts.contains(&record.id))
            .collect();

        if leftovers.is_empty() {
            return Ok(0);
        }

        let transaction_ids: HashSet<String> = leftovers
            .iter()
            .map(|record| record.transaction_id.clone())
            .collect();

        let outcomes = self.resolve(leftovers).await?;
        let resolved = outcomes
            .iter()
            .filter(|o| matches!(o, ResolutionOutcome::Resolved(_)))
            .count();

        for transaction_id in transaction_ids {
            if self.all_resolved_for(&transaction_id).await? {
                self.queue.requeue(&transaction_id).await?;
            }
        }

        Ok(resolved)
    }

    /// Aggregate conflict statistics.
    pub async fn stats(&self) -> SyncResult<ConflictStats> {
        let records = self.load_all().await?;
        let pending_prompts = self.pending_prompts.lock().await.len() as u64;

        let mut stats = ConflictStats {
            total: records.len() as u64,
            pending_prompts,
            ..Default::default()
        };

        for record in &records {
            if record.is_pending() {
                stats.pending += 1;
            } else {
                stats.resolved += 1;
                if record.auto_resolved {
                    stats.auto_resolved += 1;
                } else {
                    stats.user_resolved += 1;
                }
            }

            *stats
                .by_type
                .entry(record.conflict_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_severity
                .entry(record.severity.as_str().to_string())
                .or_insert(0) += 1;
        }

        Ok(stats)
    }

    /// Purges resolved conflicts older than the retention window.
    /// Returns the number removed.
    pub async fn cleanup(&self) -> SyncResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(self.settings.retention_days as i64);
        let mut removed = 0u64;

        for record in self.load_all().await? {
            if let Some(resolved_at) = record.resolved_at {
                if resolved_at < cutoff {
                    self.store.remove(CONFLICTS_COLLECTION, &record.id).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "Purged old resolved conflicts");
        }

        Ok(removed)
    }

    /// Cancels prompt timeout timers. Call on shutdown.
    pub async fn shutdown(&self) {
        self.prompt_timeouts.cancel_all().await;
    }
}

fn severity_rank(severity: ConflictSeverity) -> u8 {
    match severity {
        ConflictSeverity::Low => 0,
        ConflictSeverity::Medium => 1,
        ConflictSeverity::High => 2,
        ConflictSeverity::Critical => 3,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueSettings, TransactionQueue};
    use crate::remote::{CustomerConflict, InventoryConflict, PricingConflict};
    use till_core::{LineItem, PaymentMethod, SyncStatus, TransactionDraft};
    use uuid::Uuid;

    fn engine_settings() -> ConflictEngineSettings {
        ConflictEngineSettings {
            retention_days: 7,
            user_prompt_timeout: None,
            prompt_fallback_strategy: ResolutionStrategy::RetryLater,
        }
    }

    async fn setup(
        settings: ConflictEngineSettings,
    ) -> (ConflictEngine, QueueHandle, Arc<RecordStore>) {
        let dir = std::env::temp_dir().join(format!("till-conflict-{}", Uuid::new_v4()));
        let store = Arc::new(RecordStore::open_in_memory(dir).await.unwrap());

        let queue_settings = QueueSettings {
            device_id: "dev-1".into(),
            receipt_prefix: "OFF".into(),
            medium_priority_threshold_cents: 100_000,
            retry_ceiling: 5,
            capacity: 500,
            base_sync_cost_ms: 2000,
            per_item_sync_cost_ms: 1000,
            retention_days: 7,
        };
        let (worker, queue) = TransactionQueue::new(store.clone(), queue_settings);
        tokio::spawn(worker.run());

        let engine = ConflictEngine::new(store.clone(), queue.clone(), settings);
        (engine, queue, store)
    }

    async fn queued_txn(queue: &QueueHandle) -> QueuedTransaction {
        let draft = TransactionDraft {
            store_id: "store-1".into(),
            user_id: "user-1".into(),
            shift_id: "shift-1".into(),
            customer_id: Some("cust-1".into()),
            items: vec![LineItem {
                product_id: "prod-1".into(),
                variation_id: None,
                name: "Iced Latte 16oz".into(),
                quantity: 2,
                unit_price_cents: 7500,
                line_total_cents: 15000,
                category: None,
                sku: None,
            }],
            subtotal_cents: 15000,
            tax_cents: 0,
            discount_cents: 0,
            total_cents: 15000,
            tendered_cents: 15000,
            change_cents: Some(0),
            payment_method: PaymentMethod::Cash,
            payment_details: None,
            order_type: None,
            delivery_platform: None,
            delivery_order_number: None,
        };
        let txn = queue.enqueue(draft, None).await.unwrap();
        queue.claim_for_retry(&txn.id).await.unwrap().unwrap()
    }

    fn zero_stock_report() -> ConflictReport {
        ConflictReport {
            inventory_conflicts: vec![InventoryConflict {
                product_id: "prod-1".into(),
                requested_quantity: 2,
                expected_available: 5,
                available_quantity: 0,
                last_updated: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_zero_stock_inventory_is_critical_server_wins() {
        let (engine, queue, _store) = setup(engine_settings()).await;
        let txn = queued_txn(&queue).await;

        let records = engine.detect(&txn, &zero_stock_report()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, ConflictSeverity::Critical);

        let outcomes = engine.resolve(records.clone()).await.unwrap();
        let ResolutionOutcome::Resolved(resolved) = &outcomes[0] else {
            panic!("expected auto resolution");
        };

        assert_eq!(resolved.resolution_strategy, Some(ResolutionStrategy::ServerWins));
        assert!(resolved.auto_resolved);
        assert_eq!(resolved.resolution_data.as_ref().unwrap(), &records[0].server_data);
    }

    #[tokio::test]
    async fn test_auto_resolution_is_deterministic() {
        let (engine, queue, _store) = setup(engine_settings()).await;
        let txn = queued_txn(&queue).await;

        let first = engine.detect(&txn, &zero_stock_report()).await.unwrap();
        let outcome_a = engine.resolve(first.clone()).await.unwrap();

        // Fresh identical records resolve to the identical output
        let second = first
            .iter()
            .map(|r| ConflictRecord {
                resolved_at: None,
                resolution_strategy: None,
                resolution_data: None,
                auto_resolved: false,
                ..r.clone()
            })
            .collect::<Vec<_>>();
        let outcome_b = engine.resolve(second).await.unwrap();

        let (ResolutionOutcome::Resolved(a), ResolutionOutcome::Resolved(b)) =
            (&outcome_a[0], &outcome_b[0])
        else {
            panic!("expected resolutions");
        };
        assert_eq!(a.resolution_strategy, b.resolution_strategy);
        assert_eq!(a.resolution_data, b.resolution_data);
        assert_eq!(a.auto_resolved, b.auto_resolved);
    }

    #[tokio::test]
    async fn test_pricing_severity_ladder() {
        let (engine, queue, _store) = setup(engine_settings()).await;
        let txn = queued_txn(&queue).await;

        let report = ConflictReport {
            pricing_conflicts: vec![
                PricingConflict {
                    product_id: "p-critical".into(),
                    client_price_cents: 13000,
                    server_price_cents: 10000, // 30% off
                    last_updated: None,
                },
                PricingConflict {
                    product_id: "p-high".into(),
                    client_price_cents: 11500,
                    server_price_cents: 10000, // 15% off
                    last_updated: None,
                },
                PricingConflict {
                    product_id: "p-medium".into(),
                    client_price_cents: 10500,
                    server_price_cents: 10000, // 5% off
                    last_updated: None,
                },
            ],
            ..Default::default()
        };

        let records = engine.detect(&txn, &report).await.unwrap();
        let severities: Vec<_> = records.iter().map(|r| r.severity).collect();
        assert_eq!(
            severities,
            vec![
                ConflictSeverity::Critical,
                ConflictSeverity::High,
                ConflictSeverity::Medium
            ]
        );

        // Medium pricing suspends behind a user prompt
        let outcomes = engine.resolve(records).await.unwrap();
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, ResolutionOutcome::AwaitingUser(_))));
    }

    #[tokio::test]
    async fn test_customer_merge_prefers_client_contacts_and_unions_addresses() {
        let client = serde_json::json!({
            "email": "new@example.com",
            "phone": "",
            "addresses": [{"city": "Cebu"}],
            "last_updated": 200,
        });
        let server = serde_json::json!({
            "email": "old@example.com",
            "phone": "+63 900 000 0000",
            "addresses": [{"city": "Manila"}],
            "last_updated": 100,
        });

        let merged = ConflictEngine::merge_customer(&client, &server);
        assert_eq!(merged["email"], "new@example.com"); // non-empty client wins
        assert_eq!(merged["phone"], "+63 900 000 0000"); // empty client ignored
        assert_eq!(merged["addresses"].as_array().unwrap().len(), 2);
        assert_eq!(merged["last_updated"], 200);
    }

    #[tokio::test]
    async fn test_handle_server_conflicts_requeues_on_full_auto_resolution() {
        let (engine, queue, _store) = setup(engine_settings()).await;
        let txn = queued_txn(&queue).await;

        let summary = engine
            .handle_server_conflicts(&txn, &zero_stock_report())
            .await
            .unwrap();

        assert_eq!(summary.detected, 1);
        assert_eq!(summary.auto_resolved, 1);
        assert!(summary.transaction_requeued);

        // Auto-resolution re-queues the transaction for the next cycle
        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert!(stored.conflict.is_some());
    }

    #[tokio::test]
    async fn test_user_prompt_holds_transaction_until_decision() {
        let (engine, queue, _store) = setup(engine_settings()).await;
        let txn = queued_txn(&queue).await;

        let report = ConflictReport {
            pricing_conflicts: vec![PricingConflict {
                product_id: "p-1".into(),
                client_price_cents: 10500,
                server_price_cents: 10000, // 5% → medium → user prompt
                last_updated: None,
            }],
            ..Default::default()
        };

        let summary = engine.handle_server_conflicts(&txn, &report).await.unwrap();
        assert_eq!(summary.awaiting_user, 1);
        assert!(!summary.transaction_requeued);

        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.pending_prompts, 1);

        // External decision arrives
        let conflict_id = format!("pricing_{}_p-1", txn.id);
        engine
            .submit_decision(&conflict_id, ResolutionStrategy::ClientWins, None)
            .await
            .unwrap();

        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.pending_prompts, 0);
        assert_eq!(stats.user_resolved, 1);
    }

    #[tokio::test]
    async fn test_prompt_timeout_applies_fallback_strategy() {
        let settings = ConflictEngineSettings {
            retention_days: 7,
            user_prompt_timeout: Some(Duration::from_secs(30)),
            prompt_fallback_strategy: ResolutionStrategy::ServerWins,
        };
        let (engine, queue, _store) = setup(settings).await;
        // The store connection must be established under a live clock; pause
        // only afterwards so the prompt-timeout timer can be driven virtually.
        tokio::time::pause();
        let txn = queued_txn(&queue).await;

        let report = ConflictReport {
            pricing_conflicts: vec![PricingConflict {
                product_id: "p-1".into(),
                client_price_cents: 10500,
                server_price_cents: 10000,
                last_updated: None,
            }],
            ..Default::default()
        };

        engine.handle_server_conflicts(&txn, &report).await.unwrap();
        assert_eq!(engine.stats().await.unwrap().pending_prompts, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.pending_prompts, 0);
        assert_eq!(stats.resolved, 1);
        // Fallback resolutions are flagged as not auto-resolved
        assert_eq!(stats.user_resolved, 1);

        let stored = queue.get(&txn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_decision_for_resolved_conflict_rejected() {
        let (engine, queue, _store) = setup(engine_settings()).await;
        let txn = queued_txn(&queue).await;

        engine
            .handle_server_conflicts(&txn, &zero_stock_report())
            .await
            .unwrap();

        let conflict_id = format!("inventory_{}_prod-1", txn.id);
        let err = engine
            .submit_decision(&conflict_id, ResolutionStrategy::ClientWins, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoPendingPrompt(_)));
    }

    #[tokio::test]
    async fn test_unmatched_pair_falls_back_to_user_prompt() {
        let (engine, _queue, _store) = setup(engine_settings()).await;

        let record = ConflictRecord {
            id: "odd-1".into(),
            transaction_id: "txn-x".into(),
            conflict_type: ConflictType::Customer,
            severity: ConflictSeverity::Critical, // no rule row for this pair
            client_data: serde_json::json!({}),
            server_data: serde_json::json!({}),
            detected_at: Utc::now(),
            resolved_at: None,
            resolution_strategy: None,
            resolution_data: None,
            auto_resolved: false,
        };

        let rule = engine.rule_for(&record);
        assert_eq!(rule.strategy, ResolutionStrategy::UserPrompt);
        assert!(!rule.auto_resolve);
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_resolved_only() {
        let (engine, queue, store) = setup(engine_settings()).await;
        let txn = queued_txn(&queue).await;

        engine
            .handle_server_conflicts(&txn, &zero_stock_report())
            .await
            .unwrap();

        // Age the resolved conflict past the retention window
        let conflict_id = format!("inventory_{}_prod-1", txn.id);
        let mut record = engine.load(&conflict_id).await.unwrap();
        record.resolved_at = Some(Utc::now() - ChronoDuration::days(10));
        engine.persist(&record).await.unwrap();

        let removed = engine.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get(CONFLICTS_COLLECTION, &conflict_id)
            .await
            .unwrap()
            .is_none());
    }
}
