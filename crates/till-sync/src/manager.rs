//! # Offline Manager
//!
//! The orchestration facade: composes the store, monitor, queue,
//! orchestrator, and conflict engine into one lifecycle, aggregates
//! status, and is the only thing external callers talk to.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      OfflineManager Lifecycle                           │
//! │                                                                         │
//! │  OfflineManager::new(config, remote)                                   │
//! │       │   (subscription channels exist from here on)                   │
//! │       ▼                                                                 │
//! │  initialize()                                                          │
//! │       │  1. RecordStore::open           (durable storage first)        │
//! │       │  2. NetworkMonitor              (stability gate armed)         │
//! │       │  3. TransactionQueue worker     (serialized mutations)         │
//! │       │  4. ConflictEngine                                             │
//! │       │  5. SyncOrchestrator                                           │
//! │       │  6. reconnect+stability → immediate sync wiring                │
//! │       │  7. scheduler: background-sync / quality-check /               │
//! │       │               status-refresh / cleanup                         │
//! │       ▼                                                                 │
//! │  running ── queue_transaction / trigger_sync / status / ...            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  shutdown()  cancels every scheduled task, retry timer, worker,        │
//! │               and listener registration deterministically              │
//! │                                                                         │
//! │  status() NEVER fails: before initialize (and after shutdown) it       │
//! │  returns the defined uninitialized snapshot.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use till_core::{ConflictStats, QualityLevel, QueueStats, QueuedTransaction, ResolutionStrategy,
    TransactionDraft};
use till_store::{RecordStore, StoreConfig};

use crate::config::OfflineConfig;
use crate::conflict::{ConflictEngine, ConflictEngineSettings};
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::orchestrator::{
    OrchestratorSettings, SyncOrchestrator, SyncPhase, SyncProgress, SyncReport, SyncTrigger,
};
use crate::queue::{QueueHandle, QueueSettings, TransactionCompleted, TransactionQueue};
use crate::remote::RemoteSync;
use crate::scheduler::Scheduler;

// =============================================================================
// Status Snapshot
// =============================================================================

/// Point-in-time aggregate snapshot for external consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineStatus {
    pub initialized: bool,

    // Network
    pub is_online: bool,
    pub stable_connection: bool,
    pub network_quality: QualityLevel,

    // Queue
    pub queue: QueueStats,
    /// Permanently-failed transactions needing manual attention.
    pub needs_attention: u64,

    // Sync
    pub sync_phase: SyncPhase,
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,

    // Conflicts
    pub conflicts: ConflictStats,

    // Storage
    pub storage_bytes: u64,
    pub storage_backend: Option<String>,
}

impl OfflineStatus {
    /// The defined snapshot for an engine that has not been initialized.
    pub fn uninitialized() -> Self {
        OfflineStatus {
            initialized: false,
            is_online: false,
            stable_connection: false,
            network_quality: QualityLevel::Offline,
            queue: QueueStats::default(),
            needs_attention: 0,
            sync_phase: SyncPhase::Idle,
            is_syncing: false,
            last_sync: None,
            conflicts: ConflictStats::default(),
            storage_bytes: 0,
            storage_backend: None,
        }
    }
}

// =============================================================================
// Status Collector
// =============================================================================

/// Gathers the aggregate snapshot from every service. Component failures
/// degrade individual fields instead of failing the snapshot.
#[derive(Clone)]
struct StatusCollector {
    store: Arc<RecordStore>,
    monitor: NetworkMonitor,
    queue: QueueHandle,
    conflicts: ConflictEngine,
    orchestrator: SyncOrchestrator,
}

impl StatusCollector {
    async fn collect(&self) -> OfflineStatus {
        let network = self.monitor.status().await;

        let queue = match self.queue.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(?e, "Queue stats unavailable for status snapshot");
                QueueStats::default()
            }
        };

        let needs_attention = match self.queue.needs_attention().await {
            Ok(list) => list.len() as u64,
            Err(_) => 0,
        };

        let conflicts = match self.conflicts.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(?e, "Conflict stats unavailable for status snapshot");
                ConflictStats::default()
            }
        };

        let (storage_bytes, storage_backend) = match self.store.stats().await {
            Ok(stats) => (stats.total_bytes, Some(stats.backend.to_string())),
            Err(_) => (0, None),
        };

        let phase = self.orchestrator.phase().await;

        OfflineStatus {
            initialized: true,
            is_online: network.is_online,
            stable_connection: network.stable_connection,
            network_quality: network.quality.level,
            queue,
            needs_attention,
            sync_phase: phase,
            is_syncing: phase != SyncPhase::Idle,
            last_sync: self.orchestrator.last_sync().await,
            conflicts,
            storage_bytes,
            storage_backend,
        }
    }
}

// =============================================================================
// Services (live after initialize)
// =============================================================================

struct Services {
    store: Arc<RecordStore>,
    monitor: NetworkMonitor,
    queue: QueueHandle,
    conflicts: ConflictEngine,
    orchestrator: SyncOrchestrator,
    scheduler: Scheduler,
    collector: StatusCollector,
    reconnect_task: JoinHandle<()>,
}

// =============================================================================
// Offline Manager
// =============================================================================

/// The single public entry point to the offline engine.
pub struct OfflineManager {
    config: OfflineConfig,
    remote: Arc<dyn RemoteSync>,
    services: RwLock<Option<Services>>,

    // Channels exist from construction so consumers can subscribe before
    // (and across) initialize/shutdown.
    status_events: broadcast::Sender<OfflineStatus>,
    progress_events: broadcast::Sender<SyncProgress>,
    completion_events: broadcast::Sender<TransactionCompleted>,
}

impl OfflineManager {
    /// Creates an uninitialized manager. Cheap; no I/O happens here.
    pub fn new(config: OfflineConfig, remote: Arc<dyn RemoteSync>) -> Self {
        let (status_events, _) = broadcast::channel(32);
        let (progress_events, _) = broadcast::channel(64);
        let (completion_events, _) = broadcast::channel(64);

        OfflineManager {
            config,
            remote,
            services: RwLock::new(None),
            status_events,
            progress_events,
            completion_events,
        }
    }

    /// Starts the engine: services in dependency order, cross-service
    /// wiring, and the scheduled background tasks.
    pub async fn initialize(&self) -> SyncResult<()> {
        let mut slot = self.services.write().await;
        if slot.is_some() {
            warn!("Offline manager already initialized");
            return Ok(());
        }

        info!("Initializing offline engine");
        self.config.validate()?;

        // 1. Durable store
        let store = Arc::new(
            RecordStore::open(StoreConfig::new(self.config.data_dir())).await?,
        );

        // 2. Network monitor
        let monitor = NetworkMonitor::new(
            self.config.stability_threshold(),
            self.config.network.history_limit,
        );

        // 3. Queue worker
        let (queue_worker, queue) = TransactionQueue::with_completion_sender(
            store.clone(),
            QueueSettings::from_config(&self.config),
            self.completion_events.clone(),
        );
        tokio::spawn(queue_worker.run());

        // 4. Conflict engine
        let conflicts = ConflictEngine::new(
            store.clone(),
            queue.clone(),
            ConflictEngineSettings::from_config(&self.config),
        );

        // 5. Sync orchestrator
        let orchestrator = SyncOrchestrator::with_progress_sender(
            queue.clone(),
            monitor.clone(),
            conflicts.clone(),
            self.remote.clone(),
            OrchestratorSettings::from_config(&self.config),
            self.progress_events.clone(),
        );

        // 6. Reconnect + stability → immediate sync
        let reconnect_task = Self::spawn_reconnect_wiring(monitor.clone(), orchestrator.clone());

        let collector = StatusCollector {
            store: store.clone(),
            monitor: monitor.clone(),
            queue: queue.clone(),
            conflicts: conflicts.clone(),
            orchestrator: orchestrator.clone(),
        };

        // 7. Scheduled background tasks
        let scheduler = Scheduler::new();

        {
            let orchestrator = orchestrator.clone();
            scheduler
                .spawn_recurring("background-sync", self.config.background_interval(), move || {
                    let orchestrator = orchestrator.clone();
                    Box::pin(async move {
                        orchestrator.background_tick().await;
                    })
                })
                .await;
        }

        {
            let remote = self.remote.clone();
            let monitor = monitor.clone();
            scheduler
                .spawn_recurring("quality-check", self.config.quality_check_interval(), move || {
                    let remote = remote.clone();
                    let monitor = monitor.clone();
                    Box::pin(async move {
                        match remote.ping().await {
                            Ok(probe) => {
                                monitor.set_connectivity(true).await;
                                monitor
                                    .record_observation(Some(probe.rtt_ms), probe.bandwidth_mbps)
                                    .await;
                            }
                            Err(e) => {
                                debug!(?e, "Connectivity probe failed");
                                monitor.set_connectivity(false).await;
                            }
                        }
                    })
                })
                .await;
        }

        {
            let collector = collector.clone();
            let status_events = self.status_events.clone();
            scheduler
                .spawn_recurring(
                    "status-refresh",
                    self.config.status_refresh_interval(),
                    move || {
                        let collector = collector.clone();
                        let status_events = status_events.clone();
                        Box::pin(async move {
                            let _ = status_events.send(collector.collect().await);
                        })
                    },
                )
                .await;
        }

        {
            let queue = queue.clone();
            let conflicts = conflicts.clone();
            scheduler
                .spawn_recurring("cleanup", self.config.cleanup_interval(), move || {
                    let queue = queue.clone();
                    let conflicts = conflicts.clone();
                    Box::pin(async move {
                        if let Err(e) = queue.cleanup().await {
                            warn!(?e, "Transaction retention sweep failed");
                        }
                        if let Err(e) = conflicts.cleanup().await {
                            warn!(?e, "Conflict purge failed");
                        }
                    })
                })
                .await;
        }

        *slot = Some(Services {
            store,
            monitor,
            queue,
            conflicts,
            orchestrator,
            scheduler,
            collector,
            reconnect_task,
        });

        info!(
            device = %self.config.device_id(),
            store = %self.config.store_id(),
            "Offline engine ready"
        );
        Ok(())
    }

    /// Listens for the stability gate opening after a reconnect and
    /// triggers an immediate sync. Only the rising edge counts; quality
    /// fluctuations on an already-stable link do not re-trigger.
    fn spawn_reconnect_wiring(
        monitor: NetworkMonitor,
        orchestrator: SyncOrchestrator,
    ) -> JoinHandle<()> {
        let mut events = monitor.subscribe();
        tokio::spawn(async move {
            let mut was_stable = false;
            loop {
                match events.recv().await {
                    Ok(status) => {
                        let stable_now = status.is_online && status.stable_connection;
                        if stable_now && !was_stable {
                            info!("Connection stabilized, triggering sync");
                            let report = orchestrator.run_cycle(SyncTrigger::Immediate).await;
                            debug!(outcome = ?report.outcome, "Reconnect sync finished");
                        }
                        was_stable = stable_now;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Reconnect wiring lagged behind status events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stops every scheduled task, worker, and timer. Idempotent.
    pub async fn shutdown(&self) {
        let Some(services) = self.services.write().await.take() else {
            return;
        };

        info!("Shutting down offline engine");

        services.scheduler.shutdown().await;
        services.reconnect_task.abort();
        services.orchestrator.shutdown().await;
        services.conflicts.shutdown().await;
        services.monitor.shutdown().await;
        services.queue.shutdown().await;
        services.store.close().await;

        info!("Offline engine stopped");
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Validates and queues a completed sale, then opportunistically
    /// triggers an immediate sync when the link is online and stable.
    pub async fn queue_transaction(
        &self,
        draft: TransactionDraft,
    ) -> SyncResult<QueuedTransaction> {
        let services = self.services.read().await;
        let services = services.as_ref().ok_or(SyncError::NotInitialized)?;

        let network = services.monitor.status().await;
        let quality = network.quality.level.as_str().to_string();

        let txn = services.queue.enqueue(draft, Some(quality)).await?;

        if network.is_online && network.stable_connection {
            let orchestrator = services.orchestrator.clone();
            tokio::spawn(async move {
                let report = orchestrator.run_cycle(SyncTrigger::Immediate).await;
                debug!(outcome = ?report.outcome, "Post-enqueue sync finished");
            });
        }

        Ok(txn)
    }

    /// Runs a sync cycle now (manual) or as a background check.
    pub async fn trigger_sync(&self, trigger: SyncTrigger) -> SyncResult<SyncReport> {
        let services = self.services.read().await;
        let services = services.as_ref().ok_or(SyncError::NotInitialized)?;
        Ok(services.orchestrator.run_cycle(trigger).await)
    }

    /// Cancels any stale retry timer and retries one transaction now.
    pub async fn retry_transaction(&self, id: &str) -> SyncResult<bool> {
        let services = self.services.read().await;
        let services = services.as_ref().ok_or(SyncError::NotInitialized)?;
        services.orchestrator.retry_transaction(id).await
    }

    /// Permanently-failed transactions needing manual attention.
    pub async fn needs_attention(&self) -> SyncResult<Vec<QueuedTransaction>> {
        let services = self.services.read().await;
        let services = services.as_ref().ok_or(SyncError::NotInitialized)?;
        services.queue.needs_attention().await
    }

    /// Applies an external user decision to a suspended conflict.
    pub async fn submit_conflict_decision(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        data: Option<serde_json::Value>,
    ) -> SyncResult<()> {
        let services = self.services.read().await;
        let services = services.as_ref().ok_or(SyncError::NotInitialized)?;
        services
            .conflicts
            .submit_decision(conflict_id, strategy, data)
            .await
    }

    /// Aggregate status snapshot. Never fails: before `initialize` (and
    /// after `shutdown`) the defined uninitialized snapshot is returned.
    pub async fn status(&self) -> OfflineStatus {
        let services = self.services.read().await;
        match services.as_ref() {
            Some(services) => services.collector.collect().await,
            None => OfflineStatus::uninitialized(),
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Status-change channel (refreshed on the status interval).
    pub fn subscribe_status(&self) -> broadcast::Receiver<OfflineStatus> {
        self.status_events.subscribe()
    }

    /// Sync-progress channel.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress_events.subscribe()
    }

    /// Completion events, keyed by receipt number, fired exactly once per
    /// transaction when it reaches `synced`.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<TransactionCompleted> {
        self.completion_events.subscribe()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ProbeSample, RemoteError, ServerAck, TransactionPayload};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use till_core::{LineItem, PaymentMethod, SyncStatus};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    struct ToggleRemote {
        online: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    impl ToggleRemote {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(ToggleRemote {
                online: AtomicBool::new(online),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteSync for ToggleRemote {
        async fn push_transaction(
            &self,
            payload: TransactionPayload,
        ) -> Result<ServerAck, RemoteError> {
            if !self.online.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("unreachable".into()));
            }
            let receipt = payload.offline.receipt_number.clone();
            self.calls.lock().await.push(receipt.clone());
            Ok(ServerAck {
                server_id: format!("srv-{receipt}"),
            })
        }

        async fn ping(&self) -> Result<ProbeSample, RemoteError> {
            if !self.online.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("unreachable".into()));
            }
            Ok(ProbeSample {
                rtt_ms: 20.0,
                bandwidth_mbps: Some(10.0),
            })
        }
    }

    fn test_config() -> OfflineConfig {
        let mut config = OfflineConfig::default();
        config.storage.data_dir = Some(data_dir());
        config
    }

    fn data_dir() -> PathBuf {
        std::env::temp_dir().join(format!("till-manager-{}", Uuid::new_v4()))
    }

    fn draft(total_cents: i64) -> TransactionDraft {
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
            payment_method: PaymentMethod::Cash,
            payment_details: None,
            order_type: None,
            delivery_platform: None,
            delivery_order_number: None,
        }
    }

    #[tokio::test]
    async fn test_status_before_initialize_is_defined() {
        let manager = OfflineManager::new(test_config(), ToggleRemote::new(true));

        let status = manager.status().await;
        assert!(!status.initialized);
        assert!(!status.is_online);
        assert_eq!(status.network_quality, QualityLevel::Offline);
        assert_eq!(status.queue.total, 0);
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let manager = OfflineManager::new(test_config(), ToggleRemote::new(true));
        let err = manager.queue_transaction(draft(1000)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_queue_sync_shutdown() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("till_sync=debug")
            .with_test_writer()
            .try_init();

        let remote = ToggleRemote::new(true);
        let manager = OfflineManager::new(test_config(), remote.clone());
        let mut completions = manager.subscribe_completions();

        manager.initialize().await.unwrap();

        // Let the first quality probe land and the stability gate open
        tokio::time::sleep(Duration::from_secs(12)).await;
        let status = manager.status().await;
        assert!(status.initialized);
        assert!(status.is_online);
        assert!(status.stable_connection);

        let txn = manager.queue_transaction(draft(1000)).await.unwrap();
        assert_eq!(txn.receipt_number, "OFF000001");
        assert_eq!(txn.network_quality.as_deref(), Some("excellent"));

        // The opportunistic post-enqueue sync reconciles it
        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = manager.status().await;
        assert_eq!(status.queue.synced, 1);
        assert_eq!(status.queue.pending, 0);

        let event = completions.recv().await.unwrap();
        assert_eq!(event.receipt_number, "OFF000001");

        manager.shutdown().await;
        let status = manager.status().await;
        assert!(!status.initialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_sync_automatically() {
        let remote = ToggleRemote::new(false);
        let manager = OfflineManager::new(test_config(), remote.clone());
        manager.initialize().await.unwrap();

        // Offline: the sale stays queued
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.queue_transaction(draft(1000)).await.unwrap();
        let status = manager.status().await;
        assert!(!status.is_online);
        assert_eq!(status.queue.pending, 1);

        // Connectivity returns; the next probe plus the stability gate
        // must trigger a sync without any manual call
        remote.set_online(true);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let status = manager.status().await;
        assert!(status.is_online);
        assert_eq!(status.queue.synced, 1);
        assert_eq!(status.queue.pending, 0);
        assert!(status.last_sync.is_some());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_and_needs_attention() {
        let remote = ToggleRemote::new(true);
        let manager = OfflineManager::new(test_config(), remote.clone());
        manager.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        // Take the backend down after the probe said online: pushes fail
        remote.set_online(false);
        manager.queue_transaction(draft(1000)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let report = manager.trigger_sync(SyncTrigger::Immediate).await.unwrap();
        assert!(report.failed >= 1 || report.synced == 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = OfflineManager::new(test_config(), ToggleRemote::new(true));
        manager.shutdown().await; // before initialize: no-op
        manager.initialize().await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await; // twice: no-op
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_refresh_broadcasts_snapshots() {
        let remote = ToggleRemote::new(true);
        let manager = OfflineManager::new(test_config(), remote.clone());
        let mut status_events = manager.subscribe_status();

        manager.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;

        let snapshot = status_events.recv().await.unwrap();
        assert!(snapshot.initialized);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_state_visible_in_status() {
        let remote = ToggleRemote::new(true);
        let manager = OfflineManager::new(test_config(), remote.clone());
        manager.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        let txn = manager.queue_transaction(draft(1000)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Synced transactions stay visible (and immutable) until the
        // retention sweep removes them
        let status = manager.status().await;
        assert_eq!(status.queue.total, 1);
        assert_eq!(status.queue.synced, 1);
        assert_eq!(status.conflicts.total, 0);
        assert!(status.storage_backend.is_some());

        let stored = {
            let services = manager.services.read().await;
            services.as_ref().unwrap().queue.get(&txn.id).await.unwrap().unwrap()
        };
        assert_eq!(stored.sync_status, SyncStatus::Synced);

        manager.shutdown().await;
    }
}
