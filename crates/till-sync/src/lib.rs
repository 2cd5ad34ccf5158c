//! # till-sync: Offline Sync Engine for Till POS
//!
//! This crate keeps a point-of-sale terminal selling while disconnected,
//! then reconciles everything once connectivity returns without losing,
//! duplicating, or silently overwriting data.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Offline Engine Architecture                       │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  OfflineManager (Facade)                         │  │
//! │  │                                                                  │  │
//! │  │  initialize/shutdown lifecycle, aggregate status, the only      │  │
//! │  │  surface external callers (UI, printing, reporting) touch       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ NetworkMonitor │  │TransactionQueue│  │   SyncOrchestrator     │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Quality tiers, │  │ Priority, rcpt │  │ Single-flight cycles,  │    │
//! │  │ stability gate,│  │ numbers, atomic│  │ tier draining, failure │    │
//! │  │ sync decisions │  │ batch claims   │  │ taxonomy, keyed retries│    │
//! │  └────────────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │                                                      │                  │
//! │                                          ┌───────────▼────────────┐    │
//! │                                          │    ConflictEngine      │    │
//! │                                          │                        │    │
//! │                                          │ Rule table, severity   │    │
//! │                                          │ thresholds, merges,    │    │
//! │                                          │ user-decision channel  │    │
//! │                                          └────────────────────────┘    │
//! │                                                                         │
//! │  WRITE FLOW:  sale → TransactionQueue → RecordStore                    │
//! │  SYNC FLOW:   RecordStore → Orchestrator → RemoteSync →                │
//! │               ConflictEngine → RecordStore                             │
//! │  The NetworkMonitor gates when the sync flow is allowed to run.        │
//! │                                                                         │
//! │  EVENTS (broadcast):                                                   │
//! │  • status-change    - aggregate snapshot on the refresh interval       │
//! │  • sync-progress    - per phase transition and per transaction         │
//! │  • completion       - exactly once per synced transaction,             │
//! │                       keyed by receipt number (idempotency key)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`manager`] - The [`OfflineManager`] facade (lifecycle, status)
//! - [`config`] - Engine configuration (TOML + environment)
//! - [`error`] - Sync error types and retryability taxonomy
//! - [`network`] - Network quality monitor with the stability gate
//! - [`queue`] - Priority transaction queue (serialized command pipeline)
//! - [`orchestrator`] - Sync cycle state machine and retry policy
//! - [`conflict`] - Rule-table conflict resolution engine
//! - [`remote`] - The injected remote backend interface
//! - [`scheduler`] - Named, cancellable recurring tasks
//! - [`retry`] - Keyed, cancellable deferred retry timers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use till_sync::{OfflineConfig, OfflineManager};
//!
//! // The backend client implements till_sync::RemoteSync
//! let remote: Arc<dyn till_sync::RemoteSync> = Arc::new(backend_client);
//!
//! let config = OfflineConfig::load_or_default(None);
//! let manager = OfflineManager::new(config, remote);
//! manager.initialize().await?;
//!
//! // Record a sale while offline
//! let txn = manager.queue_transaction(draft).await?;
//! println!("queued as {}", txn.receipt_number);
//!
//! // Reconciliation happens automatically on reconnect; or force it:
//! let report = manager.trigger_sync(till_sync::SyncTrigger::Immediate).await?;
//! println!("synced {} transactions", report.synced);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod conflict;
pub mod error;
pub mod manager;
pub mod network;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;

// =============================================================================
// Re-exports
// =============================================================================

// Facade
pub use manager::{OfflineManager, OfflineStatus};

// Configuration
pub use config::{
    ConflictSettings, DeviceConfig, NetworkSettings, OfflineConfig, StorageSettings, StoreIdentity,
    SyncSettings,
};

// Errors
pub use error::{SyncError, SyncResult};

// Network monitor
pub use network::{NetworkMonitor, NetworkStatus, SyncRecommendation, SyncUrgency};

// Queue
pub use queue::{QueueHandle, QueueSettings, TransactionCompleted, TransactionQueue};

// Orchestrator
pub use orchestrator::{
    SyncItemError, SyncOrchestrator, SyncOutcome, SyncPhase, SyncProgress, SyncReport, SyncTrigger,
};

// Conflict engine
pub use conflict::{
    default_rules, ConflictEngine, ConflictEngineSettings, ConflictRule, ConflictSummary,
    ResolutionOutcome,
};

// Remote interface
pub use remote::{
    ConflictReport, CustomerConflict, InventoryConflict, OfflineMarker, PayloadItem,
    PricingConflict, ProbeSample, ProductConflict, RemoteError, RemoteSync, ServerAck,
    TransactionPayload,
};

// Infrastructure
pub use retry::RetryRegistry;
pub use scheduler::Scheduler;
