//! # Engine Configuration
//!
//! Configuration management for the offline sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TILL_DEVICE_ID=abc-123                                             │
//! │     TILL_ENDPOINT_URL=https://api.example.com                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/till-pos/offline.toml (Linux)                            │
//! │     ~/Library/Application Support/com.till.pos/offline.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, 60s background interval, ...             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # offline.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [store]
//! id = "store-001"
//! name = "Downtown Branch"
//!
//! [sync]
//! endpoint_url = "https://api.example.com"
//! background_interval_secs = 60
//! retry_ceiling = 5
//! medium_priority_threshold_cents = 100000
//!
//! [network]
//! stability_threshold_secs = 10
//!
//! [conflict]
//! retention_days = 7
//! # user_prompt_timeout_secs left unset: prompts wait indefinitely
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use till_core::ResolutionStrategy;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1", "Back Office").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration for the store this terminal belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreIdentity {
    /// Unique store identifier.
    pub id: String,

    /// Human-readable store name.
    #[serde(default)]
    pub name: String,
}

impl Default for StoreIdentity {
    fn default() -> Self {
        StoreIdentity {
            id: "default-store".to_string(),
            name: "Default Store".to_string(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// HTTP(S) URL of the central backend (informational; the wire client
    /// is injected, but the URL is validated here for early feedback).
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Interval between background sync checks (seconds).
    #[serde(default = "default_background_interval")]
    pub background_interval_secs: u64,

    /// Interval between status snapshot broadcasts (seconds).
    #[serde(default = "default_status_refresh_interval")]
    pub status_refresh_interval_secs: u64,

    /// Retry attempts before a transaction is demoted to low priority and
    /// surfaced on the needs-attention list.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Initial backoff for per-transaction retries (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_retry_backoff_ms: u64,

    /// Maximum backoff for per-transaction retries (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_retry_backoff_secs: u64,

    /// Non-cash sales above this total (cents) get medium priority.
    #[serde(default = "default_medium_threshold")]
    pub medium_priority_threshold_cents: i64,

    /// Fixed per-transaction sync cost used for time estimates (ms).
    #[serde(default = "default_base_sync_cost")]
    pub base_sync_cost_ms: u64,

    /// Per-line-item sync cost used for time estimates (ms).
    #[serde(default = "default_item_sync_cost")]
    pub per_item_sync_cost_ms: u64,

    /// Prefix for offline receipt numbers.
    #[serde(default = "default_receipt_prefix")]
    pub receipt_prefix: String,

    /// Maximum unsynced transactions the queue will hold.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_background_interval() -> u64 {
    60
}
fn default_status_refresh_interval() -> u64 {
    30
}
fn default_retry_ceiling() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    60
}
fn default_medium_threshold() -> i64 {
    100_000
}
fn default_base_sync_cost() -> u64 {
    2000
}
fn default_item_sync_cost() -> u64 {
    1000
}
fn default_receipt_prefix() -> String {
    "OFF".to_string()
}
fn default_queue_capacity() -> usize {
    till_core::MAX_QUEUE_CAPACITY
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            endpoint_url: None,
            background_interval_secs: default_background_interval(),
            status_refresh_interval_secs: default_status_refresh_interval(),
            retry_ceiling: default_retry_ceiling(),
            initial_retry_backoff_ms: default_initial_backoff(),
            max_retry_backoff_secs: default_max_backoff(),
            medium_priority_threshold_cents: default_medium_threshold(),
            base_sync_cost_ms: default_base_sync_cost(),
            per_item_sync_cost_ms: default_item_sync_cost(),
            receipt_prefix: default_receipt_prefix(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// Network monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Seconds a reconnected link must hold before it is trusted for
    /// syncing (the stability gate).
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold_secs: u64,

    /// Interval between connectivity probes (seconds).
    #[serde(default = "default_quality_check_interval")]
    pub quality_check_interval_secs: u64,

    /// Quality observations retained for stability assessment.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_stability_threshold() -> u64 {
    10
}
fn default_quality_check_interval() -> u64 {
    30
}
fn default_history_limit() -> usize {
    20
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            stability_threshold_secs: default_stability_threshold(),
            quality_check_interval_secs: default_quality_check_interval(),
            history_limit: default_history_limit(),
        }
    }
}

// =============================================================================
// Conflict Settings
// =============================================================================

/// Conflict engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictSettings {
    /// Days resolved conflicts are retained before the periodic purge.
    #[serde(default = "default_conflict_retention")]
    pub retention_days: u32,

    /// How long a user-prompt conflict waits for an external decision
    /// before the fallback strategy applies. Unset = wait indefinitely
    /// (the unresolved case is surfaced in conflict stats, never hidden).
    #[serde(default)]
    pub user_prompt_timeout_secs: Option<u64>,

    /// Strategy applied when a user prompt times out.
    #[serde(default = "default_prompt_fallback")]
    pub prompt_fallback_strategy: ResolutionStrategy,
}

fn default_conflict_retention() -> u32 {
    7
}
fn default_prompt_fallback() -> ResolutionStrategy {
    ResolutionStrategy::RetryLater
}

impl Default for ConflictSettings {
    fn default() -> Self {
        ConflictSettings {
            retention_days: default_conflict_retention(),
            user_prompt_timeout_secs: None,
            prompt_fallback_strategy: default_prompt_fallback(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Data directory. Defaults to the platform data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Days synced transactions are retained before deletion.
    #[serde(default = "default_storage_retention")]
    pub retention_days: u32,

    /// Interval between cleanup sweeps (seconds).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_storage_retention() -> u32 {
    7
}
fn default_cleanup_interval() -> u64 {
    24 * 60 * 60
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            data_dir: None,
            retention_days: default_storage_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete offline engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Store identity.
    #[serde(default)]
    pub store: StoreIdentity,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Network monitor settings.
    #[serde(default)]
    pub network: NetworkSettings,

    /// Conflict engine settings.
    #[serde(default)]
    pub conflict: ConflictSettings,

    /// Durable store settings.
    #[serde(default)]
    pub storage: StorageSettings,
}

impl OfflineConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (offline.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading offline engine config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load offline config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Offline engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if let Some(ref raw) = self.sync.endpoint_url {
            let parsed = url::Url::parse(raw)
                .map_err(|e| SyncError::InvalidEndpoint(format!("{raw}: {e}")))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(SyncError::InvalidEndpoint(format!(
                    "endpoint must be http or https, got: {raw}"
                )));
            }
        }

        if self.sync.retry_ceiling == 0 {
            return Err(SyncError::InvalidConfig(
                "retry_ceiling must be greater than 0".into(),
            ));
        }

        if self.sync.queue_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "queue_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TILL_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("TILL_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(id) = std::env::var("TILL_STORE_ID") {
            self.store.id = id;
        }

        if let Ok(url) = std::env::var("TILL_ENDPOINT_URL") {
            debug!(url = %url, "Overriding endpoint URL from environment");
            self.sync.endpoint_url = Some(url);
        }

        if let Ok(dir) = std::env::var("TILL_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "till", "pos")
            .map(|dirs| dirs.config_dir().join("offline.toml"))
    }

    /// Resolves the data directory (configured or platform default).
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .or_else(|| {
                directories::ProjectDirs::from("com", "till", "pos")
                    .map(|dirs| dirs.data_dir().to_path_buf())
            })
            .unwrap_or_else(|| PathBuf::from("./till-data"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the store ID.
    pub fn store_id(&self) -> &str {
        &self.store.id
    }

    /// Reconnect stability gate duration.
    pub fn stability_threshold(&self) -> Duration {
        Duration::from_secs(self.network.stability_threshold_secs)
    }

    /// Background sync tick interval.
    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.sync.background_interval_secs)
    }

    /// Status broadcast interval.
    pub fn status_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.sync.status_refresh_interval_secs)
    }

    /// Connectivity probe interval.
    pub fn quality_check_interval(&self) -> Duration {
        Duration::from_secs(self.network.quality_check_interval_secs)
    }

    /// Cleanup sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.storage.cleanup_interval_secs)
    }

    /// Initial per-transaction retry backoff.
    pub fn initial_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.initial_retry_backoff_ms)
    }

    /// Maximum per-transaction retry backoff.
    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.sync.max_retry_backoff_secs)
    }

    /// How long a user prompt waits before the fallback strategy applies.
    pub fn user_prompt_timeout(&self) -> Option<Duration> {
        self.conflict.user_prompt_timeout_secs.map(Duration::from_secs)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
