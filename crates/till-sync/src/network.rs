//! # Network Quality Monitor
//!
//! Classifies connectivity into discrete quality tiers and recommends
//! whether and how to sync.
//!
//! ## Stability Gate
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Reconnect Stability Gate                             │
//! │                                                                         │
//! │  offline ──reconnect──► online (unstable)                              │
//! │                            │                                            │
//! │                            │  stability timer (default 10s)            │
//! │                            │                                            │
//! │              drop before   │   timer elapses with no drop              │
//! │              expiry        ▼                                            │
//! │       ◄────────────── online (STABLE) ──► sync decisions allowed       │
//! │                                                                         │
//! │  Sync decisions require STABILITY, not just connectivity, so the       │
//! │  engine does not thrash on a flapping link.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Decision Table
//! ```text
//! quality    │ should_sync      │ urgency    │ batch │ est/item
//! ───────────┼──────────────────┼────────────┼───────┼─────────
//! excellent  │ yes              │ immediate  │ ≤20   │ 1.5s
//! good       │ yes              │ immediate  │ ≤15   │ 2.5s
//! fair       │ yes              │ delayed    │ ≤10   │ 4s
//! poor       │ pending ≤ 5 only │ background │ ≤5    │ 8s
//! offline /  │ never            │ wait       │ 0     │ -
//! unstable   │                  │            │       │
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use till_core::{QualityLevel, QualityObservation};

// =============================================================================
// Status Snapshot
// =============================================================================

/// Point-in-time network status, sent to listeners on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Whether the terminal currently has connectivity.
    pub is_online: bool,

    /// True on the first status after an offline → online transition.
    pub just_reconnected: bool,

    /// True once the stability gate has elapsed without a drop.
    pub stable_connection: bool,

    /// Current quality classification.
    pub quality: QualityObservation,

    /// When the last quality observation was recorded.
    pub last_quality_check: Option<DateTime<Utc>>,
}

// =============================================================================
// Sync Recommendation
// =============================================================================

/// How urgently the engine should act on a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncUrgency {
    /// Sync now.
    Immediate,
    /// Sync, but a short delay is acceptable.
    Delayed,
    /// Only opportunistic background syncing; low tier is skipped.
    Background,
    /// Do not sync.
    Wait,
}

impl std::fmt::Display for SyncUrgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncUrgency::Immediate => write!(f, "immediate"),
            SyncUrgency::Delayed => write!(f, "delayed"),
            SyncUrgency::Background => write!(f, "background"),
            SyncUrgency::Wait => write!(f, "wait"),
        }
    }
}

/// Sync decision derived from current network conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecommendation {
    pub should_sync: bool,
    pub urgency: SyncUrgency,
    pub reason: String,
    /// Maximum transactions per batch under current conditions.
    pub batch_size: u32,
    /// Estimated cost per transaction (milliseconds).
    pub estimated_ms_per_item: u64,
}

impl SyncRecommendation {
    fn wait(reason: impl Into<String>) -> Self {
        SyncRecommendation {
            should_sync: false,
            urgency: SyncUrgency::Wait,
            reason: reason.into(),
            batch_size: 0,
            estimated_ms_per_item: 0,
        }
    }
}

// =============================================================================
// Monitor State
// =============================================================================

#[derive(Debug)]
struct MonitorState {
    is_online: bool,
    just_reconnected: bool,
    stable: bool,
    quality: QualityObservation,
    history: VecDeque<QualityObservation>,
    last_quality_check: Option<DateTime<Utc>>,
}

impl MonitorState {
    fn new() -> Self {
        MonitorState {
            is_online: false,
            just_reconnected: false,
            stable: false,
            quality: QualityObservation::offline(Utc::now()),
            history: VecDeque::new(),
            last_quality_check: None,
        }
    }

    fn snapshot(&self) -> NetworkStatus {
        NetworkStatus {
            is_online: self.is_online,
            just_reconnected: self.just_reconnected,
            stable_connection: self.stable,
            quality: self.quality.clone(),
            last_quality_check: self.last_quality_check,
        }
    }
}

// =============================================================================
// Network Monitor
// =============================================================================

/// Connectivity and quality monitor with a reconnect stability gate.
///
/// Observations arrive from outside (the facade wires a periodic probe
/// against the remote); the monitor owns classification, the stability
/// timer, and listener notification.
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<RwLock<MonitorState>>,
    events: broadcast::Sender<NetworkStatus>,
    stability_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    stability_threshold: Duration,
    history_limit: usize,
}

impl NetworkMonitor {
    /// Creates a monitor. Starts offline until the first probe reports.
    pub fn new(stability_threshold: Duration, history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(32);
        NetworkMonitor {
            state: Arc::new(RwLock::new(MonitorState::new())),
            events,
            stability_task: Arc::new(Mutex::new(None)),
            stability_threshold,
            history_limit,
        }
    }

    /// Subscribes to status-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatus> {
        self.events.subscribe()
    }

    /// Current status snapshot.
    pub async fn status(&self) -> NetworkStatus {
        self.state.read().await.snapshot()
    }

    /// Recent quality observations, most recent last.
    pub async fn history(&self) -> Vec<QualityObservation> {
        self.state.read().await.history.iter().cloned().collect()
    }

    /// Reports a connectivity transition.
    ///
    /// Going online arms the stability timer; quality is reassessed by
    /// the next observation. Going offline clears stability immediately.
    pub async fn set_connectivity(&self, online: bool) {
        let transition = {
            let mut state = self.state.write().await;
            if online {
                let was_offline = !state.is_online;
                state.is_online = true;
                state.just_reconnected = was_offline;
                if was_offline {
                    state.stable = false;
                    // Quality unknown until a probe lands; no signal while
                    // online classifies as fair.
                    state.quality = QualityObservation::from_sample(None, None, Utc::now());
                }
                was_offline
            } else {
                let was_online = state.is_online;
                state.is_online = false;
                state.just_reconnected = false;
                state.stable = false;
                state.quality = QualityObservation::offline(Utc::now());
                was_online
            }
        };

        if !transition {
            return;
        }

        if online {
            info!("Network reconnected, arming stability gate");
            self.arm_stability_timer().await;
        } else {
            info!("Network connection lost");
            self.disarm_stability_timer().await;
        }

        self.notify().await;
    }

    /// Records a quality observation from a probe.
    ///
    /// Ignored while offline; report connectivity first.
    pub async fn record_observation(&self, rtt_ms: Option<f64>, bandwidth_mbps: Option<f64>) {
        let level_changed = {
            let mut state = self.state.write().await;
            if !state.is_online {
                debug!("Dropping quality observation while offline");
                return;
            }

            let observation = QualityObservation::from_sample(rtt_ms, bandwidth_mbps, Utc::now());
            let changed = observation.level != state.quality.level;

            state.history.push_back(observation.clone());
            while state.history.len() > self.history_limit {
                state.history.pop_front();
            }
            state.last_quality_check = Some(observation.sampled_at);
            state.quality = observation;
            changed
        };

        if level_changed {
            self.notify().await;
        }
    }

    /// Returns the sync decision for the given number of pending items.
    ///
    /// `should_sync` is false whenever the link is offline or unstable,
    /// regardless of how much work is queued.
    pub async fn recommendation(&self, pending_count: u64) -> SyncRecommendation {
        let state = self.state.read().await;

        if !state.is_online {
            return SyncRecommendation::wait("No network connection available");
        }

        if !state.stable {
            return SyncRecommendation::wait("Connection is unstable, waiting for stability");
        }

        let cap = |limit: u64| pending_count.min(limit) as u32;

        match state.quality.level {
            QualityLevel::Excellent => SyncRecommendation {
                should_sync: true,
                urgency: SyncUrgency::Immediate,
                reason: "Excellent network conditions".into(),
                batch_size: cap(20),
                estimated_ms_per_item: 1500,
            },
            QualityLevel::Good => SyncRecommendation {
                should_sync: true,
                urgency: SyncUrgency::Immediate,
                reason: "Good network conditions".into(),
                batch_size: cap(15),
                estimated_ms_per_item: 2500,
            },
            QualityLevel::Fair => SyncRecommendation {
                should_sync: true,
                urgency: SyncUrgency::Delayed,
                reason: "Fair network conditions, using smaller batches".into(),
                batch_size: cap(10),
                estimated_ms_per_item: 4000,
            },
            QualityLevel::Poor => SyncRecommendation {
                should_sync: pending_count <= 5,
                urgency: SyncUrgency::Background,
                reason: "Poor network conditions, only sync critical transactions".into(),
                batch_size: cap(5),
                estimated_ms_per_item: 8000,
            },
            QualityLevel::Offline => {
                SyncRecommendation::wait("No network connection available")
            }
        }
    }

    /// Stops the stability timer. Call on shutdown.
    pub async fn shutdown(&self) {
        self.disarm_stability_timer().await;
    }

    async fn arm_stability_timer(&self) {
        let mut slot = self.stability_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }

        let state = self.state.clone();
        let events = self.events.clone();
        let threshold = self.stability_threshold;

        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(threshold).await;

            let snapshot = {
                let mut state = state.write().await;
                if !state.is_online {
                    return;
                }
                state.stable = true;
                state.snapshot()
            };

            info!("Connection held for the stability window, link is trusted");
            let _ = events.send(snapshot);
        }));
    }

    async fn disarm_stability_timer(&self) {
        let mut slot = self.stability_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    async fn notify(&self) {
        let snapshot = self.state.read().await.snapshot();
        let _ = self.events.send(snapshot);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> NetworkMonitor {
        NetworkMonitor::new(Duration::from_secs(10), 20)
    }

    #[tokio::test]
    async fn test_starts_offline() {
        let monitor = monitor();
        let status = monitor.status().await;
        assert!(!status.is_online);
        assert!(!status.stable_connection);
        assert_eq!(status.quality.level, QualityLevel::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_gate_elapses() {
        let monitor = monitor();
        monitor.set_connectivity(true).await;

        let status = monitor.status().await;
        assert!(status.is_online);
        assert!(status.just_reconnected);
        assert!(!status.stable_connection);

        // Paused-clock sleep auto-advances past the 10s gate
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(monitor.status().await.stable_connection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_before_gate_cancels_stability() {
        let monitor = monitor();
        monitor.set_connectivity(true).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        monitor.set_connectivity(false).await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        let status = monitor.status().await;
        assert!(!status.is_online);
        assert!(!status.stable_connection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_never_syncs_regardless_of_pending() {
        let monitor = monitor();

        for pending in [0, 1, 5, 500] {
            let rec = monitor.recommendation(pending).await;
            assert!(!rec.should_sync);
            assert_eq!(rec.urgency, SyncUrgency::Wait);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstable_connection_waits() {
        let monitor = monitor();
        monitor.set_connectivity(true).await;
        monitor.record_observation(Some(20.0), Some(10.0)).await;

        let rec = monitor.recommendation(3).await;
        assert!(!rec.should_sync);
        assert_eq!(rec.urgency, SyncUrgency::Wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recommendation_table() {
        let monitor = monitor();
        monitor.set_connectivity(true).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        // Excellent
        monitor.record_observation(Some(20.0), Some(10.0)).await;
        let rec = monitor.recommendation(100).await;
        assert!(rec.should_sync);
        assert_eq!(rec.urgency, SyncUrgency::Immediate);
        assert_eq!(rec.batch_size, 20);
        assert_eq!(rec.estimated_ms_per_item, 1500);

        // Good
        monitor.record_observation(Some(80.0), Some(3.0)).await;
        let rec = monitor.recommendation(100).await;
        assert_eq!(rec.urgency, SyncUrgency::Immediate);
        assert_eq!(rec.batch_size, 15);

        // Fair
        monitor.record_observation(Some(150.0), Some(1.5)).await;
        let rec = monitor.recommendation(100).await;
        assert!(rec.should_sync);
        assert_eq!(rec.urgency, SyncUrgency::Delayed);
        assert_eq!(rec.batch_size, 10);

        // Poor: background, restricted to small queues
        monitor.record_observation(Some(400.0), Some(0.3)).await;
        let rec = monitor.recommendation(100).await;
        assert!(!rec.should_sync);
        assert_eq!(rec.urgency, SyncUrgency::Background);

        let rec = monitor.recommendation(5).await;
        assert!(rec.should_sync);
        assert_eq!(rec.batch_size, 5);
        assert_eq!(rec.estimated_ms_per_item, 8000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_capped_by_pending() {
        let monitor = monitor();
        monitor.set_connectivity(true).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        monitor.record_observation(Some(20.0), Some(10.0)).await;

        let rec = monitor.recommendation(3).await;
        assert_eq!(rec.batch_size, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let monitor = NetworkMonitor::new(Duration::from_secs(1), 3);
        monitor.set_connectivity(true).await;

        for i in 0..10 {
            monitor.record_observation(Some(20.0 + i as f64), None).await;
        }

        assert_eq!(monitor.history().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_notified_on_transitions() {
        let monitor = monitor();
        let mut events = monitor.subscribe();

        monitor.set_connectivity(true).await;
        let status = events.recv().await.unwrap();
        assert!(status.is_online);
        assert!(status.just_reconnected);

        // Stability achievement is a notified transition too
        tokio::time::sleep(Duration::from_secs(11)).await;
        let status = events.recv().await.unwrap();
        assert!(status.stable_connection);

        monitor.set_connectivity(false).await;
        let status = events.recv().await.unwrap();
        assert!(!status.is_online);
    }
}
