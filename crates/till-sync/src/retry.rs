//! # Keyed Retry Registry
//!
//! Deferred one-shot tasks keyed by transaction (or conflict) id, so a
//! manual force-retry or a resolved conflict can cancel a stale pending
//! retry instead of racing with it.
//!
//! ## Why Keyed?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  txn-42 fails  ──► schedule("txn-42", 2s, retry)                       │
//! │                                                                         │
//! │  cashier hits "retry now" ──► cancel("txn-42") + immediate attempt     │
//! │                                                                         │
//! │  Without the key, the 2s timer would still fire and race the manual    │
//! │  attempt. With it, exactly one retry path is live per transaction.     │
//! │                                                                         │
//! │  Scheduling the same key again REPLACES the pending timer.             │
//! │  Tasks deregister themselves after running.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delay ladders come from [`retry_delay`]: exponential backoff, factor 2,
//! capped at the configured maximum.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

// =============================================================================
// Backoff Ladder
// =============================================================================

/// Delay before retry number `attempt` (1-based), on an exponential
/// ladder: initial, 2×initial, 4×initial, ... capped at `max`.
pub fn retry_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let mut backoff = ExponentialBackoff {
        initial_interval: initial,
        max_interval: max,
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut delay = initial;
    for _ in 0..attempt.max(1) {
        if let Some(next) = backoff.next_backoff() {
            delay = next;
        }
    }
    delay.min(max)
}

// =============================================================================
// Retry Registry
// =============================================================================

/// Registry of keyed, cancellable deferred tasks.
#[derive(Clone)]
pub struct RetryRegistry {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RetryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        RetryRegistry {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedules `fut` to run after `delay`, keyed by `key`.
    ///
    /// Any pending task under the same key is cancelled first, so at most
    /// one deferred action exists per key.
    pub async fn schedule<F>(&self, key: &str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;

        if let Some(stale) = tasks.remove(key) {
            debug!(key, "Replacing stale deferred task");
            stale.abort();
        }

        let registry = self.tasks.clone();
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Deregister before running: once the timer fires the task is
            // no longer pending, and the action may schedule the same key
            // again without aborting itself.
            registry.lock().await.remove(&owned_key);
            fut.await;
        });

        debug!(key, ?delay, "Scheduled deferred task");
        tasks.insert(key.to_string(), handle);
    }

    /// Cancels the deferred task for `key`. Returns true if one was
    /// pending.
    pub async fn cancel(&self, key: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.remove(key) {
            Some(handle) => {
                handle.abort();
                debug!(key, "Cancelled deferred task");
                true
            }
            None => false,
        }
    }

    /// Returns true if a deferred task is pending for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.tasks.lock().await.contains_key(key)
    }

    /// Number of pending deferred tasks.
    pub async fn pending_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancels everything. Call on shutdown.
    pub async fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Default for RetryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
