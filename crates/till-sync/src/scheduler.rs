//! # Cooperative Scheduler
//!
//! Owns every recurring task in the engine as a named, cancellable unit,
//! so shutdown is deterministic and a task cannot outlive the service
//! that owns it.
//!
//! ## Owned Tasks
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Scheduler Task Registry                            │
//! │                                                                         │
//! │  "background-sync"  every 60s   trigger a background cycle when        │
//! │                                 work is queued and the lock is free    │
//! │  "quality-check"    every 30s   probe the remote, feed the monitor     │
//! │  "status-refresh"   every 30s   broadcast the aggregate snapshot       │
//! │  "cleanup"          every 24h   retention sweeps (queue + conflicts)   │
//! │                                                                         │
//! │  Each task body absorbs its own errors: a failing tick is logged       │
//! │  and the task stays scheduled.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Boxed future produced by a recurring task body on each tick.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

// =============================================================================
// Scheduler
// =============================================================================

/// Registry of named recurring tasks.
pub struct Scheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Scheduler {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns a named recurring task.
    ///
    /// The body runs once immediately and then on every interval tick.
    /// Re-using a name replaces (cancels) the previous task.
    ///
    /// ## Usage
    /// ```rust,ignore
    /// scheduler.spawn_recurring("cleanup", Duration::from_secs(86_400), move || {
    ///     let queue = queue.clone();
    ///     Box::pin(async move {
    ///         if let Err(e) = queue.cleanup().await {
    ///             warn!(?e, "Cleanup sweep failed");
    ///         }
    ///     })
    /// }).await;
    /// ```
    pub async fn spawn_recurring<F>(&self, name: &str, interval: Duration, task_fn: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let mut tasks = self.tasks.lock().await;

        if let Some(previous) = tasks.remove(name) {
            debug!(task = name, "Replacing existing scheduled task");
            previous.abort();
        }

        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                // The body is responsible for absorbing its own errors;
                // nothing a tick does can unschedule the task.
                task_fn().await;
            }
        });

        debug!(task = %task_name, ?interval, "Scheduled recurring task");
        tasks.insert(task_name, handle);
    }

    /// Cancels one named task. Returns true if it existed.
    pub async fn cancel(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.remove(name) {
            Some(handle) => {
                handle.abort();
                debug!(task = name, "Cancelled scheduled task");
                true
            }
            None => false,
        }
    }

    /// Cancels every task. Call on shutdown.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        let count = tasks.len();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        if count > 0 {
            info!(count, "Scheduler stopped all recurring tasks");
        }
    }

    /// Names of currently scheduled tasks.
    pub async fn task_names(&self) -> Vec<String> {
        let tasks = self.tasks.lock().await;
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Best-effort abort for tasks that survived to drop; the normal
        // path is an explicit shutdown().
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
