//! Named background task orchestration.
//!
//! `BackgroundTaskRegistry` owns the router's long-lived tasks: the
//! registry health monitor, eager provisioning and the listeners of embedded
//! Dispatchers. It gives them:
//! - unique names (respawning a name aborts the previous instance)
//! - a broadcast shutdown signal raced against each task
//! - per-task stop, used when a single group is torn down
//! - a timed `shutdown_all` that aborts stragglers
//!
//! The registry is internally synchronized and meant to be shared behind an
//! `Arc`.
//!
//! # Example
//!
//! ```rust,no_run
//! use assetstream::background_tasks::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let tasks = BackgroundTaskRegistry::new();
//!
//!     tasks.spawn_periodic("health-monitor", Duration::from_secs(10), |_tick| async {
//!         // revalidate endpoints
//!     });
//!
//!     tasks.shutdown_all().await;
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Registry of named background tasks with unified shutdown.
pub struct BackgroundTaskRegistry {
    tasks: DashMap<String, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: DashMap::new(),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Spawn a named task.
    ///
    /// The task is raced against the registry's shutdown signal. A task that
    /// already runs under `name` is aborted first.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.is_shutting_down() {
            tracing::warn!(task = %name, "Ignoring spawn during shutdown");
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = %task_name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = %task_name, "Task received shutdown signal");
                }
            }
        });

        tracing::info!(task = %name, "Spawned background task");

        if let Some(old) = self.tasks.insert(name.clone(), handle) {
            old.abort();
            tracing::debug!(task = %name, "Aborted previous task instance");
        }
    }

    /// Spawn a task that runs `task` every `interval`.
    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, interval: Duration, mut task: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut tick = 0u64;
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                task(tick).await;
                tick = tick.wrapping_add(1);
            }
        });
    }

    /// Abort a single task. Returns false if no task runs under `name`.
    pub fn stop(&self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some((_, handle)) => {
                handle.abort();
                tracing::info!(task = name, "Stopped background task");
                true
            }
            None => false,
        }
    }

    /// Whether a task is registered and still running under `name`.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Signal every task and wait up to five seconds for them to exit.
    pub async fn shutdown_all(&self) {
        self.shutdown_all_with_timeout(Duration::from_secs(5)).await;
    }

    /// Signal every task and wait up to `timeout`; stragglers are aborted.
    pub async fn shutdown_all_with_timeout(&self, timeout: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(task_count = self.tasks.len(), "Initiating background task shutdown");
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();

        for name in names {
            let Some((_, handle)) = self.tasks.remove(&name) else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = handle.abort_handle();

            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "Task shutdown complete"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "Task panicked"),
                Err(_) => {
                    tracing::warn!(task = %name, "Task did not respond to shutdown, aborting");
                    abort.abort();
                }
            }
        }

        tracing::info!("All background tasks shutdown complete");
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
            for entry in self.tasks.iter() {
                entry.value().abort();
            }
        }
    }
}
