//! Manages the lifecycle of the background tasks spawned by the application.
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type NamedHandles = Vec<(&'static str, JoinHandle<()>)>;

/// A centralized manager for spawned tasks.
///
/// This struct is responsible for:
/// - Spawning tasks and keeping track of their `JoinHandle`s.
/// - Providing a graceful shutdown mechanism by awaiting all tasks.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<NamedHandles>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    /// Creates a new `TaskManager` bound to the application's shutdown channel.
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
        }
    }

    fn handles(&self) -> MutexGuard<'_, NamedHandles> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns a new task and adds its handle to the manager.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles().push((name, handle));
    }

    /// Returns a clone of the shutdown receiver.
    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Number of tasks currently tracked.
    pub fn task_count(&self) -> usize {
        self.handles().len()
    }

    /// Waits for all managed tasks to complete.
    ///
    /// Tasks are expected to watch the shutdown channel and return once it
    /// flips to `true`.
    pub async fn shutdown(self) {
        let handles = self.handles().drain(..).collect::<Vec<_>>();
        info!(
            "TaskManager shutting down. Waiting for {} tasks to complete...",
            handles.len()
        );

        let task_names: Vec<&'static str> = handles.iter().map(|(name, _)| *name).collect();
        debug!(tasks = ?task_names, "Awaiting all tasks.");

        let results = join_all(handles.into_iter().map(|(_, handle)| handle)).await;

        let mut panicked = Vec::new();
        for (task_name, result) in task_names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name, "Task shut down gracefully."),
                Err(e) => {
                    error!(task_name, error = %e, "Task panicked during shutdown.");
                    panicked.push(task_name);
                }
            }
        }

        if panicked.is_empty() {
            info!("All tasks shut down gracefully.");
        } else {
            error!(tasks = ?panicked, "{} tasks panicked during shutdown", panicked.len());
        }
    }

    /// Cancels every managed task without waiting for the shutdown signal.
    ///
    /// Used when startup fails after some tasks were already spawned.
    pub async fn abort(self) {
        let handles = self.handles().drain(..).collect::<Vec<_>>();
        warn!("TaskManager aborting {} tasks", handles.len());
        for (_, handle) in &handles {
            handle.abort();
        }
        join_all(handles.into_iter().map(|(_, handle)| handle)).await;
    }
}

/// Resolves once the shutdown channel carries `true` or its sender is gone.
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
