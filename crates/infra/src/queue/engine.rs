//! Queue lifecycle: spawning and stopping the manager and workers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cadence_core::{Runner, TaskRepository};

use super::config::QueueConfig;
use super::manager::{Manager, release};
use super::worker::{Registry, SharedReceiver, Worker};
use super::QueueError;

/// Handles of a started queue.
struct Running {
    workers_token: CancellationToken,
    manager_token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    manager: JoinHandle<()>,
    dispatch_rx: SharedReceiver,
}

/// A task queue: one manager plus a fixed pool of workers over a repository.
///
/// Register runners, then [`start`](Queue::start). [`stop`](Queue::stop)
/// waits for in-flight tasks and persists their results.
pub struct Queue {
    config: QueueConfig,
    repository: Arc<dyn TaskRepository>,
    runners: HashMap<String, Arc<dyn Runner>>,
    running: Option<Running>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .field("runner_types", &self.runner_types())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Queue {
    pub fn new(repository: Arc<dyn TaskRepository>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            config,
            repository,
            runners: HashMap::new(),
            running: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repository
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Registered task types, sorted.
    pub fn runner_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Register the runner for its task type. A later registration for the
    /// same type replaces the earlier one.
    pub fn register_runner(&mut self, runner: Arc<dyn Runner>) -> Result<(), QueueError> {
        let task_type = runner.runner_type().to_string();
        if task_type.trim().is_empty() {
            return Err(QueueError::InvalidRunner(
                "runner type must not be empty".to_string(),
            ));
        }
        if self.is_running() {
            return Err(QueueError::AlreadyStarted(self.config.name.clone()));
        }

        self.runners.insert(task_type, runner);
        Ok(())
    }

    /// Spawn the workers and the manager on the current Tokio runtime.
    ///
    /// Calling `start` on a started queue does nothing.
    pub fn start(&mut self) -> Result<(), QueueError> {
        if self.is_running() {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime(self.config.name.clone()))?;

        let workers = self.config.workers;
        let runners: Registry = Arc::new(self.runners.clone());
        // Capacity never binds: at most `workers` tasks are claimed and unfinished.
        let (dispatch_tx, dispatch_rx) = mpsc::channel(workers);
        let (completion_tx, completion_rx) = mpsc::channel(workers);
        let dispatch_rx: SharedReceiver = Arc::new(Mutex::new(dispatch_rx));

        let workers_token = CancellationToken::new();
        let manager_token = CancellationToken::new();

        let worker_handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.config.name.clone(),
                    runners: Arc::clone(&runners),
                    dispatch_rx: Arc::clone(&dispatch_rx),
                    completion_tx: completion_tx.clone(),
                    shutdown: workers_token.clone(),
                };
                runtime.spawn(worker.run())
            })
            .collect();
        // Only workers hold completion senders, so the manager sees the
        // channel close once they have all exited.
        drop(completion_tx);

        let manager = Manager {
            queue: self.config.name.clone(),
            repository: Arc::clone(&self.repository),
            runners,
            workers,
            poll_delay: self.config.poll_delay,
            unstick_interval: self.config.unstick_interval(),
            dispatch_tx,
            completion_rx,
            workers_stopping: workers_token.clone(),
            shutdown: manager_token.clone(),
        };
        let manager = runtime.spawn(manager.run());

        info!(
            queue = %self.config.name,
            workers,
            poll_delay_ms = self.config.poll_delay.as_millis() as u64,
            runner_types = ?self.runner_types(),
            "queue started"
        );

        self.running = Some(Running {
            workers_token,
            manager_token,
            workers: worker_handles,
            manager,
            dispatch_rx,
        });
        Ok(())
    }

    /// Stop the queue and wait for in-flight tasks.
    ///
    /// Workers are cancelled first (their run contexts see the cancellation)
    /// and joined; the manager then persists every outstanding result before
    /// it exits. Tasks claimed but never picked up by a worker are returned
    /// to Pending. Calling `stop` on a stopped queue does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let queue = self.config.name.as_str();
        info!(queue, "stopping queue");

        running.workers_token.cancel();
        for handle in running.workers {
            if let Err(err) = handle.await {
                error!(queue, error = %err, "worker task failed");
            }
        }

        running.manager_token.cancel();
        if let Err(err) = running.manager.await {
            error!(queue, error = %err, "manager task failed");
        }

        let mut rx = running.dispatch_rx.lock().await;
        rx.close();
        while let Ok(task) = rx.try_recv() {
            release(queue, self.repository.as_ref(), task).await;
        }

        info!(queue, "queue stopped");
    }

    /// Cancel a started queue without waiting for it.
    ///
    /// In-flight results are not persisted; those tasks stay Running until
    /// unstick recovers them after their deadline.
    pub(crate) fn abort(&mut self) {
        if let Some(running) = self.running.take() {
            warn!(queue = %self.config.name, "aborting queue");
            running.workers_token.cancel();
            running.manager_token.cancel();
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.abort();
    }
}
