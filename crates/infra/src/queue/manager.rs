//! Dispatch loop: scans for claimable tasks and persists results.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cadence_core::{RepositoryError, Task, TaskRepository, TaskState, jitter};

use super::worker::Registry;

/// How a dispatch scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// The cursor ran dry.
    Exhausted,
    /// Every worker is busy.
    Saturated,
    /// The repository failed; retried on the next tick.
    Failed,
    /// Workers are shutting down; nothing was dispatched.
    Stopping,
}

/// Owns the available-worker count and decides what runs next.
pub(super) struct Manager {
    pub(super) queue: String,
    pub(super) repository: Arc<dyn TaskRepository>,
    pub(super) runners: Registry,
    pub(super) workers: usize,
    pub(super) poll_delay: Duration,
    pub(super) unstick_interval: Duration,
    pub(super) dispatch_tx: mpsc::Sender<Task>,
    pub(super) completion_rx: mpsc::Receiver<Task>,
    /// Cancelled when workers are told to stop; no dispatch after that.
    pub(super) workers_stopping: CancellationToken,
    pub(super) shutdown: CancellationToken,
}

impl Manager {
    pub(super) async fn run(mut self) {
        info!(queue = %self.queue, workers = self.workers, "manager started");

        let mut available = self.workers;
        let mut next_unstick = Instant::now() + jitter::up_to(self.poll_delay);
        let poll = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(poll);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.drain(&mut available).await;
                    break;
                }
                completed = self.completion_rx.recv() => match completed {
                    Some(task) => {
                        self.complete(task, &mut available).await;
                        if matches!(self.scan(&mut available).await, Scan::Exhausted | Scan::Failed) {
                            poll.as_mut().reset(Instant::now() + self.poll_delay);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next_unstick) => {
                    self.unstick().await;
                    next_unstick = Instant::now()
                        + jitter::jittered(self.unstick_interval, jitter::DEFAULT_JITTER_FRACTION);
                }
                _ = &mut poll => {
                    self.scan(&mut available).await;
                    poll.as_mut().reset(Instant::now() + self.poll_delay);
                }
            }
        }

        info!(queue = %self.queue, "manager stopped");
    }

    /// Persist results still in flight once workers have exited.
    async fn drain(&mut self, available: &mut usize) {
        while let Some(task) = self.completion_rx.recv().await {
            self.complete(task, available).await;
        }
    }

    async fn complete(&mut self, task: Task, available: &mut usize) {
        *available = (*available + 1).min(self.workers);

        match self.repository.update_from_state(&task, TaskState::Running).await {
            Ok(stored) => debug!(
                queue = %self.queue,
                task_id = %stored.id,
                state = %stored.state,
                duration_s = stored.duration.unwrap_or_default(),
                "task finished"
            ),
            Err(err) if err.is_already_claimed() => warn!(
                queue = %self.queue,
                task_id = %task.id,
                error = %err,
                "task changed while running, result discarded"
            ),
            // Left Running; the deadline brings it back through unstick.
            Err(err) => error!(
                queue = %self.queue,
                task_id = %task.id,
                error = %err,
                "failed to persist task result"
            ),
        }
    }

    async fn unstick(&self) {
        match self.repository.unstick_tasks().await {
            Ok(0) => {}
            Ok(recovered) => info!(queue = %self.queue, recovered, "recovered stuck tasks"),
            Err(err) => error!(queue = %self.queue, error = %err, "unstick failed"),
        }
    }

    /// Claim and dispatch claimable tasks while workers are idle.
    async fn scan(&mut self, available: &mut usize) -> Scan {
        if *available == 0 {
            return Scan::Saturated;
        }
        if self.workers_stopping.is_cancelled() {
            return Scan::Stopping;
        }

        let mut cursor = match self.repository.iterate_pending().await {
            Ok(cursor) => cursor,
            Err(err) => {
                error!(queue = %self.queue, error = %err, "failed to open pending cursor");
                return Scan::Failed;
            }
        };

        let outcome = loop {
            if self.workers_stopping.is_cancelled() {
                break Scan::Stopping;
            }
            if *available == 0 {
                break Scan::Saturated;
            }
            match cursor.next().await {
                Ok(Some(task)) => {
                    if let Err(err) = self.dispatch_task(task, available).await {
                        error!(queue = %self.queue, error = %err, "dispatch failed");
                        break Scan::Failed;
                    }
                }
                Ok(None) => break Scan::Exhausted,
                Err(err) => {
                    error!(queue = %self.queue, error = %err, "failed to read pending cursor");
                    break Scan::Failed;
                }
            }
        };

        if let Err(err) = cursor.close().await {
            warn!(queue = %self.queue, error = %err, "failed to close pending cursor");
        }
        outcome
    }

    /// Claim one task and hand it to a worker. A lost claim race is not an error.
    async fn dispatch_task(&mut self, mut task: Task, available: &mut usize) -> Result<(), RepositoryError> {
        let now = Utc::now();
        if task.available_time.is_some_and(|at| at > now) {
            warn!(queue = %self.queue, task_id = %task.id, "cursor returned a task that is not yet available");
            return Ok(());
        }

        let deadline = self
            .runners
            .get(&task.task_type)
            .map(|runner| runner.deadline())
            .unwrap_or(now);
        task.claim(now, deadline);

        let claimed = match self.repository.update_from_state(&task, TaskState::Pending).await {
            Ok(claimed) => claimed,
            Err(err) if err.is_already_claimed() => {
                warn!(queue = %self.queue, task_id = %task.id, "task already claimed elsewhere");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        debug!(queue = %self.queue, task_id = %claimed.id, task_type = %claimed.task_type, "dispatching task");
        *available -= 1;
        if let Err(mpsc::error::SendError(task)) = self.dispatch_tx.send(claimed).await {
            *available += 1;
            release(&self.queue, self.repository.as_ref(), task).await;
        }
        Ok(())
    }
}

/// Return a claimed task that never reached a worker to Pending.
pub(super) async fn release(queue: &str, repository: &dyn TaskRepository, mut task: Task) {
    let now = Utc::now();
    task.state = TaskState::Pending;
    task.available_time = Some(now);
    task.deadline_time = None;
    task.updated_at = now;

    match repository.update_from_state(&task, TaskState::Running).await {
        Ok(_) => debug!(queue, task_id = %task.id, "released undelivered task"),
        Err(err) => warn!(
            queue,
            task_id = %task.id,
            error = %err,
            "failed to release undelivered task, it will be unstuck after its deadline"
        ),
    }
}
