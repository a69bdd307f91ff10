//! Worker tasks that execute claimed tasks with their runners.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cadence_core::{RunContext, Runner, Task};

/// Runner registry, frozen when the queue starts.
pub(super) type Registry = Arc<HashMap<String, Arc<dyn Runner>>>;

/// Receiving end of the dispatch channel, shared by every worker.
pub(super) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Task>>>;

/// One worker task: takes dispatched tasks, runs them, reports back.
pub(super) struct Worker {
    pub(super) id: usize,
    pub(super) queue: String,
    pub(super) runners: Registry,
    pub(super) dispatch_rx: SharedReceiver,
    pub(super) completion_tx: mpsc::Sender<Task>,
    pub(super) shutdown: CancellationToken,
}

impl Worker {
    pub(super) async fn run(self) {
        debug!(queue = %self.queue, worker = self.id, "worker started");

        loop {
            let task = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                task = async { self.dispatch_rx.lock().await.recv().await } => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let task = run_task(&self.queue, self.id, &self.runners, task, &self.shutdown).await;
            if self.completion_tx.send(task).await.is_err() {
                warn!(queue = %self.queue, worker = self.id, "completion channel closed, result dropped");
                break;
            }
        }

        debug!(queue = %self.queue, worker = self.id, "worker stopped");
    }
}

/// Run one claimed task to completion and settle its state.
///
/// Never fails: every fault (missing runner, runner error, panic, timeout)
/// ends up recorded on the returned task.
pub(super) async fn run_task(
    queue: &str,
    worker: usize,
    runners: &Registry,
    mut task: Task,
    shutdown: &CancellationToken,
) -> Task {
    let Some(runner) = runners.get(&task.task_type).cloned() else {
        warn!(queue, worker, task_id = %task.id, task_type = %task.task_type, "no runner registered");
        task.mark_failed(format!("no runner registered for task type {:?}", task.task_type));
        return task;
    };

    let task_id = task.id;
    let timeout = runner.timeout();
    let token = shutdown.child_token();
    let ctx = RunContext::new(token.clone(), instant_after(timeout));
    let fallback = task.clone();
    let started = Instant::now();

    debug!(queue, worker, task_id = %task_id, task_type = %task.task_type, "running task");

    let run = {
        let runner = Arc::clone(&runner);
        async move {
            let result = runner.run(ctx, &mut task).await;
            (task, result)
        }
    };
    let mut handle = tokio::spawn(run);

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::time::sleep(timeout) => {
            warn!(queue, worker, task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "task timed out, cancelling");
            token.cancel();
            handle.await
        }
    };

    let mut task = match joined {
        Ok((task, Ok(()))) => task,
        Ok((mut task, Err(err))) => {
            debug!(queue, worker, task_id = %task_id, error = %format!("{err:#}"), "runner returned an error");
            task.append_error(format!("{err:#}"));
            task
        }
        Err(err) => {
            let reason = join_failure(err);
            warn!(queue, worker, task_id = %task_id, reason = %reason, "runner aborted");
            let mut task = fallback;
            task.append_error(reason);
            task
        }
    };

    let elapsed = started.elapsed();
    task.duration = Some(elapsed.as_secs_f64());
    if elapsed > runner.duration_maximum() {
        warn!(
            queue,
            worker,
            task_id = %task_id,
            elapsed_ms = elapsed.as_millis() as u64,
            maximum_ms = runner.duration_maximum().as_millis() as u64,
            "task ran longer than its maximum duration"
        );
    }

    task.resolve_outcome();
    task
}

fn instant_after(timeout: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn join_failure(err: JoinError) -> String {
    if err.is_cancelled() {
        return "runner was cancelled before it returned".to_string();
    }
    format!("runner panicked: {}", panic_message(err.into_panic()))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
