//! Runner contract: the code that executes one task type.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::task::Task;

/// Executes tasks of a single type.
///
/// A runner mutates the task in memory (data, error, reschedule) and never
/// persists it; the queue writes the result back once `run` returns.
#[async_trait]
pub trait Runner: Send + Sync {
    /// The task type this runner handles. Must not be empty.
    fn runner_type(&self) -> &str;

    /// Typical wall-clock duration of one run. The defaults below derive from it.
    fn expected_duration(&self) -> Duration;

    /// Time after which a Running task is presumed orphaned.
    fn deadline(&self) -> DateTime<Utc> {
        let budget = self.expected_duration().saturating_mul(5);
        chrono::Duration::from_std(budget)
            .ok()
            .and_then(|budget| Utc::now().checked_add_signed(budget))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// How long one run may take before its context is cancelled.
    fn timeout(&self) -> Duration {
        self.expected_duration().saturating_mul(3)
    }

    /// Runs longer than this are logged as slow.
    fn duration_maximum(&self) -> Duration {
        self.expected_duration()
    }

    /// Execute the task. An `Err` is recorded on the task as a failure.
    async fn run(&self, ctx: RunContext, task: &mut Task) -> anyhow::Result<()>;
}

/// Per-run context handed to [`Runner::run`].
///
/// Cancelled when the run times out or the queue shuts down.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    timeout_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(token: CancellationToken, timeout_at: DateTime<Utc>) -> Self {
        Self { token, timeout_at }
    }

    /// Resolves once the run should stop.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// When the timeout fires.
    pub fn timeout_at(&self) -> DateTime<Utc> {
        self.timeout_at
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
