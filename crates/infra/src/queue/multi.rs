//! Type-partitioned queues.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use cadence_core::{Runner, TaskRepository};

use super::{Queue, QueueConfig, QueueError};

/// One [`Queue`] per task type, each over a type-filtered view of the same
/// repository, so a slow type never starves another.
///
/// Every partition uses the shared config (worker count, poll delay); its
/// name is the task type.
pub struct MultiQueue {
    repository: Arc<dyn TaskRepository>,
    config: QueueConfig,
    queues: BTreeMap<String, Queue>,
    started: bool,
}

impl fmt::Debug for MultiQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiQueue")
            .field("config", &self.config)
            .field("queues", &self.queues)
            .field("started", &self.started)
            .finish()
    }
}

impl MultiQueue {
    pub fn new(repository: Arc<dyn TaskRepository>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            repository,
            config,
            queues: BTreeMap::new(),
            started: false,
        })
    }

    /// Register a runner on the partition for its type, creating the
    /// partition on first use.
    pub fn register_runner(&mut self, runner: Arc<dyn Runner>) -> Result<(), QueueError> {
        let task_type = runner.runner_type().to_string();
        if task_type.trim().is_empty() {
            return Err(QueueError::InvalidRunner(
                "runner type must not be empty".to_string(),
            ));
        }
        if self.started {
            return Err(QueueError::AlreadyStarted(task_type));
        }

        if !self.queues.contains_key(&task_type) {
            let queue = Queue::new(
                self.repository.with_type_filter(&task_type),
                self.config.clone().with_name(task_type.clone()),
            )?;
            self.queues.insert(task_type.clone(), queue);
        }
        match self.queues.get_mut(&task_type) {
            Some(queue) => queue.register_runner(runner),
            None => Err(QueueError::InvalidRunner(task_type)),
        }
    }

    /// Start every partition, or none of them.
    pub fn start(&mut self) -> Result<(), QueueError> {
        if self.started {
            return Ok(());
        }
        if Handle::try_current().is_err() {
            return Err(QueueError::NoRuntime(self.task_types().collect::<Vec<_>>().join(",")));
        }

        let mut failure = None;
        for queue in self.queues.values_mut() {
            if let Err(err) = queue.start() {
                failure = Some(err);
                break;
            }
        }
        if let Some(err) = failure {
            for queue in self.queues.values_mut() {
                queue.abort();
            }
            return Err(err);
        }

        self.started = true;
        info!(partitions = self.queues.len(), "multi-queue started");
        Ok(())
    }

    /// Stop every partition, one after another.
    pub async fn stop(&mut self) {
        for queue in self.queues.values_mut() {
            queue.stop().await;
        }
        self.started = false;
    }

    pub fn queue(&self, task_type: &str) -> Option<&Queue> {
        self.queues.get(task_type)
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }
}
