//! Storage contract for tasks.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{RepositoryError, RepositoryResult};
use crate::id::TaskId;
use crate::query::{Pagination, TaskFilter, TaskPage};
use crate::task::{CreateTask, Task, TaskState, UpdateTask};

/// Persistent task store shared by every queue instance.
///
/// The only cross-process coordination primitive is
/// [`update_from_state`](TaskRepository::update_from_state): a
/// compare-and-swap on the stored state. Dropping any returned future
/// abandons the call.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// List tasks matching `filter`, one page at a time.
    async fn list_tasks(&self, filter: TaskFilter, pagination: Pagination) -> RepositoryResult<TaskPage>;

    /// Persist a new Pending task. Fails with `DuplicateName` if the name is taken.
    async fn create_task(&self, create: CreateTask) -> RepositoryResult<Task>;

    async fn get_task(&self, id: TaskId) -> RepositoryResult<Option<Task>>;

    /// Operator update. Returns `None` when the task does not exist.
    async fn update_task(&self, id: TaskId, update: UpdateTask) -> RepositoryResult<Option<Task>>;

    async fn delete_task(&self, id: TaskId) -> RepositoryResult<()>;

    /// Open a lazy cursor over claimable tasks: Pending, available, not
    /// expired, ordered by priority (highest first) then insertion order.
    async fn iterate_pending(&self) -> RepositoryResult<Box<dyn PendingCursor>>;

    /// Write `task` if and only if the stored state still equals `expected`.
    ///
    /// Fails with [`RepositoryError::AlreadyClaimed`] when another writer got
    /// there first.
    async fn update_from_state(&self, task: &Task, expected: TaskState) -> RepositoryResult<Task>;

    /// Return Running tasks whose deadline has passed to Pending, available
    /// now. Returns how many were recovered.
    async fn unstick_tasks(&self) -> RepositoryResult<u64>;

    /// A view of the same store restricted to `task_type`.
    fn with_type_filter(&self, task_type: &str) -> Arc<dyn TaskRepository>;
}

/// Forward-only cursor over claimable tasks.
#[async_trait]
pub trait PendingCursor: Send {
    /// Next claimable task, or `None` when exhausted.
    async fn next(&mut self) -> RepositoryResult<Option<Task>>;

    /// Release the cursor. Safe to call before exhaustion.
    async fn close(self: Box<Self>) -> RepositoryResult<()>;
}

/// Create a named task unless one with that name already exists.
///
/// Used by singleton recurring jobs that every instance seeds at boot.
pub async fn ensure_task(repository: &dyn TaskRepository, create: CreateTask) -> RepositoryResult<Task> {
    let Some(name) = create.name.clone() else {
        return Err(RepositoryError::validation("ensure_task requires a task name"));
    };

    match repository.create_task(create).await {
        Ok(task) => Ok(task),
        Err(RepositoryError::DuplicateName(_)) => {
            let page = repository
                .list_tasks(
                    TaskFilter {
                        name: Some(name.clone()),
                        ..Default::default()
                    },
                    Pagination::new(Some(1), None),
                )
                .await?;
            page.tasks
                .into_iter()
                .next()
                .ok_or(RepositoryError::DuplicateName(name))
        }
        Err(e) => Err(e),
    }
}
