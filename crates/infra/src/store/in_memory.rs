use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use cadence_core::{
    CreateTask, Pagination, PendingCursor, RepositoryError, RepositoryResult, Task, TaskFilter,
    TaskId, TaskPage, TaskRepository, TaskState, UpdateTask,
};

#[derive(Debug, Clone)]
struct Entry {
    /// Insertion sequence; breaks priority ties in creation order.
    seq: u64,
    task: Task,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: RwLock<HashMap<TaskId, Entry>>,
    next_seq: AtomicU64,
}

impl Inner {
    fn read(&self) -> RepositoryResult<RwLockReadGuard<'_, HashMap<TaskId, Entry>>> {
        self.tasks
            .read()
            .map_err(|_| RepositoryError::storage("lock poisoned"))
    }

    fn write(&self) -> RepositoryResult<RwLockWriteGuard<'_, HashMap<TaskId, Entry>>> {
        self.tasks
            .write()
            .map_err(|_| RepositoryError::storage("lock poisoned"))
    }
}

fn name_taken(tasks: &HashMap<TaskId, Entry>, name: &str, except: Option<TaskId>) -> bool {
    tasks
        .values()
        .any(|e| Some(e.task.id) != except && e.task.name.as_deref() == Some(name))
}

/// In-memory task repository.
///
/// Intended for tests, benches and single-process deployments. Views created
/// with [`with_type_filter`](TaskRepository::with_type_filter) share the same
/// underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRepository {
    inner: Arc<Inner>,
    type_filter: Option<String>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn in_view(&self, task: &Task) -> bool {
        self.type_filter
            .as_ref()
            .is_none_or(|t| *t == task.task_type)
    }

    /// Number of stored tasks visible through this view.
    pub fn len(&self) -> RepositoryResult<usize> {
        let tasks = self.inner.read()?;
        Ok(tasks.values().filter(|e| self.in_view(&e.task)).count())
    }

    pub fn is_empty(&self) -> RepositoryResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn list_tasks(&self, filter: TaskFilter, pagination: Pagination) -> RepositoryResult<TaskPage> {
        let tasks = self.inner.read()?;
        let mut matching: Vec<&Entry> = tasks
            .values()
            .filter(|e| self.in_view(&e.task) && filter.matches(&e.task))
            .collect();
        matching.sort_by_key(|e| e.seq);

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .map(|e| e.task.clone())
            .collect();
        Ok(TaskPage::new(page, total, pagination))
    }

    async fn create_task(&self, create: CreateTask) -> RepositoryResult<Task> {
        if create.task_type.trim().is_empty() {
            return Err(RepositoryError::validation("task_type must not be empty"));
        }

        let mut tasks = self.inner.write()?;
        if let Some(name) = create.name.as_deref() {
            if name_taken(&tasks, name, None) {
                return Err(RepositoryError::DuplicateName(name.to_string()));
            }
        }

        let task = Task::from_create(create);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        tasks.insert(task.id, Entry { seq, task: task.clone() });
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> RepositoryResult<Option<Task>> {
        let tasks = self.inner.read()?;
        Ok(tasks.get(&id).map(|e| e.task.clone()))
    }

    async fn update_task(&self, id: TaskId, update: UpdateTask) -> RepositoryResult<Option<Task>> {
        let mut tasks = self.inner.write()?;
        if let Some(Some(name)) = update.name.as_ref() {
            if name_taken(&tasks, name, Some(id)) {
                return Err(RepositoryError::DuplicateName(name.clone()));
            }
        }

        let Some(entry) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        update.apply(&mut entry.task);
        Ok(Some(entry.task.clone()))
    }

    async fn delete_task(&self, id: TaskId) -> RepositoryResult<()> {
        let mut tasks = self.inner.write()?;
        tasks
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn iterate_pending(&self) -> RepositoryResult<Box<dyn PendingCursor>> {
        let now = Utc::now();
        let tasks = self.inner.read()?;
        let mut claimable: Vec<(Reverse<i32>, u64, TaskId)> = tasks
            .values()
            .filter(|e| self.in_view(&e.task) && e.task.is_claimable(now))
            .map(|e| (Reverse(e.task.priority), e.seq, e.task.id))
            .collect();
        claimable.sort_unstable();

        Ok(Box::new(InMemoryPendingCursor {
            inner: Arc::clone(&self.inner),
            ids: claimable.into_iter().map(|(_, _, id)| id).collect(),
        }))
    }

    async fn update_from_state(&self, task: &Task, expected: TaskState) -> RepositoryResult<Task> {
        let mut tasks = self.inner.write()?;
        let entry = tasks
            .get_mut(&task.id)
            .ok_or(RepositoryError::NotFound(task.id))?;

        if entry.task.state != expected {
            return Err(RepositoryError::AlreadyClaimed {
                id: task.id,
                expected,
                actual: entry.task.state,
            });
        }

        let mut stored = task.clone();
        stored.created_at = entry.task.created_at;
        stored.updated_at = Utc::now();
        entry.task = stored.clone();
        Ok(stored)
    }

    async fn unstick_tasks(&self) -> RepositoryResult<u64> {
        let now = Utc::now();
        let mut tasks = self.inner.write()?;
        let mut recovered = 0;
        for entry in tasks.values_mut() {
            let task = &mut entry.task;
            let stuck = task.state == TaskState::Running
                && task.deadline_time.is_some_and(|deadline| deadline < now);
            if stuck && self.in_view(task) {
                task.state = TaskState::Pending;
                task.available_time = Some(now);
                task.deadline_time = None;
                task.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn with_type_filter(&self, task_type: &str) -> Arc<dyn TaskRepository> {
        Arc::new(Self {
            inner: Arc::clone(&self.inner),
            type_filter: Some(task_type.to_string()),
        })
    }
}

/// Cursor over a snapshot of claimable ids. Each id is re-read on `next` so
/// tasks claimed in the meantime are skipped.
struct InMemoryPendingCursor {
    inner: Arc<Inner>,
    ids: VecDeque<TaskId>,
}

#[async_trait]
impl PendingCursor for InMemoryPendingCursor {
    async fn next(&mut self) -> RepositoryResult<Option<Task>> {
        let now = Utc::now();
        while let Some(id) = self.ids.pop_front() {
            let tasks = self.inner.read()?;
            if let Some(entry) = tasks.get(&id) {
                if entry.task.is_claimable(now) {
                    return Ok(Some(entry.task.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn close(self: Box<Self>) -> RepositoryResult<()> {
        Ok(())
    }
}
