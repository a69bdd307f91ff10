//! Repository error model.

use thiserror::Error;

use crate::id::TaskId;
use crate::task::TaskState;

/// Result type used across the repository boundary.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Error returned by a [`TaskRepository`](crate::TaskRepository).
///
/// `AlreadyClaimed` is the only variant the engine treats as an expected
/// outcome: it means another scheduler won the compare-and-swap on the task
/// state. Everything else is a genuine failure of the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The task does not exist.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The stored state no longer matches the state the caller expected.
    #[error("task {id} already claimed: expected state {expected}, found {actual}")]
    AlreadyClaimed {
        id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    /// A task with this name already exists.
    #[error("task name already in use: {0}")]
    DuplicateName(String),

    /// The request was malformed (e.g. empty task type).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backing store failed (connection, serialization, poisoned lock, ...).
    #[error("storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True when another scheduler already moved the task out of the expected state.
    pub fn is_already_claimed(&self) -> bool {
        matches!(self, Self::AlreadyClaimed { .. })
    }
}
