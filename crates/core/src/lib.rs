//! `cadence-core`: task model and the contracts of the task queue.
//!
//! This crate has no runtime or storage concerns: it defines what a task is,
//! how its state moves, and the two seams the queue engine is built on
//! ([`TaskRepository`] and [`Runner`]).

pub mod error;
pub mod id;
pub mod jitter;
pub mod query;
pub mod repository;
pub mod runner;
pub mod task;

pub use error::{RepositoryError, RepositoryResult};
pub use id::TaskId;
pub use query::{Pagination, TaskFilter, TaskPage};
pub use repository::{PendingCursor, TaskRepository, ensure_task};
pub use runner::{RunContext, Runner};
pub use task::{CreateTask, Task, TaskState, UpdateTask};
