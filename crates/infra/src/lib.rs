//! Queue engine and task stores.
//!
//! - [`queue`]: the [`Queue`](queue::Queue) engine and the type-partitioned
//!   [`MultiQueue`](queue::MultiQueue).
//! - [`store`]: [`TaskRepository`](cadence_core::TaskRepository) implementations.

pub mod queue;
pub mod store;


pub use queue::{MultiQueue, Queue, QueueConfig, QueueError};
pub use store::{InMemoryTaskRepository, PostgresTaskRepository};
