//! Task queue engine.
//!
//! A [`Queue`] is one manager task plus a fixed pool of worker tasks:
//!
//! ```text
//!   repository --(claim)--> manager --(dispatch channel)--> workers
//!        ^                     |  ^                            |
//!        +------(persist)------+  +----(completion channel)----+
//! ```
//!
//! The manager owns the available-worker count and the pending cursor, so
//! neither needs a lock. Instances on different hosts coordinate only through
//! [`TaskRepository::update_from_state`](cadence_core::TaskRepository::update_from_state).
//!
//! [`MultiQueue`] partitions by task type, one `Queue` per registered runner.

pub mod config;
mod engine;
mod manager;
pub mod multi;
mod worker;

pub use config::QueueConfig;
pub use engine::Queue;
pub use multi::MultiQueue;

/// Queue construction and lifecycle error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid runner: {0}")]
    InvalidRunner(String),
    #[error("queue {0} already started")]
    AlreadyStarted(String),
    #[error("queue {0} must be started from within a tokio runtime")]
    NoRuntime(String),
}
