//! Task repository implementations.
//!
//! - [`InMemoryTaskRepository`]: single-process store for tests and local runs.
//! - [`PostgresTaskRepository`]: shared store for a fleet of queue instances.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryTaskRepository;
pub use postgres::PostgresTaskRepository;
