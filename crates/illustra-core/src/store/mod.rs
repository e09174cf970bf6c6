//! TaskStore implementations.

mod memory;
mod sqlite;

#[cfg(test)]
pub(crate) mod contract;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;
