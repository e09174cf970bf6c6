//! App layer: wires the ports into a running scheduler.
//!
//! - **CoordinatorBuilder**: construction and fail-fast validation
//! - **Coordinator**: public API (enqueue, status, retry, delete, start/stop)
//! - **Executor**: runs one admitted task through the state machine
//! - **WorkerHandle**: the admission loop with bounded concurrency
//! - **StoryStatus**: per-story task counts

pub mod builder;
pub mod coordinator;
pub mod executor;
pub mod status;
pub mod worker_loop;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::Coordinator;
pub use self::executor::{CancellationRegistry, ExecutionOutcome, Executor};
pub use self::status::StoryStatus;
pub use self::worker_loop::WorkerHandle;
