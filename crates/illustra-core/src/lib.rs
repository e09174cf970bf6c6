//! illustra-core
//!
//! Background illustration scheduling for illustrated stories: a persistent,
//! priority-ordered, crash-recoverable task queue with bounded concurrency.
//!
//! # Modules
//! - **domain**: ids, priorities, task and page statuses, records, decisions, events
//! - **ports**: TaskStore, PageStore, IllustrationGenerator, ArtifactStore, Clock, IdGenerator
//! - **queue**: the in-memory scheduler (priority queue, backoff heap, concurrency gate)
//! - **store**: TaskStore implementations (SQLite, in-memory)
//! - **app**: executor, worker loop and the `Coordinator` facade
//! - **impls**: development and test implementations of the other ports
//! - **config**: `SchedulerConfig` loading (defaults, TOML, env)

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod store;

pub use app::{BuildError, Coordinator, CoordinatorBuilder, StoryStatus};
pub use config::SchedulerConfig;
pub use error::IllustraError;
