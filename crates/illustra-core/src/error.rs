use thiserror::Error;

use crate::domain::{PageId, TaskId, TaskStatus};
use crate::ports::GenerationError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum IllustraError {
    /// The task store (or page store) could not complete a read or write.
    #[error("persistence failure: {source}")]
    Persistence {
        #[source]
        source: BoxError,
    },

    #[error("artifact storage failure: {0}")]
    Artifact(#[from] std::io::Error),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("invalid status transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("no illustration task found for {0}")]
    PageNotFound(PageId),

    #[error("task {task_id} cannot be retried while {status}")]
    NotRetryable { task_id: TaskId, status: TaskStatus },

    #[error("coordinator is already running")]
    AlreadyRunning,

    #[error("coordinator is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IllustraError {
    pub fn persistence(source: impl Into<BoxError>) -> Self {
        Self::Persistence {
            source: source.into(),
        }
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

impl From<figment::Error> for IllustraError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
