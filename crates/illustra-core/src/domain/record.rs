//! Persisted task record: the durable projection of a task.

use serde::{Deserialize, Serialize};

use super::IllustrationTask;

/// Generation context kept alongside a task so a retry never has to
/// re-derive it from the story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub page_number: u32,
    pub total_pages: u32,
    /// Prompt text for the image.
    pub illustration_description: String,
    /// Earlier artifact used for visual continuity, if known at enqueue time.
    pub previous_illustration_path: Option<String>,
}

impl TaskContext {
    pub fn new(page_number: u32, total_pages: u32, description: impl Into<String>) -> Self {
        Self {
            page_number,
            total_pages,
            illustration_description: description.into(),
            previous_illustration_path: None,
        }
    }

    pub fn with_previous_illustration(mut self, path: impl Into<String>) -> Self {
        self.previous_illustration_path = Some(path.into());
        self
    }
}

/// Single source of truth for a task, owned by the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTaskRecord {
    pub task: IllustrationTask,
    pub context: TaskContext,
    /// Storage path of the generated artifact, set once generation succeeded.
    pub illustration_path: Option<String>,
}

impl PersistedTaskRecord {
    pub fn new(task: IllustrationTask, context: TaskContext) -> Self {
        Self {
            task,
            context,
            illustration_path: None,
        }
    }
}
