//! Status change events broadcast to observers (UI layer, CLI).

use serde::{Deserialize, Serialize};

use super::{IllustrationStatus, PageId, StoryId, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub task_id: TaskId,
    pub story_id: StoryId,
    /// `None` for the global reference task.
    pub page_id: Option<PageId>,
    pub status: TaskStatus,
}

impl StatusEvent {
    /// The status a page observer would see.
    pub fn page_status(&self) -> IllustrationStatus {
        self.status.page_status()
    }
}
