use serde::{Deserialize, Serialize};

use crate::domain::{PersistedTaskRecord, TaskStatus};

/// Per-story task counts, as shown on a story's progress view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryStatus {
    pub pending: usize,
    pub scheduled: usize,
    pub generating: usize,
    pub retrying: usize,
    pub ready: usize,
    pub failed: usize,
    pub has_global_reference: bool,
}

impl StoryStatus {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PersistedTaskRecord>) -> Self {
        let mut status = Self::default();
        for record in records {
            if record.task.is_global_reference() && record.task.status == TaskStatus::Ready {
                status.has_global_reference = true;
            }
            match record.task.status {
                TaskStatus::Pending => status.pending += 1,
                TaskStatus::Scheduled => status.scheduled += 1,
                TaskStatus::Generating => status.generating += 1,
                TaskStatus::Retrying { .. } => status.retrying += 1,
                TaskStatus::Ready => status.ready += 1,
                TaskStatus::Failed { .. } => status.failed += 1,
            }
        }
        status
    }

    pub fn total(&self) -> usize {
        self.pending + self.scheduled + self.generating + self.retrying + self.ready + self.failed
    }

    /// Nothing left to run: every task is Ready or Failed.
    pub fn is_settled(&self) -> bool {
        self.pending + self.scheduled + self.generating + self.retrying == 0
    }
}
