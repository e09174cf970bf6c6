//! TaskStore port - the durable source of truth for illustration tasks.
//!
//! Design:
//! - Every operation is async; nothing in the scheduler blocks a thread on it.
//! - Updates by id return `None` when the record is gone. That is a benign
//!   race (the story was deleted), not an error.
//! - Writers to the same id are serialized by the implementation.
//! - The scheduler queue can always be rebuilt from `get_all_pending`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{
    IllustrationTask, PageId, PersistedTaskRecord, StoryId, TaskContext, TaskId, TaskStatus,
};
use crate::error::IllustraError;
use crate::queue::Scheduler;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert by task id. An existing record keeps its identity and creation
    /// time; status, timestamps, attempt count and context are overwritten.
    async fn save_task(
        &self,
        task: &IllustrationTask,
        context: &TaskContext,
    ) -> Result<PersistedTaskRecord, IllustraError>;

    async fn update_status(
        &self,
        id: TaskId,
        status: &TaskStatus,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError>;

    async fn increment_attempt(
        &self,
        id: TaskId,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError>;

    async fn update_illustration_path(
        &self,
        id: TaskId,
        path: &str,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError>;

    /// Returns whether a record was deleted.
    async fn delete_task(&self, id: TaskId) -> Result<bool, IllustraError>;

    /// Returns the number of records deleted.
    async fn delete_all_for_story(&self, story_id: StoryId) -> Result<usize, IllustraError>;

    /// Non-terminal records (Pending, Scheduled, Generating, Retrying),
    /// ordered by priority, then creation time, then insertion order.
    async fn get_all_pending(&self) -> Result<Vec<PersistedTaskRecord>, IllustraError>;

    async fn get_by_id(&self, id: TaskId) -> Result<Option<PersistedTaskRecord>, IllustraError>;

    /// The most recently created task for the page.
    async fn get_for_page(
        &self,
        page_id: PageId,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError>;

    /// All tasks of a story: global reference first, then by page number.
    async fn get_for_story(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<PersistedTaskRecord>, IllustraError>;

    /// Delete Ready/Failed records last updated before `older_than`.
    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, IllustraError>;

    /// Rebuild the scheduler queue after a restart.
    ///
    /// In-flight markers (Scheduled, Generating, Retrying) cannot have
    /// survived a restart honestly, so those records are reset to Pending and
    /// persisted before being queued. Returns the number of tasks queued.
    async fn restore_into(&self, scheduler: &Scheduler) -> Result<usize, IllustraError> {
        let records = self.get_all_pending().await?;
        let mut restored = 0;
        for record in records {
            let mut task = record.task;
            if task.status.is_in_flight_marker() {
                debug!(
                    task_id = %task.id,
                    status = %task.status,
                    "resetting in-flight task to pending"
                );
                match self.update_status(task.id, &TaskStatus::Pending).await? {
                    Some(updated) => task = updated.task,
                    None => continue,
                }
            }
            if scheduler.add_task(task) {
                restored += 1;
            }
        }
        info!(restored, "restored illustration tasks");
        Ok(restored)
    }
}
