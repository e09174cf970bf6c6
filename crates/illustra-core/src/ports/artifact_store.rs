//! ArtifactStore port - where generated image bytes end up.
//!
//! The storage format belongs to the implementation; the scheduler only keeps
//! the returned reference (a path or cache key).

use async_trait::async_trait;

use crate::domain::{StoryId, TaskId};
use crate::error::IllustraError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the bytes and return their reference.
    async fn put(
        &self,
        story_id: StoryId,
        task_id: TaskId,
        bytes: &[u8],
    ) -> Result<String, IllustraError>;

    /// Delete a stored artifact. Removing one that is already gone is not
    /// an error.
    async fn remove(&self, reference: &str) -> Result<(), IllustraError>;
}
