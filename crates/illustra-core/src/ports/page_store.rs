//! PageStore port - the story/page store owned by the rest of the app.
//!
//! The scheduler only reads pages and mirrors task status into them. Writes
//! to pages that no longer exist are no-ops, not errors: a story can be
//! deleted while one of its tasks is still generating.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{IllustrationStatus, PageId, StoryId};
use crate::error::IllustraError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub page_id: PageId,
    pub story_id: StoryId,
    /// 1-based.
    pub page_number: u32,
    pub total_pages: u32,
    pub illustration_description: String,
    pub illustration_status: IllustrationStatus,
    pub illustration_path: Option<String>,
}

#[async_trait]
pub trait PageStore: Send + Sync {
    /// Pages of the story whose illustration has never been requested.
    async fn pages_pending_illustration(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<PageRef>, IllustraError>;

    async fn page(&self, page_id: PageId) -> Result<Option<PageRef>, IllustraError>;

    async fn set_page_status(
        &self,
        page_id: PageId,
        status: IllustrationStatus,
    ) -> Result<(), IllustraError>;

    async fn set_page_artifact(&self, page_id: PageId, path: &str) -> Result<(), IllustraError>;

    /// Record the story-wide character reference image.
    async fn set_global_reference(
        &self,
        story_id: StoryId,
        path: &str,
    ) -> Result<(), IllustraError>;
}
