//! InMemoryPageStore - stand-in for the app's story/page store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{IllustrationStatus, PageId, StoryId};
use crate::error::IllustraError;
use crate::ports::{PageRef, PageStore};

#[derive(Default)]
struct Pages {
    pages: HashMap<PageId, PageRef>,
    global_references: HashMap<StoryId, String>,
}

#[derive(Default)]
pub struct InMemoryPageStore {
    inner: Mutex<Pages>,
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one page per description (numbered from 1), all Pending.
    pub async fn add_story<S: Into<String>>(
        &self,
        story_id: StoryId,
        descriptions: impl IntoIterator<Item = S>,
    ) -> Vec<PageId> {
        let descriptions: Vec<String> = descriptions.into_iter().map(Into::into).collect();
        let total_pages = descriptions.len() as u32;
        let mut inner = self.inner.lock().await;
        descriptions
            .into_iter()
            .enumerate()
            .map(|(i, description)| {
                let page = PageRef {
                    page_id: PageId::generate(),
                    story_id,
                    page_number: i as u32 + 1,
                    total_pages,
                    illustration_description: description,
                    illustration_status: IllustrationStatus::Pending,
                    illustration_path: None,
                };
                let page_id = page.page_id;
                inner.pages.insert(page_id, page);
                page_id
            })
            .collect()
    }

    /// Pages of a story ordered by page number.
    pub async fn pages_for_story(&self, story_id: StoryId) -> Vec<PageRef> {
        let inner = self.inner.lock().await;
        let mut pages: Vec<PageRef> = inner
            .pages
            .values()
            .filter(|p| p.story_id == story_id)
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.page_number);
        pages
    }

    pub async fn global_reference(&self, story_id: StoryId) -> Option<String> {
        self.inner.lock().await.global_references.get(&story_id).cloned()
    }
}

#[async_trait]
impl PageStore for InMemoryPageStore {
    async fn pages_pending_illustration(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<PageRef>, IllustraError> {
        Ok(self
            .pages_for_story(story_id)
            .await
            .into_iter()
            .filter(|p| p.illustration_status == IllustrationStatus::Pending)
            .collect())
    }

    async fn page(&self, page_id: PageId) -> Result<Option<PageRef>, IllustraError> {
        Ok(self.inner.lock().await.pages.get(&page_id).cloned())
    }

    async fn set_page_status(
        &self,
        page_id: PageId,
        status: IllustrationStatus,
    ) -> Result<(), IllustraError> {
        if let Some(page) = self.inner.lock().await.pages.get_mut(&page_id) {
            page.illustration_status = status;
        }
        Ok(())
    }

    async fn set_page_artifact(&self, page_id: PageId, path: &str) -> Result<(), IllustraError> {
        if let Some(page) = self.inner.lock().await.pages.get_mut(&page_id) {
            page.illustration_path = Some(path.to_string());
        }
        Ok(())
    }

    async fn set_global_reference(
        &self,
        story_id: StoryId,
        path: &str,
    ) -> Result<(), IllustraError> {
        self.inner
            .lock()
            .await
            .global_references
            .insert(story_id, path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_story_numbers_pages_from_one() {
        let store = InMemoryPageStore::new();
        let story = StoryId::generate();
        let ids = store.add_story(story, ["a", "b", "c"]).await;
        assert_eq!(ids.len(), 3);

        let pages = store.pages_for_story(story).await;
        assert_eq!(
            pages.iter().map(|p| p.page_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(pages.iter().all(|p| p.total_pages == 3));
    }

    #[tokio::test]
    async fn only_pending_pages_need_illustration() {
        let store = InMemoryPageStore::new();
        let story = StoryId::generate();
        let ids = store.add_story(story, ["a", "b"]).await;
        store
            .set_page_status(ids[0], IllustrationStatus::Ready)
            .await
            .unwrap();

        let pending = store.pages_pending_illustration(story).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].page_id, ids[1]);
    }

    #[tokio::test]
    async fn writes_to_missing_pages_are_ignored() {
        let store = InMemoryPageStore::new();
        let ghost = PageId::generate();
        store
            .set_page_status(ghost, IllustrationStatus::Generating)
            .await
            .unwrap();
        store.set_page_artifact(ghost, "x.png").await.unwrap();
        assert!(store.page(ghost).await.unwrap().is_none());
    }
}
