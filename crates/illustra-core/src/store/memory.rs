//! In-memory task store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    IllustrationTask, PageId, PersistedTaskRecord, StoryId, TaskContext, TaskId, TaskStatus,
};
use crate::error::IllustraError;
use crate::ports::{Clock, SystemClock, TaskStore};

#[derive(Default)]
struct MemoryState {
    /// Record plus insertion sequence (the in-memory equivalent of a rowid).
    records: HashMap<TaskId, (u64, PersistedTaskRecord)>,
    next_seq: u64,
}

impl MemoryState {
    fn update<F>(&mut self, id: TaskId, f: F) -> Option<PersistedTaskRecord>
    where
        F: FnOnce(&mut PersistedTaskRecord),
    {
        let (_, record) = self.records.get_mut(&id)?;
        f(record);
        Some(record.clone())
    }

    fn matching(
        &self,
        mut keep: impl FnMut(&PersistedTaskRecord) -> bool,
    ) -> Vec<(u64, PersistedTaskRecord)> {
        self.records
            .values()
            .filter(|(_, r)| keep(r))
            .cloned()
            .collect()
    }
}

/// All writes go through one async mutex, so writers to the same id serialize.
pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_task(
        &self,
        task: &IllustrationTask,
        context: &TaskContext,
    ) -> Result<PersistedTaskRecord, IllustraError> {
        let mut state = self.state.lock().await;
        if let Some((_, existing)) = state.records.get_mut(&task.id) {
            existing.task.status = task.status.clone();
            existing.task.last_updated_at = task.last_updated_at;
            existing.task.attempt_count = task.attempt_count;
            existing.context = context.clone();
            return Ok(existing.clone());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let record = PersistedTaskRecord::new(task.clone(), context.clone());
        state.records.insert(task.id, (seq, record.clone()));
        Ok(record)
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: &TaskStatus,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.update(id, |r| {
            r.task.status = status.clone();
            r.task.last_updated_at = now;
        }))
    }

    async fn increment_attempt(
        &self,
        id: TaskId,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.update(id, |r| r.task.record_attempt(now)))
    }

    async fn update_illustration_path(
        &self,
        id: TaskId,
        path: &str,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.update(id, |r| {
            r.illustration_path = Some(path.to_string());
            r.task.last_updated_at = now;
        }))
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, IllustraError> {
        Ok(self.state.lock().await.records.remove(&id).is_some())
    }

    async fn delete_all_for_story(&self, story_id: StoryId) -> Result<usize, IllustraError> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state.records.retain(|_, (_, r)| r.task.story_id != story_id);
        Ok(before - state.records.len())
    }

    async fn get_all_pending(&self) -> Result<Vec<PersistedTaskRecord>, IllustraError> {
        let state = self.state.lock().await;
        let mut rows = state.matching(|r| !r.task.status.is_terminal());
        rows.sort_by(|(a_seq, a), (b_seq, b)| {
            (a.task.priority, a.task.created_at, a_seq).cmp(&(
                b.task.priority,
                b.task.created_at,
                b_seq,
            ))
        });
        Ok(rows.into_iter().map(|(_, r)| r).collect())
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        Ok(self.state.lock().await.records.get(&id).map(|(_, r)| r.clone()))
    }

    async fn get_for_page(
        &self,
        page_id: PageId,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let state = self.state.lock().await;
        Ok(state
            .matching(|r| r.task.page_id() == Some(page_id))
            .into_iter()
            .max_by_key(|(seq, r)| (r.task.created_at, *seq))
            .map(|(_, r)| r))
    }

    async fn get_for_story(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<PersistedTaskRecord>, IllustraError> {
        let state = self.state.lock().await;
        let mut rows = state.matching(|r| r.task.story_id == story_id);
        rows.sort_by_key(|(seq, r)| (!r.task.is_global_reference(), r.context.page_number, *seq));
        Ok(rows.into_iter().map(|(_, r)| r).collect())
    }

    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, IllustraError> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state
            .records
            .retain(|_, (_, r)| {
                !(r.task.status.is_terminal() && r.task.last_updated_at < older_than)
            });
        Ok(before - state.records.len())
    }
}
