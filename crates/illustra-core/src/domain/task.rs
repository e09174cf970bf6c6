//! Illustration task: immutable identity, mutable status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PageId, Priority, StoryId, TaskId, TaskStatus};
use crate::error::IllustraError;

/// What a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "page_id", rename_all = "snake_case")]
pub enum TaskTarget {
    /// The illustration of one page.
    Page(PageId),

    /// The story-wide character reference image.
    GlobalReference,
}

/// One unit of illustration work.
///
/// Design:
/// - `id`, `target`, `story_id` and `created_at` never change.
/// - Status changes go through `transition`, which enforces the state machine.
/// - `attempt_count` only grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IllustrationTask {
    pub id: TaskId,
    pub story_id: StoryId,
    pub target: TaskTarget,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl IllustrationTask {
    pub fn new(
        id: TaskId,
        story_id: StoryId,
        target: TaskTarget,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            story_id,
            target,
            priority,
            status: TaskStatus::Pending,
            created_at: now,
            last_updated_at: now,
            attempt_count: 0,
        }
    }

    /// Task for a page, prioritised by page position.
    pub fn for_page(
        id: TaskId,
        story_id: StoryId,
        page_id: PageId,
        page_number: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            id,
            story_id,
            TaskTarget::Page(page_id),
            Priority::for_page(page_number),
            now,
        )
    }

    /// Global reference tasks run first so pages can reuse the reference.
    pub fn global_reference(id: TaskId, story_id: StoryId, now: DateTime<Utc>) -> Self {
        Self::new(
            id,
            story_id,
            TaskTarget::GlobalReference,
            Priority::Critical,
            now,
        )
    }

    pub fn page_id(&self) -> Option<PageId> {
        match self.target {
            TaskTarget::Page(page_id) => Some(page_id),
            TaskTarget::GlobalReference => None,
        }
    }

    pub fn is_global_reference(&self) -> bool {
        self.target == TaskTarget::GlobalReference
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(
        &mut self,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), IllustraError> {
        if !self.status.can_transition_to(&next) {
            return Err(IllustraError::InvalidTransition {
                task_id: self.id,
                from: self.status.clone(),
                to: next,
            });
        }
        self.status = next;
        self.last_updated_at = now;
        Ok(())
    }

    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn page_task(page_number: u32) -> IllustrationTask {
        IllustrationTask::for_page(
            TaskId::generate(),
            StoryId::generate(),
            PageId::generate(),
            page_number,
            at(0),
        )
    }

    #[test]
    fn new_task_starts_pending_with_no_attempts() {
        let task = page_task(2);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.created_at, task.last_updated_at);
        assert!(task.page_id().is_some());
    }

    #[test]
    fn transition_updates_timestamp() {
        let mut task = page_task(1);
        task.transition(TaskStatus::Scheduled, at(5)).unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.last_updated_at, at(5));
        assert_eq!(task.created_at, at(0));
    }

    #[test]
    fn invalid_transition_is_rejected_and_leaves_task_untouched() {
        let mut task = page_task(1);
        let err = task.transition(TaskStatus::Ready, at(5)).unwrap_err();
        assert!(matches!(err, IllustraError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_updated_at, at(0));
    }

    #[test]
    fn attempts_only_grow() {
        let mut task = page_task(3);
        task.record_attempt(at(1));
        task.record_attempt(at(2));
        assert_eq!(task.attempt_count, 2);
        assert_eq!(task.last_updated_at, at(2));
    }

    #[test]
    fn global_reference_is_critical_and_pageless() {
        let task =
            IllustrationTask::global_reference(TaskId::generate(), StoryId::generate(), at(0));
        assert!(task.is_global_reference());
        assert_eq!(task.page_id(), None);
        assert_eq!(task.priority, Priority::Critical);
    }
}
