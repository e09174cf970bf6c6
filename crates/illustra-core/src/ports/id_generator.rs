//! IdGenerator port - ULID generation behind a trait.
//!
//! The timestamp half of each ULID comes from the injected `Clock`, so a
//! `FixedClock` yields deterministic ordering in tests; the random half keeps
//! ids unique.

use ulid::Ulid;

use crate::domain::ids::{PageId, StoryId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_story_id(&self) -> StoryId;

    fn generate_page_id(&self) -> PageId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_story_id(&self) -> StoryId {
        StoryId::from(self.next_ulid())
    }

    fn generate_page_id(&self) -> PageId {
        PageId::from(self.next_ulid())
    }
}
