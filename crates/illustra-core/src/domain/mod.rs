//! Domain model: ids, priorities, statuses, tasks, records, decisions.

pub mod decision;
pub mod events;
pub mod ids;
pub mod priority;
pub mod record;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use events::StatusEvent;
pub use ids::{PageId, StoryId, TaskId};
pub use priority::Priority;
pub use record::{PersistedTaskRecord, TaskContext};
pub use state::{IllustrationStatus, TaskStatus};
pub use task::{IllustrationTask, TaskTarget};
