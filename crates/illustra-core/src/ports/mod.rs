//! Ports - the seams between the scheduler and everything it does not own.
//!
//! - `TaskStore` is the source of truth; the scheduler queue is derived from it.
//! - `PageStore`, `IllustrationGenerator` and `ArtifactStore` are the app's
//!   collaborators, consumed as opaque interfaces.
//! - `Clock` and `IdGenerator` exist for deterministic tests.

pub mod artifact_store;
pub mod clock;
pub mod generator;
pub mod id_generator;
pub mod page_store;
pub mod task_store;

pub use self::artifact_store::ArtifactStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::generator::{GenerationContext, GenerationError, IllustrationGenerator};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::page_store::{PageRef, PageStore};
pub use self::task_store::TaskStore;
