//! Port implementations for development, the CLI demo and tests.
//!
//! - `InMemoryPageStore`: pages of stories held in memory
//! - `LocalArtifactStore`: writes artifacts under a root directory
//! - `SimulatedGenerator`: fake image generation with random transient failures
//! - `ScriptedGenerator`: replays a fixed list of outcomes (tests)

pub mod artifact;
pub mod page_store;
pub mod scripted;
pub mod simulated;

pub use self::artifact::LocalArtifactStore;
pub use self::page_store::InMemoryPageStore;
pub use self::scripted::ScriptedGenerator;
pub use self::simulated::SimulatedGenerator;
