//! CoordinatorBuilder - wiring of ports into a `Coordinator`.
//!
//! Fail-fast: `build()` validates the config and reports every missing
//! component at once instead of failing on first use.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};

use super::coordinator::{Coordinator, CoordinatorInner};
use super::executor::{CancellationRegistry, Executor};
use crate::config::SchedulerConfig;
use crate::domain::{Decider, DefaultDecider};
use crate::error::IllustraError;
use crate::ports::{
    ArtifactStore, Clock, IdGenerator, IllustrationGenerator, PageStore, SystemClock, TaskStore,
    UlidGenerator,
};
use crate::queue::{RetryPolicy, Scheduler};

const EVENT_CAPACITY: usize = 256;

/// # Example
/// ```ignore
/// let coordinator = CoordinatorBuilder::new(config)
///     .task_store(Arc::new(SqliteTaskStore::open("illustra.db").await?))
///     .page_store(pages)
///     .generator(Arc::new(client))
///     .artifact_store(Arc::new(LocalArtifactStore::new("artifacts")))
///     .build()?;
/// coordinator.start().await?;
/// ```
pub struct CoordinatorBuilder {
    config: SchedulerConfig,
    tasks: Option<Arc<dyn TaskStore>>,
    pages: Option<Arc<dyn PageStore>>,
    generator: Option<Arc<dyn IllustrationGenerator>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing components: {0:?}")]
    MissingComponents(Vec<&'static str>),

    #[error(transparent)]
    InvalidConfig(#[from] IllustraError),
}

impl CoordinatorBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            tasks: None,
            pages: None,
            generator: None,
            artifacts: None,
            clock: None,
            ids: None,
            decider: None,
        }
    }

    pub fn task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn page_store(mut self, pages: Arc<dyn PageStore>) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn IllustrationGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a `UlidGenerator` on the builder's clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to `DefaultDecider` with the configured retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> Result<Coordinator, BuildError> {
        self.config.validate()?;

        let mut missing = Vec::new();
        if self.tasks.is_none() {
            missing.push("task_store");
        }
        if self.pages.is_none() {
            missing.push("page_store");
        }
        if self.generator.is_none() {
            missing.push("generator");
        }
        if self.artifacts.is_none() {
            missing.push("artifact_store");
        }
        let (Some(tasks), Some(pages), Some(generator), Some(artifacts)) =
            (self.tasks, self.pages, self.generator, self.artifacts)
        else {
            return Err(BuildError::MissingComponents(missing));
        };

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let policy = RetryPolicy::from_config(&config.retry, config.max_attempts);
        let persistence_backoff = policy.base_delay.max(Duration::from_millis(100));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(policy)));

        let scheduler = Arc::new(Scheduler::new(config.concurrency_limit));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancellations = CancellationRegistry::default();
        let executor = Arc::new(Executor {
            tasks: Arc::clone(&tasks),
            pages: Arc::clone(&pages),
            generator,
            artifacts,
            decider,
            scheduler: Arc::clone(&scheduler),
            clock: Arc::clone(&clock),
            events: events.clone(),
            cancellations: cancellations.clone(),
            persistence_backoff,
        });

        Ok(Coordinator {
            inner: Arc::new(CoordinatorInner {
                config,
                tasks,
                pages,
                scheduler,
                executor,
                ids,
                clock,
                events,
                cancellations,
                worker: Mutex::new(None),
            }),
        })
    }
}
