//! Coordinator - the public surface of the illustration scheduler.
//!
//! Explicitly constructed (see `CoordinatorBuilder`) and cheap to clone.
//! Every enqueue persists the task before it enters the scheduler, so a
//! crash at any point loses nothing that `start()` cannot restore.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::executor::{CancellationRegistry, Executor};
use super::status::StoryStatus;
use super::worker_loop::WorkerHandle;
use crate::config::SchedulerConfig;
use crate::domain::{
    IllustrationStatus, IllustrationTask, PageId, PersistedTaskRecord, Priority, StatusEvent,
    StoryId, TaskContext, TaskId, TaskStatus, TaskTarget,
};
use crate::error::IllustraError;
use crate::ports::{Clock, IdGenerator, PageRef, PageStore, TaskStore};
use crate::queue::Scheduler;

#[derive(Clone)]
pub struct Coordinator {
    pub(crate) inner: Arc<CoordinatorInner>,
}

pub(crate) struct CoordinatorInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) pages: Arc<dyn PageStore>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: broadcast::Sender<StatusEvent>,
    pub(crate) cancellations: CancellationRegistry,
    pub(crate) worker: Mutex<Option<WorkerHandle>>,
}

impl Coordinator {
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// Restore unfinished tasks from the store and start the worker loop.
    /// Returns the number of tasks restored.
    pub async fn start(&self) -> Result<usize, IllustraError> {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            return Err(IllustraError::AlreadyRunning);
        }
        let restored = self.inner.tasks.restore_into(&self.inner.scheduler).await?;
        self.mirror_queued_pages().await?;
        *worker = Some(WorkerHandle::spawn(
            Arc::clone(&self.inner.scheduler),
            Arc::clone(&self.inner.executor),
        ));
        info!(restored, pending = self.inner.scheduler.pending_count(), "coordinator started");
        Ok(restored)
    }

    /// Stop admitting tasks and wait for in-flight executions to finish.
    /// Queued tasks stay persisted and are picked up by the next `start()`.
    pub async fn stop(&self) -> Result<(), IllustraError> {
        let handle = self.inner.worker.lock().await.take();
        let Some(handle) = handle else {
            return Err(IllustraError::NotRunning);
        };
        handle.shutdown_and_join().await;
        info!(pending = self.inner.scheduler.pending_count(), "coordinator stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.worker.lock().await.is_some()
    }

    /// Settings toggle for background generation.
    pub async fn set_background_enabled(&self, enabled: bool) -> Result<(), IllustraError> {
        let result = if enabled {
            self.start().await.map(|_| ())
        } else {
            self.stop().await
        };
        match result {
            Err(IllustraError::AlreadyRunning | IllustraError::NotRunning) => Ok(()),
            other => other,
        }
    }

    /// Enqueue every page of the story that has never been illustrated.
    /// Called when a story is opened. Returns the ids of the queued tasks.
    pub async fn enqueue_for_story(&self, story_id: StoryId) -> Result<Vec<TaskId>, IllustraError> {
        let pages = self.inner.pages.pages_pending_illustration(story_id).await?;
        let mut queued = Vec::with_capacity(pages.len());
        for page in pages {
            if let Some(existing) = self.resume_existing(page.page_id).await? {
                queued.push(existing);
                continue;
            }
            let now = self.inner.clock.now();
            let task = IllustrationTask::for_page(
                self.inner.ids.generate_task_id(),
                story_id,
                page.page_id,
                page.page_number,
                now,
            );
            queued.push(self.admit_new(task, page_context(&page)).await?);
        }
        info!(%story_id, queued = queued.len(), "story enqueued for illustration");
        Ok(queued)
    }

    /// Enqueue the story's character reference image at Critical priority.
    /// An existing unfinished or ready reference is reused.
    pub async fn enqueue_global_reference(
        &self,
        story_id: StoryId,
        description: &str,
    ) -> Result<TaskId, IllustraError> {
        let existing = self
            .inner
            .tasks
            .get_for_story(story_id)
            .await?
            .into_iter()
            .find(|r| {
                r.task.is_global_reference()
                    && !matches!(r.task.status, TaskStatus::Failed { .. })
            });
        if let Some(record) = existing {
            if !record.task.status.is_terminal() {
                self.inner.scheduler.add_task(record.task.clone());
            }
            return Ok(record.task.id);
        }

        let task = IllustrationTask::global_reference(
            self.inner.ids.generate_task_id(),
            story_id,
            self.inner.clock.now(),
        );
        self.admit_new(task, TaskContext::new(0, 0, description)).await
    }

    /// The page's illustration status, as the UI shows it.
    pub async fn get_status(
        &self,
        page_id: PageId,
    ) -> Result<Option<IllustrationStatus>, IllustraError> {
        Ok(self
            .inner
            .pages
            .page(page_id)
            .await?
            .map(|page| page.illustration_status))
    }

    pub async fn story_status(&self, story_id: StoryId) -> Result<StoryStatus, IllustraError> {
        let records = self.inner.tasks.get_for_story(story_id).await?;
        Ok(StoryStatus::from_records(&records))
    }

    /// All task records of a story, global reference first.
    pub async fn story_tasks(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<PersistedTaskRecord>, IllustraError> {
        self.inner.tasks.get_for_story(story_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Manual retry of a failed page: the failed record is replaced by a
    /// fresh task (new id, attempts from zero) at elevated priority.
    pub async fn retry_page(&self, page_id: PageId) -> Result<TaskId, IllustraError> {
        let record = self
            .inner
            .tasks
            .get_for_page(page_id)
            .await?
            .ok_or(IllustraError::PageNotFound(page_id))?;
        if !matches!(record.task.status, TaskStatus::Failed { .. }) {
            return Err(IllustraError::NotRetryable {
                task_id: record.task.id,
                status: record.task.status,
            });
        }
        let page = self
            .inner
            .pages
            .page(page_id)
            .await?
            .ok_or(IllustraError::PageNotFound(page_id))?;

        self.inner.tasks.delete_task(record.task.id).await?;
        let task = IllustrationTask::new(
            self.inner.ids.generate_task_id(),
            record.task.story_id,
            TaskTarget::Page(page_id),
            Priority::for_manual_retry(page.page_number),
            self.inner.clock.now(),
        );
        let id = self.admit_new(task, record.context).await?;
        info!(%page_id, failed_task = %record.task.id, task_id = %id, "manual retry queued");
        Ok(id)
    }

    /// Forget a deleted story: drop queued tasks and delete its records.
    /// In-flight generations finish as no-ops, or are aborted when
    /// `cancel_in_flight_on_delete` is set. Returns the number of records deleted.
    pub async fn delete_story(&self, story_id: StoryId) -> Result<usize, IllustraError> {
        let dequeued = self.inner.scheduler.remove_story(story_id);
        let deleted = self.inner.tasks.delete_all_for_story(story_id).await?;
        let cancelled = if self.inner.config.cancel_in_flight_on_delete {
            self.inner.cancellations.cancel_story(story_id)
        } else {
            0
        };
        info!(%story_id, dequeued = dequeued.len(), deleted, cancelled, "story tasks removed");
        Ok(deleted)
    }

    /// Delete Ready/Failed records last updated before `older_than`.
    pub async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, IllustraError> {
        let pruned = self.inner.tasks.prune_terminal(older_than).await?;
        debug!(pruned, %older_than, "pruned terminal tasks");
        Ok(pruned)
    }

    /// `prune_terminal` with the configured retention.
    pub async fn prune_expired(&self) -> Result<usize, IllustraError> {
        let hours = i64::try_from(self.inner.config.prune_after_hours).unwrap_or(i64::MAX);
        let cutoff = self
            .inner
            .clock
            .now()
            .checked_sub_signed(ChronoDuration::try_hours(hours).unwrap_or(ChronoDuration::MAX))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_terminal(cutoff).await
    }

    /// Restored tasks are queued again; their pages may still show the
    /// Scheduled or Generating state of the previous run.
    async fn mirror_queued_pages(&self) -> Result<(), IllustraError> {
        for record in self.inner.tasks.get_all_pending().await? {
            let Some(page_id) = record.task.page_id() else {
                continue;
            };
            if self.inner.scheduler.contains(record.task.id) {
                self.inner
                    .pages
                    .set_page_status(page_id, IllustrationStatus::Scheduled)
                    .await?;
            }
        }
        Ok(())
    }

    /// If the page already has an unfinished task, make sure it is queued
    /// and return its id instead of creating a second one.
    async fn resume_existing(&self, page_id: PageId) -> Result<Option<TaskId>, IllustraError> {
        let Some(record) = self.inner.tasks.get_for_page(page_id).await? else {
            return Ok(None);
        };
        if record.task.status.is_terminal() {
            return Ok(None);
        }
        if self.inner.scheduler.add_task(record.task.clone()) {
            warn!(
                task_id = %record.task.id,
                %page_id,
                "re-queued unfinished task for pending page"
            );
        }
        self.inner
            .pages
            .set_page_status(page_id, record.task.status.page_status())
            .await?;
        Ok(Some(record.task.id))
    }

    /// Persist a new task as Scheduled, then queue it and mirror the page.
    async fn admit_new(
        &self,
        mut task: IllustrationTask,
        context: TaskContext,
    ) -> Result<TaskId, IllustraError> {
        task.transition(TaskStatus::Scheduled, self.inner.clock.now())?;
        self.inner.tasks.save_task(&task, &context).await?;
        self.inner.scheduler.add_task(task.clone());
        if let Some(page_id) = task.page_id() {
            self.inner
                .pages
                .set_page_status(page_id, IllustrationStatus::Scheduled)
                .await?;
        }
        debug!(
            task_id = %task.id,
            story_id = %task.story_id,
            priority = %task.priority,
            "task scheduled"
        );
        let _ = self.inner.events.send(StatusEvent {
            task_id: task.id,
            story_id: task.story_id,
            page_id: task.page_id(),
            status: task.status.clone(),
        });
        Ok(task.id)
    }
}

fn page_context(page: &PageRef) -> TaskContext {
    TaskContext::new(
        page.page_number,
        page.total_pages,
        page.illustration_description.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::app::CoordinatorBuilder;
    use crate::config::RetryConfig;
    use crate::impls::{InMemoryPageStore, LocalArtifactStore, ScriptedGenerator};
    use crate::ports::{FixedClock, GenerationError};
    use crate::store::{InMemoryTaskStore, SqliteTaskStore};
    use chrono::TimeZone;

    fn fast_config(concurrency_limit: usize, max_attempts: u32) -> SchedulerConfig {
        SchedulerConfig {
            concurrency_limit,
            max_attempts,
            retry: RetryConfig {
                base_delay_ms: 5,
                multiplier: 2.0,
                max_delay_ms: 20,
            },
            ..SchedulerConfig::default()
        }
    }

    struct Fixture {
        coordinator: Coordinator,
        tasks: Arc<dyn TaskStore>,
        pages: Arc<InMemoryPageStore>,
        generator: Arc<ScriptedGenerator>,
        clock: Arc<FixedClock>,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: SchedulerConfig, generator: ScriptedGenerator) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let pages = Arc::new(InMemoryPageStore::new());
        let generator = Arc::new(generator);
        let coordinator = CoordinatorBuilder::new(config)
            .task_store(Arc::clone(&tasks))
            .page_store(pages.clone())
            .generator(generator.clone())
            .artifact_store(Arc::new(LocalArtifactStore::new(dir.path())))
            .clock(clock.clone())
            .build()
            .unwrap();
        Fixture {
            coordinator,
            tasks,
            pages,
            generator,
            clock,
            _dir: dir,
        }
    }

    async fn wait_until_settled(coordinator: &Coordinator, story_id: StoryId) -> StoryStatus {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let status = coordinator.story_status(story_id).await.unwrap();
                if status.total() > 0 && status.is_settled() {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("story did not settle")
    }

    #[tokio::test]
    async fn enqueue_persists_before_queueing_and_marks_pages_scheduled() {
        let f = fixture(fast_config(2, 3), ScriptedGenerator::succeeding());
        let story = StoryId::generate();
        let page_ids = f.pages.add_story(story, ["one", "two", "three"]).await;

        let ids = f.coordinator.enqueue_for_story(story).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(f.coordinator.scheduler().pending_count(), 3);
        for (id, page_id) in ids.iter().zip(&page_ids) {
            let record = f.tasks.get_by_id(*id).await.unwrap().unwrap();
            assert_eq!(record.task.status, TaskStatus::Scheduled);
            assert_eq!(
                f.coordinator.get_status(*page_id).await.unwrap(),
                Some(IllustrationStatus::Scheduled)
            );
        }

        // Opening the story again creates nothing new.
        assert!(f.coordinator.enqueue_for_story(story).await.unwrap().is_empty());
        assert_eq!(f.coordinator.scheduler().pending_count(), 3);
    }

    #[tokio::test]
    async fn lower_page_numbers_run_first() {
        let f = fixture(fast_config(1, 3), ScriptedGenerator::succeeding());
        let story = StoryId::generate();
        f.pages
            .add_story(story, ["p1", "p2", "p3", "p4", "p5", "p6"])
            .await;
        f.coordinator.enqueue_for_story(story).await.unwrap();
        f.coordinator.start().await.unwrap();
        wait_until_settled(&f.coordinator, story).await;
        f.coordinator.stop().await.unwrap();

        assert_eq!(f.generator.prompts(), vec!["p1", "p2", "p3", "p4", "p5", "p6"]);
        assert_eq!(f.generator.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn page_priorities_follow_page_numbers_and_failures_retry() {
        let generator = ScriptedGenerator::new([
            Ok(b"p1".to_vec()),
            Err(GenerationError::Transient("rate limited".into())),
        ]);
        let f = fixture(fast_config(1, 3), generator);
        let story = StoryId::generate();
        f.pages.add_story(story, ["p1", "p2", "p3", "p4", "p5"]).await;
        let mut events = f.coordinator.subscribe();

        let ids = f.coordinator.enqueue_for_story(story).await.unwrap();
        let mut priorities = Vec::new();
        for id in &ids {
            priorities.push(f.tasks.get_by_id(*id).await.unwrap().unwrap().task.priority);
        }
        assert_eq!(
            priorities,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Medium,
                Priority::Medium,
                Priority::Low
            ]
        );

        f.coordinator.start().await.unwrap();
        let status = wait_until_settled(&f.coordinator, story).await;
        f.coordinator.stop().await.unwrap();
        assert_eq!(status.ready, 5);

        let page_two: Vec<TaskStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| e.task_id == ids[1])
            .map(|e| e.status)
            .collect();
        assert!(page_two.contains(&TaskStatus::Retrying { attempt: 1 }));
        assert_eq!(page_two.last(), Some(&TaskStatus::Ready));
        let record = f.tasks.get_by_id(ids[1]).await.unwrap().unwrap();
        assert_eq!(record.task.attempt_count, 1);
        assert_eq!(f.generator.prompts()[..2], ["p1", "p2"]);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let generator = ScriptedGenerator::succeeding().with_latency(Duration::from_millis(20));
        let f = fixture(fast_config(2, 3), generator);
        let story = StoryId::generate();
        f.pages
            .add_story(story, (1..=8).map(|n| format!("page {n}")))
            .await;
        f.coordinator.enqueue_for_story(story).await.unwrap();
        f.coordinator.start().await.unwrap();
        let status = wait_until_settled(&f.coordinator, story).await;
        f.coordinator.stop().await.unwrap();

        assert_eq!(status.ready, 8);
        assert_eq!(f.generator.peak_concurrency(), 2);
    }

    /// Six pages, concurrency 2, page 4 fails transiently twice, and the
    /// process restarts part-way through.
    #[tokio::test]
    async fn end_to_end_with_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tasks.db");
        let story = StoryId::generate();
        let pages = Arc::new(InMemoryPageStore::new());
        let page_ids = pages
            .add_story(story, ["p1", "p2", "p3", "p4", "p5", "p6"])
            .await;
        let succeeding =
            Arc::new(ScriptedGenerator::succeeding().with_latency(Duration::from_millis(10)));
        let generator = Arc::new(FailPageTwice::new(succeeding.clone(), "p4"));

        let build = |tasks: Arc<dyn TaskStore>| {
            CoordinatorBuilder::new(fast_config(2, 5))
                .task_store(tasks)
                .page_store(pages.clone())
                .generator(generator.clone())
                .artifact_store(Arc::new(LocalArtifactStore::new(dir.path().join("art"))))
                .build()
                .unwrap()
        };

        // First process: enqueue, let some work finish, shut down.
        let first_ids = {
            let coordinator = build(Arc::new(SqliteTaskStore::open(&db).await.unwrap()));
            let ids = coordinator.enqueue_for_story(story).await.unwrap();
            coordinator.start().await.unwrap();
            tokio::time::timeout(Duration::from_secs(10), async {
                while coordinator.story_status(story).await.unwrap().ready < 2 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
            .await
            .unwrap();
            coordinator.stop().await.unwrap();
            ids
        };
        assert_eq!(first_ids.len(), 6);

        // Second process: restore from the same database and finish.
        let tasks: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&db).await.unwrap());
        let coordinator = build(Arc::clone(&tasks));
        let restored = coordinator.start().await.unwrap();
        assert!(restored <= 4);
        let status = wait_until_settled(&coordinator, story).await;
        coordinator.stop().await.unwrap();

        assert_eq!(status.ready, 6);
        assert_eq!(status.failed, 0);
        for (i, page_id) in page_ids.iter().enumerate() {
            let page = pages.page(*page_id).await.unwrap().unwrap();
            assert_eq!(page.illustration_status, IllustrationStatus::Ready, "page {}", i + 1);
            assert!(page.illustration_path.is_some());
        }

        let records = tasks.get_for_story(story).await.unwrap();
        let ids: Vec<TaskId> = records.iter().map(|r| r.task.id).collect();
        assert_eq!(ids, first_ids, "no task was duplicated or replaced");
        assert_eq!(records[3].task.attempt_count, 2);
        assert_eq!(generator.calls_for("p4"), 3);
        // Every page was generated successfully exactly once across both runs.
        assert_eq!(succeeding.call_count(), 6);
        assert!(coordinator.scheduler().is_empty());
    }

    /// Fails the first two calls for one prompt, delegates everything else.
    struct FailPageTwice {
        inner: Arc<ScriptedGenerator>,
        prompt: &'static str,
        failures: std::sync::Mutex<u32>,
        calls: std::sync::Mutex<u32>,
    }

    impl FailPageTwice {
        fn new(inner: Arc<ScriptedGenerator>, prompt: &'static str) -> Self {
            Self {
                inner,
                prompt,
                failures: std::sync::Mutex::new(0),
                calls: std::sync::Mutex::new(0),
            }
        }

        fn calls_for(&self, prompt: &str) -> u32 {
            assert_eq!(prompt, self.prompt);
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl crate::ports::IllustrationGenerator for FailPageTwice {
        async fn generate(
            &self,
            prompt: &str,
            context: &crate::ports::GenerationContext,
        ) -> Result<Vec<u8>, GenerationError> {
            if prompt == self.prompt {
                *self.calls.lock().unwrap() += 1;
                let mut failures = self.failures.lock().unwrap();
                if *failures < 2 {
                    *failures += 1;
                    return Err(GenerationError::Transient("rate limited".into()));
                }
            }
            self.inner.generate(prompt, context).await
        }
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_page_and_manual_retry_requeues() {
        let generator = ScriptedGenerator::new(
            (0..3).map(|_| Err(GenerationError::Transient("timeout".into()))),
        );
        let f = fixture(fast_config(1, 3), generator);
        let story = StoryId::generate();
        let page_ids = f.pages.add_story(story, ["only page"]).await;
        let mut events = f.coordinator.subscribe();

        let ids = f.coordinator.enqueue_for_story(story).await.unwrap();
        f.coordinator.start().await.unwrap();
        let status = wait_until_settled(&f.coordinator, story).await;
        assert_eq!(status.failed, 1);
        assert_eq!(
            f.coordinator.get_status(page_ids[0]).await.unwrap(),
            Some(IllustrationStatus::Failed)
        );
        let failed = f.tasks.get_by_id(ids[0]).await.unwrap().unwrap();
        assert_eq!(failed.task.attempt_count, 3);
        assert_eq!(f.generator.call_count(), 3);

        let mut retry_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event.status, TaskStatus::Retrying { .. }) {
                retry_events += 1;
            }
        }
        assert_eq!(retry_events, 2);

        let retry_id = f.coordinator.retry_page(page_ids[0]).await.unwrap();
        assert_ne!(retry_id, ids[0]);
        assert!(f.tasks.get_by_id(ids[0]).await.unwrap().is_none());
        let retried = f.tasks.get_by_id(retry_id).await.unwrap().unwrap();
        assert_eq!(retried.task.priority, Priority::Critical);
        assert_eq!(retried.task.attempt_count, 0);

        let status = wait_until_settled(&f.coordinator, story).await;
        f.coordinator.stop().await.unwrap();
        assert_eq!(status.ready, 1);
        assert_eq!(
            f.coordinator.get_status(page_ids[0]).await.unwrap(),
            Some(IllustrationStatus::Ready)
        );
    }

    #[tokio::test]
    async fn retry_rejects_pages_that_have_not_failed() {
        let f = fixture(fast_config(1, 3), ScriptedGenerator::succeeding());
        let story = StoryId::generate();
        let page_ids = f.pages.add_story(story, ["a"]).await;

        assert!(matches!(
            f.coordinator.retry_page(page_ids[0]).await,
            Err(IllustraError::PageNotFound(_))
        ));
        f.coordinator.enqueue_for_story(story).await.unwrap();
        assert!(matches!(
            f.coordinator.retry_page(page_ids[0]).await,
            Err(IllustraError::NotRetryable { .. })
        ));
    }

    #[tokio::test]
    async fn delete_story_drops_queued_work() {
        let f = fixture(fast_config(1, 3), ScriptedGenerator::succeeding());
        let story = StoryId::generate();
        let other = StoryId::generate();
        f.pages.add_story(story, ["a", "b", "c"]).await;
        f.pages.add_story(other, ["x"]).await;
        f.coordinator.enqueue_for_story(story).await.unwrap();
        f.coordinator.enqueue_for_story(other).await.unwrap();

        assert_eq!(f.coordinator.delete_story(story).await.unwrap(), 3);
        assert_eq!(f.coordinator.scheduler().pending_count(), 1);
        assert!(f.tasks.get_for_story(story).await.unwrap().is_empty());

        f.coordinator.start().await.unwrap();
        wait_until_settled(&f.coordinator, other).await;
        f.coordinator.stop().await.unwrap();
        assert_eq!(f.generator.prompts(), vec!["x"]);
    }

    #[tokio::test]
    async fn in_flight_result_of_deleted_story_is_dropped() {
        let generator = ScriptedGenerator::succeeding().with_latency(Duration::from_millis(300));
        let f = fixture(fast_config(1, 3), generator);
        let story = StoryId::generate();
        f.pages.add_story(story, ["a", "b", "c", "d"]).await;
        f.coordinator.enqueue_for_story(story).await.unwrap();
        f.coordinator.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.generator.call_count() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(f.coordinator.delete_story(story).await.unwrap(), 4);
        assert_eq!(f.coordinator.scheduler().pending_count(), 0);

        // The running call is not aborted; its result lands on nothing.
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.coordinator.scheduler().in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        f.coordinator.stop().await.unwrap();

        assert!(f.tasks.get_for_story(story).await.unwrap().is_empty());
        assert_eq!(f.generator.call_count(), 1);
        assert!(!f._dir.path().join(story.to_string()).exists());
    }

    #[tokio::test]
    async fn restored_tasks_put_their_pages_back_to_scheduled() {
        let generator = ScriptedGenerator::succeeding().with_latency(Duration::from_millis(200));
        let f = fixture(fast_config(1, 3), generator);
        let story = StoryId::generate();
        let page_ids = f.pages.add_story(story, ["first", "second"]).await;

        // State left behind by a run that died mid-generation.
        let mut ids = Vec::new();
        for (i, page_id) in page_ids.iter().enumerate() {
            let page_number = i as u32 + 1;
            let mut task = IllustrationTask::for_page(
                TaskId::generate(),
                story,
                *page_id,
                page_number,
                f.clock.now(),
            );
            task.status = TaskStatus::Generating;
            let context = TaskContext::new(page_number, 2, format!("page {page_number}"));
            f.tasks.save_task(&task, &context).await.unwrap();
            f.pages
                .set_page_status(*page_id, IllustrationStatus::Generating)
                .await
                .unwrap();
            ids.push(task.id);
        }

        assert_eq!(f.coordinator.start().await.unwrap(), 2);
        // Concurrency 1 and a slow first call keep page two queued.
        assert_eq!(
            f.coordinator.get_status(page_ids[1]).await.unwrap(),
            Some(IllustrationStatus::Scheduled)
        );
        let second = f.tasks.get_by_id(ids[1]).await.unwrap().unwrap();
        assert_eq!(second.task.status, TaskStatus::Pending);

        let status = wait_until_settled(&f.coordinator, story).await;
        f.coordinator.stop().await.unwrap();
        assert_eq!(status.ready, 2);
    }

    #[tokio::test]
    async fn delete_story_can_cancel_in_flight_generation() {
        let config = SchedulerConfig {
            cancel_in_flight_on_delete: true,
            ..fast_config(1, 3)
        };
        let generator = ScriptedGenerator::succeeding().with_latency(Duration::from_secs(30));
        let f = fixture(config, generator);
        let story = StoryId::generate();
        f.pages.add_story(story, ["slow"]).await;
        f.coordinator.enqueue_for_story(story).await.unwrap();
        f.coordinator.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.generator.call_count() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        f.coordinator.delete_story(story).await.unwrap();
        // stop() returns promptly because the 30s call was aborted.
        tokio::time::timeout(Duration::from_secs(5), f.coordinator.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(f.tasks.get_for_story(story).await.unwrap().is_empty());
        assert_eq!(f.coordinator.scheduler().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_toggle_is_idempotent() {
        let f = fixture(fast_config(1, 3), ScriptedGenerator::succeeding());
        f.coordinator.start().await.unwrap();
        assert!(matches!(f.coordinator.start().await, Err(IllustraError::AlreadyRunning)));

        f.coordinator.set_background_enabled(false).await.unwrap();
        f.coordinator.set_background_enabled(false).await.unwrap();
        assert!(!f.coordinator.is_running().await);
        assert!(matches!(f.coordinator.stop().await, Err(IllustraError::NotRunning)));

        f.coordinator.set_background_enabled(true).await.unwrap();
        assert!(f.coordinator.is_running().await);
        f.coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn global_reference_runs_first_and_feeds_pages() {
        let f = fixture(fast_config(1, 3), ScriptedGenerator::succeeding());
        let story = StoryId::generate();
        f.pages.add_story(story, ["p1", "p2"]).await;

        f.coordinator.enqueue_for_story(story).await.unwrap();
        let reference = f
            .coordinator
            .enqueue_global_reference(story, "the hero, a red fox")
            .await
            .unwrap();
        assert_eq!(
            f.coordinator
                .enqueue_global_reference(story, "the hero, a red fox")
                .await
                .unwrap(),
            reference
        );

        f.coordinator.start().await.unwrap();
        let status = wait_until_settled(&f.coordinator, story).await;
        f.coordinator.stop().await.unwrap();
        assert!(status.has_global_reference);
        assert_eq!(status.ready, 3);

        let calls = f.generator.calls();
        // Both are Critical; page 1 was queued first.
        assert_eq!(calls[0].0, "p1");
        assert_eq!(calls[1].0, "the hero, a red fox");
        assert!(calls[2].1.previous_artifact.is_some());
        assert!(f.pages.global_reference(story).await.is_some());
    }

    #[tokio::test]
    async fn prune_expired_uses_configured_retention() {
        let f = fixture(fast_config(1, 3), ScriptedGenerator::succeeding());
        let story = StoryId::generate();
        f.pages.add_story(story, ["a"]).await;
        f.coordinator.enqueue_for_story(story).await.unwrap();
        f.coordinator.start().await.unwrap();
        wait_until_settled(&f.coordinator, story).await;
        f.coordinator.stop().await.unwrap();

        assert_eq!(f.coordinator.prune_expired().await.unwrap(), 0);
        f.clock.advance(ChronoDuration::hours(73));
        assert_eq!(f.coordinator.prune_expired().await.unwrap(), 1);
        assert!(f.coordinator.story_tasks(story).await.unwrap().is_empty());
    }
}
