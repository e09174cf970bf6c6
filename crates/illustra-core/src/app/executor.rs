//! Executor - runs one admitted task to its next resting state.
//!
//! Flow for an admitted task:
//! 1. Reload the record; a vanished record (story deleted) is discarded.
//! 2. A record that already carries an artifact is finalized without calling
//!    the generator again.
//! 3. Persist Generating, mirror it to the page, call the generator.
//! 4. Success: store artifact, record path, then mark Ready.
//!    Failure: bump attempts and let the `Decider` pick Retrying or Failed.
//!
//! Store writes that return `None` mean the record was deleted mid-flight;
//! the result is dropped. Storage failures re-queue the task after a backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{
    Decider, Decision, IllustrationStatus, IllustrationTask, PersistedTaskRecord, StatusEvent,
    StoryId, TaskId, TaskStatus, TaskTarget,
};
use crate::error::IllustraError;
use crate::ports::{
    ArtifactStore, Clock, GenerationContext, IllustrationGenerator, PageStore, TaskStore,
};
use crate::queue::{Admission, Scheduler};

/// Where an execution left its task.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Ready { path: String },

    /// Transient failure; the task is back in the scheduler after `delay`.
    Retrying { attempt: u32, delay: Duration },

    Failed { reason: String },

    /// Bookkeeping failed; the task is back in the scheduler after `delay`
    /// with its stored state untouched.
    Requeued { delay: Duration },

    /// The generation call was aborted because the story was deleted.
    Cancelled,

    /// The record is gone or already terminal; nothing to do.
    Discarded,
}

/// Cancellation tokens of in-flight executions, keyed by task.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<TaskId, (StoryId, CancellationToken)>>>,
}

impl CancellationRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, (StoryId, CancellationToken)>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, task: &IllustrationTask) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(task.id, (task.story_id, token.clone()));
        token
    }

    pub fn release(&self, id: TaskId) {
        self.lock().remove(&id);
    }

    /// Cancel every in-flight execution of the story. Returns how many were signalled.
    pub fn cancel_story(&self, story_id: StoryId) -> usize {
        let tokens = self.lock();
        let mut cancelled = 0;
        for (owner, token) in tokens.values() {
            if *owner == story_id {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Executor {
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) pages: Arc<dyn PageStore>,
    pub(crate) generator: Arc<dyn IllustrationGenerator>,
    pub(crate) artifacts: Arc<dyn ArtifactStore>,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: broadcast::Sender<StatusEvent>,
    pub(crate) cancellations: CancellationRegistry,
    /// Delay before re-running a task whose bookkeeping write failed.
    pub(crate) persistence_backoff: Duration,
}

impl Executor {
    /// Execute an admitted task. Never fails: every error is logged and
    /// turned into an outcome, so the worker loop keeps going.
    pub async fn execute(&self, admission: Admission) -> ExecutionOutcome {
        let task = admission.task().clone();
        let token = self.cancellations.register(&task);
        debug!(
            task_id = %task.id,
            story_id = %task.story_id,
            priority = %task.priority,
            "executing task"
        );

        let result = self.run(&task, &token).await;
        self.cancellations.release(task.id);

        let (outcome, requeue) = match result {
            Ok(step) => step,
            Err(err) if err.is_persistence() || matches!(err, IllustraError::Artifact(_)) => {
                warn!(task_id = %task.id, error = %err, "storage failure, re-queueing task");
                let delay = self.persistence_backoff;
                (ExecutionOutcome::Requeued { delay }, Some(task.clone()))
            }
            Err(err) => {
                error!(task_id = %task.id, error = %err, "task execution aborted");
                (ExecutionOutcome::Discarded, None)
            }
        };

        // Free the slot before the task can become eligible again.
        drop(admission);
        if let Some(task) = requeue {
            let delay = match &outcome {
                ExecutionOutcome::Retrying { delay, .. }
                | ExecutionOutcome::Requeued { delay } => *delay,
                _ => Duration::ZERO,
            };
            self.scheduler.schedule_retry(task, delay);
        }
        outcome
    }

    async fn run(
        &self,
        admitted: &IllustrationTask,
        token: &CancellationToken,
    ) -> Result<(ExecutionOutcome, Option<IllustrationTask>), IllustraError> {
        let Some(record) = self.tasks.get_by_id(admitted.id).await? else {
            debug!(task_id = %admitted.id, "task record vanished, discarding");
            return Ok((ExecutionOutcome::Discarded, None));
        };

        if let Some(path) = record.illustration_path.clone() {
            return self.finish(&record.task, path).await.map(|o| (o, None));
        }
        if record.task.status.is_terminal() {
            debug!(task_id = %admitted.id, status = %record.task.status, "task already terminal");
            return Ok((ExecutionOutcome::Discarded, None));
        }

        let Some(mut task) = self.begin_generating(record.task.clone()).await? else {
            return Ok((ExecutionOutcome::Discarded, None));
        };

        let context = self.generation_context(&record).await?;
        let prompt = record.context.illustration_description.as_str();
        info!(
            task_id = %task.id,
            story_id = %task.story_id,
            page = record.context.page_number,
            attempt = task.attempt_count + 1,
            "generating illustration"
        );

        let generated = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(task_id = %task.id, story_id = %task.story_id, "generation cancelled");
                return Ok((ExecutionOutcome::Cancelled, None));
            }
            generated = self.generator.generate(prompt, &context) => generated,
        };

        match generated {
            Ok(bytes) => {
                if self.tasks.get_by_id(task.id).await?.is_none() {
                    debug!(task_id = %task.id, "story deleted during generation, dropping result");
                    return Ok((ExecutionOutcome::Discarded, None));
                }
                let path = self.artifacts.put(task.story_id, task.id, &bytes).await?;
                if self.tasks.update_illustration_path(task.id, &path).await?.is_none() {
                    debug!(task_id = %task.id, %path, "story deleted while storing artifact");
                    if let Err(err) = self.artifacts.remove(&path).await {
                        warn!(
                            task_id = %task.id,
                            %path,
                            error = %err,
                            "orphaned artifact not removed"
                        );
                    }
                    return Ok((ExecutionOutcome::Discarded, None));
                }
                self.finish(&task, path).await.map(|o| (o, None))
            }
            Err(gen_err) => {
                let Some(updated) = self.tasks.increment_attempt(task.id).await? else {
                    return Ok((ExecutionOutcome::Discarded, None));
                };
                task.attempt_count = updated.task.attempt_count;
                match self.decider.decide(task.attempt_count, &gen_err) {
                    Decision::Retry { attempt, delay } => {
                        let status = TaskStatus::Retrying { attempt };
                        if !self.persist_status(&mut task, status).await? {
                            return Ok((ExecutionOutcome::Discarded, None));
                        }
                        warn!(
                            task_id = %task.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %gen_err,
                            "generation failed, retrying"
                        );
                        Ok((ExecutionOutcome::Retrying { attempt, delay }, Some(task)))
                    }
                    Decision::MarkFailed { reason } => {
                        let status = TaskStatus::Failed {
                            reason: reason.clone(),
                        };
                        if !self.persist_status(&mut task, status).await? {
                            return Ok((ExecutionOutcome::Discarded, None));
                        }
                        if let TaskTarget::Page(page_id) = task.target {
                            self.pages
                                .set_page_status(page_id, IllustrationStatus::Failed)
                                .await?;
                        }
                        error!(
                            task_id = %task.id,
                            story_id = %task.story_id,
                            %reason,
                            "illustration failed"
                        );
                        Ok((ExecutionOutcome::Failed { reason }, None))
                    }
                }
            }
        }
    }

    /// Walk Pending/Scheduled/Retrying to Generating, persisting each step.
    /// A stored Generating (re-run after a storage failure) is resumed as is.
    async fn begin_generating(
        &self,
        mut task: IllustrationTask,
    ) -> Result<Option<IllustrationTask>, IllustraError> {
        if task.status == TaskStatus::Pending
            && !self.persist_status(&mut task, TaskStatus::Scheduled).await?
        {
            return Ok(None);
        }
        if task.status != TaskStatus::Generating
            && !self.persist_status(&mut task, TaskStatus::Generating).await?
        {
            return Ok(None);
        }
        if let TaskTarget::Page(page_id) = task.target {
            self.pages
                .set_page_status(page_id, IllustrationStatus::Generating)
                .await?;
        }
        Ok(Some(task))
    }

    /// Apply a checked transition and persist it. Returns false when the
    /// record no longer exists.
    async fn persist_status(
        &self,
        task: &mut IllustrationTask,
        next: TaskStatus,
    ) -> Result<bool, IllustraError> {
        task.transition(next, self.clock.now())?;
        if self.tasks.update_status(task.id, &task.status).await?.is_none() {
            debug!(task_id = %task.id, "task record vanished during update");
            return Ok(false);
        }
        self.publish(task);
        Ok(true)
    }

    /// Mark Ready (if not already) and mirror the artifact to the page or story.
    async fn finish(
        &self,
        task: &IllustrationTask,
        path: String,
    ) -> Result<ExecutionOutcome, IllustraError> {
        let mut task = task.clone();
        if task.status != TaskStatus::Ready {
            if task.status != TaskStatus::Generating {
                // Artifact exists but the Ready write was lost.
                task.status = TaskStatus::Generating;
            }
            if !self.persist_status(&mut task, TaskStatus::Ready).await? {
                return Ok(ExecutionOutcome::Discarded);
            }
        }
        match task.target {
            TaskTarget::Page(page_id) => {
                self.pages.set_page_artifact(page_id, &path).await?;
                self.pages
                    .set_page_status(page_id, IllustrationStatus::Ready)
                    .await?;
            }
            TaskTarget::GlobalReference => {
                self.pages.set_global_reference(task.story_id, &path).await?;
            }
        }
        info!(task_id = %task.id, story_id = %task.story_id, %path, "illustration ready");
        Ok(ExecutionOutcome::Ready { path })
    }

    /// Previous artifact: the record's own, else the story's finished
    /// global reference (pages only).
    async fn generation_context(
        &self,
        record: &PersistedTaskRecord,
    ) -> Result<GenerationContext, IllustraError> {
        let is_global_reference = record.task.is_global_reference();
        let mut previous_artifact = record.context.previous_illustration_path.clone();
        if previous_artifact.is_none() && !is_global_reference {
            previous_artifact = self
                .tasks
                .get_for_story(record.task.story_id)
                .await?
                .into_iter()
                .find(|r| r.task.is_global_reference() && r.task.status == TaskStatus::Ready)
                .and_then(|r| r.illustration_path);
        }
        Ok(GenerationContext {
            page_number: record.context.page_number,
            total_pages: record.context.total_pages,
            previous_artifact,
            is_global_reference,
        })
    }

    fn publish(&self, task: &IllustrationTask) {
        // No subscribers is fine.
        let _ = self.events.send(StatusEvent {
            task_id: task.id,
            story_id: task.story_id,
            page_id: task.page_id(),
            status: task.status.clone(),
        });
    }
}
