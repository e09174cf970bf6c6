//! In-memory priority queue and concurrency gate.
//!
//! The queue is a derived cache of the task store: it can always be rebuilt
//! from the store's non-terminal records (see `TaskStore::restore_into`).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::domain::{IllustrationTask, Priority, StoryId, TaskId};

/// Ready queue entry.
#[derive(Debug, Clone)]
struct QueuedTask {
    seq: u64,
    task: IllustrationTask,
}

impl QueuedTask {
    fn key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.task.priority, self.task.created_at, self.seq)
    }
}

/// Backoff entry. Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone)]
struct DelayedTask {
    due: Instant,
    seq: u64,
    task: IllustrationTask,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    /// Sorted by (priority, created_at, seq).
    ready: VecDeque<QueuedTask>,

    /// Tasks waiting out a retry backoff.
    delayed: BinaryHeap<DelayedTask>,

    /// Tasks currently held by an `Admission`.
    in_flight: HashMap<TaskId, StoryId>,

    /// Admission sequence; breaks ties between equal keys in insertion order.
    next_seq: u64,
}

impl SchedulerState {
    fn contains(&self, id: TaskId) -> bool {
        self.in_flight.contains_key(&id)
            || self.ready.iter().any(|q| q.task.id == id)
            || self.delayed.iter().any(|d| d.task.id == id)
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Stable insert: the new entry goes after every entry with a key <= its own.
    fn insert_ready(&mut self, entry: QueuedTask) {
        let key = entry.key();
        let at = self.ready.partition_point(|q| q.key() <= key);
        self.ready.insert(at, entry);
    }

    /// Move backoff entries whose time has come into the ready queue.
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.insert_ready(QueuedTask {
                    seq: entry.seq,
                    task: entry.task,
                });
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.due)
    }

    fn remove(&mut self, id: TaskId) -> bool {
        let before = self.ready.len() + self.delayed.len();
        self.ready.retain(|q| q.task.id != id);
        self.delayed.retain(|d| d.task.id != id);
        before != self.ready.len() + self.delayed.len()
    }
}

/// Priority queue plus admission control.
///
/// Design:
/// - `ready` is ordered by priority, then creation time, then admission order.
/// - A task is removed from the queue before it runs, so only one worker can
///   hold it.
/// - At most `concurrency_limit` admissions exist at any time.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
    gate: Arc<Semaphore>,
    concurrency_limit: usize,
}

impl Scheduler {
    pub fn new(concurrency_limit: usize) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        Self {
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
            gate: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
        }
    }

    // No await happens while the guard is held, so a poisoned lock only means a
    // panic elsewhere; the state itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a task. Returns false (and changes nothing) if a task with the
    /// same id is already queued, backing off, or in flight.
    pub fn add_task(&self, task: IllustrationTask) -> bool {
        {
            let mut state = self.lock();
            if state.contains(task.id) {
                return false;
            }
            let seq = state.allocate_seq();
            state.insert_ready(QueuedTask { seq, task });
        }
        self.notify.notify_one();
        true
    }

    /// Remove and return the highest-priority ready task.
    pub fn next_task(&self) -> Option<IllustrationTask> {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        state.ready.pop_front().map(|q| q.task)
    }

    /// Put a task back after `delay`. Used for retry backoff and for
    /// re-running a task whose bookkeeping write failed.
    pub fn schedule_retry(&self, task: IllustrationTask, delay: Duration) -> bool {
        {
            let mut state = self.lock();
            if state.ready.iter().any(|q| q.task.id == task.id)
                || state.delayed.iter().any(|d| d.task.id == task.id)
            {
                return false;
            }
            let seq = state.allocate_seq();
            state.delayed.push(DelayedTask {
                due: Instant::now() + delay,
                seq,
                task,
            });
        }
        // Wake a waiting admit so it re-arms its timer on the new due time.
        self.notify.notify_one();
        true
    }

    /// Cancel a queued or backing-off task. In-flight tasks are not affected.
    pub fn remove_task(&self, id: TaskId) -> bool {
        self.lock().remove(id)
    }

    /// Drop every queued or backing-off task of a story; returns the removed ids.
    pub fn remove_story(&self, story_id: StoryId) -> Vec<TaskId> {
        let mut state = self.lock();
        let mut removed: Vec<TaskId> = state
            .ready
            .iter()
            .filter(|q| q.task.story_id == story_id)
            .map(|q| q.task.id)
            .collect();
        removed.extend(
            state
                .delayed
                .iter()
                .filter(|d| d.task.story_id == story_id)
                .map(|d| d.task.id),
        );
        state.ready.retain(|q| q.task.story_id != story_id);
        state.delayed.retain(|d| d.task.story_id != story_id);
        removed
    }

    /// Queued plus backing-off tasks.
    pub fn pending_count(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().contains(id)
    }

    /// Wait for a free slot and the next eligible task.
    ///
    /// Cancel-safe: the task is only taken out of the queue in the same
    /// synchronous step that returns it. Returns `None` only if the gate was
    /// closed.
    pub async fn admit(self: &Arc<Self>) -> Option<Admission> {
        let permit = Arc::clone(&self.gate).acquire_owned().await.ok()?;
        loop {
            let next_wake = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(entry) = state.ready.pop_front() {
                    state.in_flight.insert(entry.task.id, entry.task.story_id);
                    return Some(Admission {
                        task: entry.task,
                        scheduler: Arc::clone(self),
                        _permit: permit,
                    });
                }
                state.next_due()
            };

            match next_wake {
                Some(due) => {
                    tokio::select! {
                        _ = self.notify.notified() => {},
                        _ = tokio::time::sleep_until(due.into()) => {},
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn release(&self, id: TaskId) {
        self.lock().in_flight.remove(&id);
    }
}

/// Exclusive right to execute one task. Dropping it frees the slot.
pub struct Admission {
    task: IllustrationTask,
    scheduler: Arc<Scheduler>,
    _permit: OwnedSemaphorePermit,
}

impl Admission {
    pub fn task(&self) -> &IllustrationTask {
        &self.task
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.scheduler.release(self.task.id);
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").field("task", &self.task.id).finish()
    }
}
