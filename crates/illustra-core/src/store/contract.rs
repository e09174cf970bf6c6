//! Behaviour every `TaskStore` must share. Each store's test module runs
//! these against its own implementation.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::domain::{IllustrationTask, PageId, StoryId, TaskContext, TaskId, TaskStatus};
use crate::ports::{FixedClock, TaskStore};
use crate::queue::Scheduler;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(secs)
}

fn page_task(
    story_id: StoryId,
    page_number: u32,
    created_secs: i64,
) -> (IllustrationTask, TaskContext) {
    let task = IllustrationTask::for_page(
        TaskId::generate(),
        story_id,
        PageId::generate(),
        page_number,
        at(created_secs),
    );
    let context = TaskContext::new(page_number, 8, format!("page {page_number}"));
    (task, context)
}

async fn save_with_status<S: TaskStore>(
    store: &S,
    mut task: IllustrationTask,
    context: &TaskContext,
    status: TaskStatus,
) -> IllustrationTask {
    task.status = status;
    store.save_task(&task, context).await.unwrap();
    task
}

pub async fn upsert_is_idempotent<S: TaskStore>(store: &S) {
    let story = StoryId::generate();
    let (mut task, context) = page_task(story, 2, 0);
    store.save_task(&task, &context).await.unwrap();

    task.status = TaskStatus::Scheduled;
    task.attempt_count = 3;
    task.last_updated_at = at(30);
    let context = context.with_previous_illustration("artifacts/prev.png");
    let saved = store.save_task(&task, &context).await.unwrap();

    assert_eq!(saved.task.attempt_count, 3);
    let all = store.get_for_story(story).await.unwrap();
    assert_eq!(all.len(), 1);
    let stored = &all[0];
    assert_eq!(stored.task.id, task.id);
    assert_eq!(stored.task.status, TaskStatus::Scheduled);
    assert_eq!(stored.task.attempt_count, 3);
    assert_eq!(stored.task.created_at, at(0));
    assert_eq!(stored.task.last_updated_at, at(30));
    assert_eq!(
        stored.context.previous_illustration_path.as_deref(),
        Some("artifacts/prev.png")
    );
}

pub async fn pending_is_ordered_by_priority_then_creation<S: TaskStore>(store: &S) {
    let story = StoryId::generate();
    let (late_low, ctx_late_low) = page_task(story, 7, 0);
    let (medium, ctx_medium) = page_task(story, 3, 10);
    let (critical, ctx_critical) = page_task(story, 1, 20);
    let (first_high, ctx_first_high) = page_task(story, 2, 5);
    let (second_high, ctx_second_high) = page_task(story, 2, 5);
    let (done, ctx_done) = page_task(story, 1, 0);

    store.save_task(&late_low, &ctx_late_low).await.unwrap();
    store.save_task(&medium, &ctx_medium).await.unwrap();
    store.save_task(&critical, &ctx_critical).await.unwrap();
    store.save_task(&first_high, &ctx_first_high).await.unwrap();
    store.save_task(&second_high, &ctx_second_high).await.unwrap();
    save_with_status(store, done, &ctx_done, TaskStatus::Ready).await;

    let ids: Vec<TaskId> = store
        .get_all_pending()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.task.id)
        .collect();
    assert_eq!(
        ids,
        vec![critical.id, first_high.id, second_high.id, medium.id, late_low.id]
    );
}

pub async fn updates_to_unknown_ids_return_none<S: TaskStore>(store: &S) {
    let missing = TaskId::generate();
    assert!(store
        .update_status(missing, &TaskStatus::Generating)
        .await
        .unwrap()
        .is_none());
    assert!(store.increment_attempt(missing).await.unwrap().is_none());
    assert!(store
        .update_illustration_path(missing, "artifacts/x.png")
        .await
        .unwrap()
        .is_none());
    assert!(!store.delete_task(missing).await.unwrap());
    assert!(store.get_by_id(missing).await.unwrap().is_none());
}

pub async fn restore_resets_in_flight_markers<S: TaskStore>(store: &S) {
    let story = StoryId::generate();
    let statuses = [
        TaskStatus::Pending,
        TaskStatus::Scheduled,
        TaskStatus::Generating,
        TaskStatus::Retrying { attempt: 2 },
        TaskStatus::Ready,
        TaskStatus::Failed {
            reason: "content policy".into(),
        },
    ];
    let mut saved = Vec::new();
    for (i, status) in statuses.into_iter().enumerate() {
        let (task, context) = page_task(story, i as u32 + 1, i as i64);
        saved.push(save_with_status(store, task, &context, status).await);
    }

    let scheduler = Scheduler::new(2);
    assert_eq!(store.restore_into(&scheduler).await.unwrap(), 4);
    assert_eq!(scheduler.pending_count(), 4);

    for task in &saved[..4] {
        let record = store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(record.task.status, TaskStatus::Pending);
        assert!(scheduler.contains(task.id));
    }
    for task in &saved[4..] {
        let record = store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(record.task.status, task.status);
        assert!(!scheduler.contains(task.id));
    }

    // A second restore queues nothing new.
    assert_eq!(store.restore_into(&scheduler).await.unwrap(), 0);
    assert_eq!(scheduler.pending_count(), 4);
}

pub async fn story_queries_and_deletion<S: TaskStore>(store: &S) {
    let story = StoryId::generate();
    let other = StoryId::generate();

    let (page3, ctx3) = page_task(story, 3, 0);
    let (page1, ctx1) = page_task(story, 1, 1);
    let (page2, ctx2) = page_task(story, 2, 2);
    let reference = IllustrationTask::global_reference(TaskId::generate(), story, at(3));
    let ctx_reference = TaskContext::new(0, 3, "main character");
    let (unrelated, ctx_unrelated) = page_task(other, 1, 0);

    for (task, ctx) in [
        (&page3, &ctx3),
        (&page1, &ctx1),
        (&page2, &ctx2),
        (&reference, &ctx_reference),
        (&unrelated, &ctx_unrelated),
    ] {
        store.save_task(task, ctx).await.unwrap();
    }

    let ids: Vec<TaskId> = store
        .get_for_story(story)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.task.id)
        .collect();
    assert_eq!(ids, vec![reference.id, page1.id, page2.id, page3.id]);

    // A newer task for the same page shadows the older one.
    let page1_id = page1.page_id().unwrap();
    let newer = IllustrationTask::for_page(TaskId::generate(), story, page1_id, 1, at(60));
    store.save_task(&newer, &ctx1).await.unwrap();
    let latest = store.get_for_page(page1_id).await.unwrap().unwrap();
    assert_eq!(latest.task.id, newer.id);

    let path = store
        .update_illustration_path(page2.id, "artifacts/p2.png")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(path.illustration_path.as_deref(), Some("artifacts/p2.png"));

    let bumped = store.increment_attempt(page2.id).await.unwrap().unwrap();
    assert_eq!(bumped.task.attempt_count, 1);

    assert!(store.delete_task(page3.id).await.unwrap());
    assert_eq!(store.delete_all_for_story(story).await.unwrap(), 4);
    assert!(store.get_for_story(story).await.unwrap().is_empty());
    assert_eq!(store.get_for_story(other).await.unwrap().len(), 1);
}

pub async fn prune_only_removes_old_terminal_records<S: TaskStore>(
    store: &S,
    clock: &Arc<FixedClock>,
) {
    let story = StoryId::generate();
    let (old_ready, ctx1) = page_task(story, 1, 0);
    let (old_failed, ctx2) = page_task(story, 2, 0);
    let (old_pending, ctx3) = page_task(story, 3, 0);
    let (recent, ctx4) = page_task(story, 4, 0);

    save_with_status(store, old_ready, &ctx1, TaskStatus::Ready).await;
    save_with_status(
        store,
        old_failed,
        &ctx2,
        TaskStatus::Failed {
            reason: "gave up".into(),
        },
    )
    .await;
    let old_pending = save_with_status(store, old_pending, &ctx3, TaskStatus::Pending).await;
    let recent = save_with_status(store, recent, &ctx4, TaskStatus::Generating).await;

    clock.advance(Duration::hours(10));
    store.update_status(recent.id, &TaskStatus::Ready).await.unwrap();

    assert_eq!(store.prune_terminal(at(0) + Duration::hours(5)).await.unwrap(), 2);
    let left: Vec<TaskId> = store
        .get_for_story(story)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.task.id)
        .collect();
    assert_eq!(left, vec![old_pending.id, recent.id]);
}
