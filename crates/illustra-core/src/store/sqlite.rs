//! SQLite-backed task store.
//!
//! All statements run on tokio-rusqlite's single background thread, so
//! writes are serialized and two writers can never interleave on one row.
//! Timestamps are stored as fixed-width RFC 3339 strings (UTC, microseconds)
//! so lexical order equals chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::domain::{
    IllustrationTask, PageId, PersistedTaskRecord, Priority, StoryId, TaskContext, TaskId,
    TaskStatus, TaskTarget,
};
use crate::error::IllustraError;
use crate::ports::{Clock, SystemClock, TaskStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS illustration_tasks (
    id                          TEXT PRIMARY KEY NOT NULL,
    story_id                    TEXT NOT NULL,
    page_id                     TEXT,
    priority                    INTEGER NOT NULL,
    status                      TEXT NOT NULL,
    retry_attempt               INTEGER,
    failure_reason              TEXT,
    attempt_count               INTEGER NOT NULL DEFAULT 0,
    page_number                 INTEGER NOT NULL,
    total_pages                 INTEGER NOT NULL,
    illustration_description    TEXT NOT NULL,
    previous_illustration_path  TEXT,
    illustration_path           TEXT,
    created_at                  TEXT NOT NULL,
    last_updated_at             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_illustration_tasks_status
    ON illustration_tasks (status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_illustration_tasks_story
    ON illustration_tasks (story_id);
CREATE INDEX IF NOT EXISTS idx_illustration_tasks_page
    ON illustration_tasks (page_id);
";

const COLUMNS: &str = "id, story_id, page_id, priority, status, retry_attempt, failure_reason, \
    attempt_count, page_number, total_pages, illustration_description, \
    previous_illustration_path, illustration_path, created_at, last_updated_at";

fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> IllustraError {
    IllustraError::persistence(e)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PersistedTaskRecord> {
    let id: String = row.get(0)?;
    let id = TaskId::parse(&id).map_err(|e| conversion_err(0, e))?;
    let story_id: String = row.get(1)?;
    let story_id = StoryId::parse(&story_id).map_err(|e| conversion_err(1, e))?;
    let target = match row.get::<_, Option<String>>(2)? {
        Some(page_id) => {
            TaskTarget::Page(PageId::parse(&page_id).map_err(|e| conversion_err(2, e))?)
        }
        None => TaskTarget::GlobalReference,
    };
    let priority: u8 = row.get(3)?;
    let priority = Priority::from_ordinal(priority)
        .ok_or_else(|| conversion_err(3, format!("unknown priority {priority}")))?;
    let kind: String = row.get(4)?;
    let status = TaskStatus::from_parts(&kind, row.get(5)?, row.get(6)?)
        .ok_or_else(|| conversion_err(4, format!("unknown status {kind}")))?;

    let task = IllustrationTask {
        id,
        story_id,
        target,
        priority,
        status,
        created_at: parse_timestamp(row, 13)?,
        last_updated_at: parse_timestamp(row, 14)?,
        attempt_count: row.get(7)?,
    };
    let context = TaskContext {
        page_number: row.get(8)?,
        total_pages: row.get(9)?,
        illustration_description: row.get(10)?,
        previous_illustration_path: row.get(11)?,
    };
    Ok(PersistedTaskRecord {
        task,
        context,
        illustration_path: row.get(12)?,
    })
}

fn select_by_id(
    conn: &rusqlite::Connection,
    id: &str,
) -> rusqlite::Result<Option<PersistedTaskRecord>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM illustration_tasks WHERE id = ?1"),
        params![id],
        row_to_record,
    )
    .optional()
}

/// Run an UPDATE by id and read the row back. `None` when no row matched.
fn update_and_fetch(
    conn: &rusqlite::Connection,
    sql: &str,
    id: &str,
    values: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Option<PersistedTaskRecord>> {
    let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&id];
    bound.extend_from_slice(values);
    if conn.execute(sql, bound.as_slice())? == 0 {
        return Ok(None);
    }
    select_by_id(conn, id)
}

pub struct SqliteTaskStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    /// Open (or create) the task database at `path` in WAL mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IllustraError> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(IllustraError::persistence)?;
        Self::init(conn, Arc::new(SystemClock)).await
    }

    pub async fn open_in_memory() -> Result<Self, IllustraError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(IllustraError::persistence)?;
        Self::init(conn, Arc::new(SystemClock)).await
    }

    /// Replace the clock used for `last_updated_at` on partial updates.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, IllustraError> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;
        debug!("illustration task schema ready");
        Ok(Self { conn, clock })
    }

    /// Close the background connection, flushing the WAL.
    pub async fn close(self) -> Result<(), IllustraError> {
        self.conn.close().await.map_err(map_tr_err)
    }

    fn now(&self) -> String {
        timestamp(self.clock.now())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save_task(
        &self,
        task: &IllustrationTask,
        context: &TaskContext,
    ) -> Result<PersistedTaskRecord, IllustraError> {
        let id = task.id.to_key();
        let story_id = task.story_id.to_key();
        let page_id = task.page_id().map(|p| p.to_key());
        let priority = task.priority.ordinal();
        let kind = task.status.kind_str();
        let retry_attempt = task.status.retry_attempt();
        let failure_reason = task.status.failure_reason().map(str::to_string);
        let attempt_count = task.attempt_count;
        let created_at = timestamp(task.created_at);
        let last_updated_at = timestamp(task.last_updated_at);
        let context = context.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO illustration_tasks ({COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?14) \
                         ON CONFLICT(id) DO UPDATE SET \
                            status = excluded.status, \
                            retry_attempt = excluded.retry_attempt, \
                            failure_reason = excluded.failure_reason, \
                            attempt_count = excluded.attempt_count, \
                            page_number = excluded.page_number, \
                            total_pages = excluded.total_pages, \
                            illustration_description = excluded.illustration_description, \
                            previous_illustration_path = excluded.previous_illustration_path, \
                            last_updated_at = excluded.last_updated_at"
                    ),
                    params![
                        id,
                        story_id,
                        page_id,
                        priority,
                        kind,
                        retry_attempt,
                        failure_reason,
                        attempt_count,
                        context.page_number,
                        context.total_pages,
                        context.illustration_description,
                        context.previous_illustration_path,
                        created_at,
                        last_updated_at,
                    ],
                )?;
                select_by_id(conn, &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: &TaskStatus,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let id = id.to_key();
        let kind = status.kind_str();
        let retry_attempt = status.retry_attempt();
        let failure_reason = status.failure_reason().map(str::to_string);
        let now = self.now();
        self.conn
            .call(move |conn| {
                update_and_fetch(
                    conn,
                    "UPDATE illustration_tasks \
                     SET status = ?2, retry_attempt = ?3, failure_reason = ?4, last_updated_at = ?5 \
                     WHERE id = ?1",
                    &id,
                    params![kind, retry_attempt, failure_reason, now],
                )
            })
            .await
            .map_err(map_tr_err)
    }

    async fn increment_attempt(
        &self,
        id: TaskId,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let id = id.to_key();
        let now = self.now();
        self.conn
            .call(move |conn| {
                update_and_fetch(
                    conn,
                    "UPDATE illustration_tasks \
                     SET attempt_count = attempt_count + 1, last_updated_at = ?2 \
                     WHERE id = ?1",
                    &id,
                    params![now],
                )
            })
            .await
            .map_err(map_tr_err)
    }

    async fn update_illustration_path(
        &self,
        id: TaskId,
        path: &str,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let id = id.to_key();
        let path = path.to_string();
        let now = self.now();
        self.conn
            .call(move |conn| {
                update_and_fetch(
                    conn,
                    "UPDATE illustration_tasks \
                     SET illustration_path = ?2, last_updated_at = ?3 \
                     WHERE id = ?1",
                    &id,
                    params![path, now],
                )
            })
            .await
            .map_err(map_tr_err)
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, IllustraError> {
        let id = id.to_key();
        self.conn
            .call(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM illustration_tasks WHERE id = ?1", params![id])?;
                Ok(deleted > 0)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn delete_all_for_story(&self, story_id: StoryId) -> Result<usize, IllustraError> {
        let story_id = story_id.to_key();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM illustration_tasks WHERE story_id = ?1",
                    params![story_id],
                )
            })
            .await
            .map_err(map_tr_err)
    }

    async fn get_all_pending(&self) -> Result<Vec<PersistedTaskRecord>, IllustraError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM illustration_tasks \
                     WHERE status IN ('pending', 'scheduled', 'generating', 'retrying') \
                     ORDER BY priority ASC, created_at ASC, rowid ASC"
                ))?;
                let records = stmt
                    .query_map([], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let id = id.to_key();
        self.conn
            .call(move |conn| select_by_id(conn, &id))
            .await
            .map_err(map_tr_err)
    }

    async fn get_for_page(
        &self,
        page_id: PageId,
    ) -> Result<Option<PersistedTaskRecord>, IllustraError> {
        let page_id = page_id.to_key();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM illustration_tasks WHERE page_id = ?1 \
                         ORDER BY created_at DESC, rowid DESC LIMIT 1"
                    ),
                    params![page_id],
                    row_to_record,
                )
                .optional()
            })
            .await
            .map_err(map_tr_err)
    }

    async fn get_for_story(
        &self,
        story_id: StoryId,
    ) -> Result<Vec<PersistedTaskRecord>, IllustraError> {
        let story_id = story_id.to_key();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM illustration_tasks WHERE story_id = ?1 \
                     ORDER BY page_id IS NOT NULL, page_number ASC, rowid ASC"
                ))?;
                let records = stmt
                    .query_map(params![story_id], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, IllustraError> {
        let cutoff = timestamp(older_than);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM illustration_tasks \
                     WHERE status IN ('ready', 'failed') AND last_updated_at < ?1",
                    params![cutoff],
                )
            })
            .await
            .map_err(map_tr_err)
    }
}
