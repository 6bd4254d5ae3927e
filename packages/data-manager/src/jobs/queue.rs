//! Durable FIFO of tasks pending execution.
//!
//! The queue is a single table used as a scheduling surface; a task's state
//! remains the single source of truth, queue presence is an optimisation
//! hint. Dequeueing is the one place the scheduler depends on row-level
//! locking: the selection, removal and return of the next entry happen in a
//! single statement so that concurrent consumers never receive the same task
//! and a rolled-back consumer leaves the entry visible to the next one.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::Row;
use tracing::debug;

use super::ops::JobOperations;
use super::task::Task;
use crate::error::{conflict_or_storage, Error, Result};
use crate::store::Store;
use crate::transaction::Transaction;

/// A pending entry in the task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueueEntry {
    pub id: i64,
    pub job_id: String,
    pub task_name: String,
    pub queue_time: NaiveDateTime,
}

/// Selects the oldest entry not already claimed by a concurrent consumer,
/// removes it, and returns it, all in one statement. `SKIP LOCKED` keeps
/// consumers from blocking behind each other.
const DEQUEUE_SQL: &str = r#"
DELETE FROM task_queue
WHERE id = (
    SELECT id FROM task_queue
    ORDER BY queue_time, id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING job_id, task_name
"#;

/// Queue operations for pending tasks.
#[async_trait]
pub trait TaskQueueOperations {
    /// Add a task to the back of the queue. At most one entry may be
    /// outstanding per `(job, name)`.
    async fn queue_task(&mut self, job_id: &str, task_name: &str) -> Result<()>;

    /// Remove every queue entry.
    async fn clear_task_queue(&mut self) -> Result<u64>;

    /// Snapshot of the queue in dequeue order.
    async fn queued_entries(&mut self) -> Result<Vec<TaskQueueEntry>>;

    /// Atomically dequeue the next pending task and return it.
    ///
    /// Concurrent consumers each receive a distinct task; if the consumer
    /// rolls back instead of committing, the entry becomes visible again.
    /// Entries whose task no longer exists (the job was deleted while
    /// queued) are discarded and the scan continues. Returns `None` once the
    /// queue is empty.
    async fn get_next_task(&mut self) -> Result<Option<Task>>;
}

#[async_trait]
impl TaskQueueOperations for Transaction {
    async fn queue_task(&mut self, job_id: &str, task_name: &str) -> Result<()> {
        sqlx::query("INSERT INTO task_queue (job_id, task_name, queue_time) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(task_name)
            .bind(Store::encode_datetime(Some(Utc::now().naive_utc())))
            .execute(self.conn())
            .await
            .map_err(|e| conflict_or_storage(e, "queue entry", format!("{job_id}/{task_name}")))?;
        Ok(())
    }

    async fn clear_task_queue(&mut self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_queue")
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected())
    }

    async fn queued_entries(&mut self) -> Result<Vec<TaskQueueEntry>> {
        let rows = sqlx::query("SELECT * FROM task_queue ORDER BY queue_time, id")
            .fetch_all(self.conn())
            .await?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let queue_time = Store::decode_datetime(&row.try_get::<String, _>("queue_time")?)?
                    .ok_or_else(|| Error::Corrupt(format!("queue entry {id} has no queue time")))?;
                Ok(TaskQueueEntry {
                    id,
                    job_id: row.try_get("job_id")?,
                    task_name: row.try_get("task_name")?,
                    queue_time,
                })
            })
            .collect()
    }

    async fn get_next_task(&mut self) -> Result<Option<Task>> {
        loop {
            let Some(row) = sqlx::query(DEQUEUE_SQL)
                .fetch_optional(self.conn())
                .await?
            else {
                return Ok(None);
            };

            let job_id: String = row.try_get("job_id")?;
            let task_name: String = row.try_get("task_name")?;

            match self.get_task(&job_id, &task_name).await? {
                Some(task) => return Ok(Some(task)),
                None => {
                    // Stale token: the job went away while queued. The entry
                    // is already deleted, move on to the next one.
                    debug!(job_id = %job_id, task_name = %task_name, "discarded stale queue entry");
                }
            }
        }
    }
}
