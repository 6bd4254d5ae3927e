//! Job and task repository operations.
//!
//! Every method runs against a [`Transaction`] and never commits by itself;
//! the caller decides commit versus rollback once, for all the work done on
//! the transaction.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

use super::job::{Job, JobState};
use super::task::{Task, TaskState};
use crate::error::{conflict_or_storage, Result};
use crate::store::Store;
use crate::transaction::Transaction;

/// One row of the job/task state summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSummary {
    pub kind: String,
    pub state: String,
    pub count: i64,
}

/// CRUD and queries for jobs and tasks.
#[async_trait]
pub trait JobOperations {
    /// Insert a new job. Fails with a conflict if the id already exists.
    async fn create_job(&mut self, job: &Job) -> Result<()>;

    /// Write a job's mutable columns back by id.
    async fn update_job(&mut self, job: &Job) -> Result<()>;

    /// Insert a new task. Fails with a conflict if `(job, name)` exists.
    async fn create_task(&mut self, task: &Task) -> Result<()>;

    /// Write a task's mutable columns back by `(job, name)`.
    async fn update_task(&mut self, task: &Task) -> Result<()>;

    async fn exists_job(&mut self, job_id: &str) -> Result<bool>;

    async fn get_job(&mut self, job_id: &str) -> Result<Option<Job>>;

    /// All jobs, optionally restricted to the given states, ordered by
    /// submission time.
    async fn list_jobs(&mut self, states: Option<&[JobState]>) -> Result<Vec<Job>>;

    /// All jobs for one submitter, ordered by submission time.
    async fn list_jobs_by_submitter(&mut self, submitter_id: &str) -> Result<Vec<Job>>;

    async fn get_task(&mut self, job_id: &str, task_name: &str) -> Result<Option<Task>>;

    /// All tasks belonging to one job.
    async fn list_job_tasks(&mut self, job_id: &str) -> Result<Vec<Task>>;

    /// `(task, submitter_id, job_state)` triples, optionally restricted to
    /// the given task states, ordered by the parent job's submission time.
    async fn list_tasks(
        &mut self,
        states: Option<&[TaskState]>,
    ) -> Result<Vec<(Task, String, JobState)>>;

    async fn count_jobs_by_state(&mut self, states: &[JobState]) -> Result<i64>;

    /// Count tasks in the given states, optionally within one job.
    async fn count_tasks_by_state(
        &mut self,
        states: &[TaskState],
        job_id: Option<&str>,
    ) -> Result<i64>;

    /// Count a job's tasks that finished with a non-empty error.
    async fn count_task_errors(&mut self, job_id: &str) -> Result<i64>;

    /// Put every RUNNING task back to NEW.
    ///
    /// Operator action at service restart: a RUNNING task whose worker
    /// vanished would otherwise stay stuck, NEW makes it eligible for
    /// re-queueing.
    async fn reset_running_tasks(&mut self) -> Result<u64>;

    /// Delete a job; its tasks cascade.
    async fn remove_job(&mut self, job_id: &str) -> Result<u64>;

    /// Delete all tasks belonging to a job.
    async fn remove_tasks_for_job(&mut self, job_id: &str) -> Result<u64>;

    async fn remove_all_jobs(&mut self) -> Result<u64>;

    async fn remove_all_tasks(&mut self) -> Result<u64>;

    /// Per-state counts of jobs and tasks.
    async fn compute_summary(&mut self) -> Result<Vec<StateSummary>>;
}

#[async_trait]
impl JobOperations for Transaction {
    async fn create_job(&mut self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, submission_date, submitter_id, spec, state,
                              completion_date, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&job.job_id)
        .bind(Store::encode_datetime(job.submission_time))
        .bind(&job.submitter_id)
        .bind(job.spec.to_string())
        .bind(job.state.as_str())
        .bind(Store::encode_datetime(job.completion_time))
        .bind(&job.error)
        .execute(self.conn())
        .await
        .map_err(|e| conflict_or_storage(e, "job", job.job_id.clone()))?;
        Ok(())
    }

    async fn update_job(&mut self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET submission_date = $1, completion_date = $2, state = $3, error = $4
            WHERE job_id = $5
            "#,
        )
        .bind(Store::encode_datetime(job.submission_time))
        .bind(Store::encode_datetime(job.completion_time))
        .bind(job.state.as_str())
        .bind(&job.error)
        .bind(&job.job_id)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn create_task(&mut self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (parent_job_id, task_name, task_type, submission_date,
                               remote_task_id, spec, state, completion_date, error, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&task.job_id)
        .bind(&task.task_name)
        .bind(&task.task_type)
        .bind(Store::encode_datetime(task.submission_time))
        .bind(&task.remote_id)
        .bind(task.spec.to_string())
        .bind(task.state.as_str())
        .bind(Store::encode_datetime(task.completion_time))
        .bind(&task.error)
        .bind(task.retry_count)
        .execute(self.conn())
        .await
        .map_err(|e| conflict_or_storage(e, "task", task.task_name.clone()))?;
        Ok(())
    }

    async fn update_task(&mut self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET submission_date = $1, completion_date = $2, error = $3, state = $4,
                remote_task_id = $5, retry_count = $6
            WHERE parent_job_id = $7 AND task_name = $8
            "#,
        )
        .bind(Store::encode_datetime(task.submission_time))
        .bind(Store::encode_datetime(task.completion_time))
        .bind(&task.error)
        .bind(task.state.as_str())
        .bind(&task.remote_id)
        .bind(task.retry_count)
        .bind(&task.job_id)
        .bind(&task.task_name)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    async fn exists_job(&mut self, job_id: &str) -> Result<bool> {
        let row: Option<i32> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(self.conn())
            .await?;
        Ok(row.is_some())
    }

    async fn get_job(&mut self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(self.conn())
            .await?;
        row.as_ref().map(collect_job).transpose()
    }

    async fn list_jobs(&mut self, states: Option<&[JobState]>) -> Result<Vec<Job>> {
        let rows = match states {
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY submission_date")
                    .fetch_all(self.conn())
                    .await?
            }
            Some([]) => return Ok(Vec::new()),
            Some(states) => {
                let sql = format!(
                    "SELECT * FROM jobs WHERE state IN ({}) ORDER BY submission_date",
                    Store::render_state_list(states)
                );
                sqlx::query(&sql).fetch_all(self.conn()).await?
            }
        };
        rows.iter().map(collect_job).collect()
    }

    async fn list_jobs_by_submitter(&mut self, submitter_id: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE submitter_id = $1 ORDER BY submission_date",
        )
        .bind(submitter_id)
        .fetch_all(self.conn())
        .await?;
        rows.iter().map(collect_job).collect()
    }

    async fn get_task(&mut self, job_id: &str, task_name: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE parent_job_id = $1 AND task_name = $2")
            .bind(job_id)
            .bind(task_name)
            .fetch_optional(self.conn())
            .await?;
        row.as_ref().map(collect_task).transpose()
    }

    async fn list_job_tasks(&mut self, job_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE parent_job_id = $1 ORDER BY task_name")
            .bind(job_id)
            .fetch_all(self.conn())
            .await?;
        rows.iter().map(collect_task).collect()
    }

    async fn list_tasks(
        &mut self,
        states: Option<&[TaskState]>,
    ) -> Result<Vec<(Task, String, JobState)>> {
        let base = "SELECT T.*, J.submitter_id AS job_submitter_id, J.state AS job_state \
                    FROM tasks T JOIN jobs J ON T.parent_job_id = J.job_id";
        let rows = match states {
            None => {
                let sql = format!("{base} ORDER BY J.submission_date");
                sqlx::query(&sql).fetch_all(self.conn()).await?
            }
            Some([]) => return Ok(Vec::new()),
            Some(states) => {
                let sql = format!(
                    "{base} WHERE T.state IN ({}) ORDER BY J.submission_date",
                    Store::render_state_list(states)
                );
                sqlx::query(&sql).fetch_all(self.conn()).await?
            }
        };

        rows.iter()
            .map(|row| {
                Ok((
                    collect_task(row)?,
                    row.try_get("job_submitter_id")?,
                    JobState::parse(&row.try_get::<String, _>("job_state")?)?,
                ))
            })
            .collect()
    }

    async fn count_jobs_by_state(&mut self, states: &[JobState]) -> Result<i64> {
        if states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM jobs WHERE state IN ({})",
            Store::render_state_list(states)
        );
        Ok(sqlx::query_scalar(&sql).fetch_one(self.conn()).await?)
    }

    async fn count_tasks_by_state(
        &mut self,
        states: &[TaskState],
        job_id: Option<&str>,
    ) -> Result<i64> {
        if states.is_empty() {
            return Ok(0);
        }
        let states = Store::render_state_list(states);
        let count = match job_id {
            Some(job_id) => {
                let sql = format!(
                    "SELECT COUNT(*) FROM tasks WHERE state IN ({states}) AND parent_job_id = $1"
                );
                sqlx::query_scalar(&sql)
                    .bind(job_id)
                    .fetch_one(self.conn())
                    .await?
            }
            None => {
                let sql = format!("SELECT COUNT(*) FROM tasks WHERE state IN ({states})");
                sqlx::query_scalar(&sql).fetch_one(self.conn()).await?
            }
        };
        Ok(count)
    }

    async fn count_task_errors(&mut self, job_id: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE error <> '' AND parent_job_id = $1",
        )
        .bind(job_id)
        .fetch_one(self.conn())
        .await?)
    }

    async fn reset_running_tasks(&mut self) -> Result<u64> {
        let result = sqlx::query("UPDATE tasks SET state = 'NEW' WHERE state = 'RUNNING'")
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_job(&mut self, job_id: &str) -> Result<u64> {
        // tasks cascade through their foreign key
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_tasks_for_job(&mut self, job_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE parent_job_id = $1")
            .bind(job_id)
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_all_jobs(&mut self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs").execute(self.conn()).await?;
        Ok(result.rows_affected())
    }

    async fn remove_all_tasks(&mut self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasks").execute(self.conn()).await?;
        Ok(result.rows_affected())
    }

    async fn compute_summary(&mut self) -> Result<Vec<StateSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT 'JOB' AS kind, state, COUNT(*) AS count FROM jobs GROUP BY state
            UNION ALL
            SELECT 'TASK' AS kind, state, COUNT(*) AS count FROM tasks GROUP BY state
            ORDER BY 1, 2
            "#,
        )
        .fetch_all(self.conn())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StateSummary {
                    kind: row.try_get("kind")?,
                    state: row.try_get("state")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }
}

/// Rehydrate a job row; symmetric with [`JobOperations::create_job`].
fn collect_job(row: &PgRow) -> Result<Job> {
    Ok(Job {
        job_id: row.try_get("job_id")?,
        submitter_id: row.try_get("submitter_id")?,
        spec: Store::decode_spec(&row.try_get::<String, _>("spec")?)?,
        state: JobState::parse(&row.try_get::<String, _>("state")?)?,
        submission_time: Store::decode_datetime(&row.try_get::<String, _>("submission_date")?)?,
        completion_time: Store::decode_datetime(&row.try_get::<String, _>("completion_date")?)?,
        error: row.try_get("error")?,
    })
}

/// Rehydrate a task row; symmetric with [`JobOperations::create_task`].
fn collect_task(row: &PgRow) -> Result<Task> {
    Ok(Task {
        job_id: row.try_get("parent_job_id")?,
        task_name: row.try_get("task_name")?,
        task_type: row.try_get("task_type")?,
        spec: Store::decode_spec(&row.try_get::<String, _>("spec")?)?,
        state: TaskState::parse(&row.try_get::<String, _>("state")?)?,
        submission_time: Store::decode_datetime(&row.try_get::<String, _>("submission_date")?)?,
        completion_time: Store::decode_datetime(&row.try_get::<String, _>("completion_date")?)?,
        remote_id: row.try_get("remote_task_id")?,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
    })
}
