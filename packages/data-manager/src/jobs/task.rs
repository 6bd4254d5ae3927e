//! Tasks: per-dataset, per-year units of work owned by exactly one job.
//!
//! A task is identified by its parent job and a name unique within that job.
//! Failed tasks can be retried, so a task also carries a retry count.

use std::fmt;

use chrono::{NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default task type.
pub const TASK_TYPE_SUBSET: &str = "subset";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::New,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Failed,
    ];

    /// States in which a task still counts towards its job's active work.
    pub const ACTIVE: [TaskState; 2] = [TaskState::New, TaskState::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "NEW",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(TaskState::New),
            "RUNNING" => Ok(TaskState::Running),
            "COMPLETED" => Ok(TaskState::Completed),
            "FAILED" => Ok(TaskState::Failed),
            other => Err(Error::Corrupt(format!("unknown task state {other:?}"))),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete executable piece of work contributing to one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Id of the owning job; the task exists only while the job does.
    pub job_id: String,
    /// Unique within the job. A fresh UUID when not supplied.
    pub task_name: String,
    pub task_type: String,
    pub spec: JsonValue,
    pub state: TaskState,
    pub submission_time: Option<NaiveDateTime>,
    pub completion_time: Option<NaiveDateTime>,
    /// Identifier assigned by the system executing the task; empty until a
    /// worker picks it up.
    pub remote_id: String,
    /// Non-empty only when the task failed.
    pub error: String,
    pub retry_count: i32,
}

impl Task {
    /// Create a task for a job with a generated name.
    pub fn create(spec: JsonValue, job_id: impl Into<String>) -> Self {
        Self::create_named(spec, job_id, Uuid::new_v4().to_string())
    }

    /// Create a task with a caller-chosen name.
    pub fn create_named(
        spec: JsonValue,
        job_id: impl Into<String>,
        task_name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_name: task_name.into(),
            task_type: TASK_TYPE_SUBSET.to_string(),
            spec,
            state: TaskState::New,
            submission_time: None,
            completion_time: None,
            remote_id: String::new(),
            error: String::new(),
            retry_count: 0,
        }
    }

    /// Move this task into RUNNING, noting the current UTC time as its
    /// submission time.
    pub fn set_running(&mut self) {
        self.state = TaskState::Running;
        self.submission_time = Some(Utc::now().naive_utc());
    }

    /// Move this task into COMPLETED, noting the current UTC time.
    pub fn set_completed(&mut self) {
        self.state = TaskState::Completed;
        self.completion_time = Some(Utc::now().naive_utc());
    }

    /// Move this task into FAILED, noting the error and the current UTC time.
    pub fn set_failed(&mut self, error: impl Into<String>) {
        self.state = TaskState::Failed;
        self.completion_time = Some(Utc::now().naive_utc());
        self.error = error.into();
    }

    /// Move this task back into NEW for another attempt: the retry count goes
    /// up, timestamps and error are cleared.
    pub fn retry(&mut self) {
        self.state = TaskState::New;
        self.submission_time = None;
        self.completion_time = None;
        self.error = String::new();
        self.retry_count += 1;
    }

    /// Hours this task has been running, or took in total once terminal.
    pub fn duration_hours(&self) -> f64 {
        let Some(submitted) = self.submission_time else {
            return 0.0;
        };
        let until = match self.state {
            TaskState::New => return 0.0,
            TaskState::Running => Utc::now().naive_utc(),
            _ => match self.completion_time {
                Some(t) => t,
                None => return 0.0,
            },
        };
        (until - submitted).num_seconds() as f64 / 3600.0
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.task_type, self.task_name, self.state)?;
        match self.state {
            TaskState::Running => write!(f, "(try={})", self.retry_count)?,
            TaskState::Failed => write!(f, "({})", self.error)?,
            _ => {}
        }
        write!(f, " {:.2} hours", self.duration_hours())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> Task {
        Task::create(json!({"START_YEAR": "2020"}), "job-1")
    }

    #[test]
    fn new_task_starts_in_new_state() {
        let task = sample_task();
        assert_eq!(task.state, TaskState::New);
        assert_eq!(task.task_type, TASK_TYPE_SUBSET);
        assert_eq!(task.retry_count, 0);
        assert!(task.submission_time.is_none());
    }

    #[test]
    fn task_names_are_unique_when_generated() {
        assert_ne!(sample_task().task_name, sample_task().task_name);
    }

    #[test]
    fn running_task_records_submission_time() {
        let mut task = sample_task();
        task.set_running();
        assert_eq!(task.state, TaskState::Running);
        assert!(task.submission_time.is_some());
    }

    #[test]
    fn failed_task_records_error_and_completion_time() {
        let mut task = sample_task();
        task.set_running();
        task.set_failed("worker exploded");
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error, "worker exploded");
        assert!(task.completion_time.is_some());
    }

    #[test]
    fn retry_increments_count_and_clears_progress() {
        let mut task = sample_task();
        task.set_running();
        task.set_failed("transient");
        task.retry();

        assert_eq!(task.state, TaskState::New);
        assert_eq!(task.retry_count, 1);
        assert!(task.submission_time.is_none());
        assert!(task.completion_time.is_none());
        assert_eq!(task.error, "");

        task.set_running();
        task.set_failed("again");
        task.retry();
        assert_eq!(task.retry_count, 2);
    }

    #[test]
    fn states_round_trip_through_strings() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::parse(state.as_str()).unwrap(), state);
        }
        assert!(TaskState::parse("new").is_err());
    }
}
