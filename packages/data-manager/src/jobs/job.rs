//! Jobs: one user request each, accomplished by zero or more tasks.

use std::fmt;

use chrono::{Duration, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::spec_keys;
use crate::error::{Error, Result};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    New,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::New,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(JobState::New),
            "RUNNING" => Ok(JobState::Running),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            other => Err(Error::Corrupt(format!("unknown job state {other:?}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-actioned piece of work, identified by a UUID and described by a
/// JSON-serialisable specification.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub submitter_id: String,
    pub spec: JsonValue,
    pub state: JobState,
    pub submission_time: Option<NaiveDateTime>,
    pub completion_time: Option<NaiveDateTime>,
    /// Why the job failed; empty unless the state is FAILED.
    pub error: String,
}

impl Job {
    /// Create a freshly submitted job from its specification. The submitter
    /// is read from the spec's `SUBMITTER_ID` key.
    pub fn create(spec: JsonValue) -> Self {
        Self::create_with_id(spec, Uuid::new_v4().to_string())
    }

    /// As [`Job::create`], with a caller-chosen id.
    pub fn create_with_id(spec: JsonValue, job_id: String) -> Self {
        let submitter_id = spec
            .get(spec_keys::SUBMITTER_ID)
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            job_id,
            submitter_id,
            spec,
            state: JobState::New,
            submission_time: Some(Utc::now().naive_utc()),
            completion_time: None,
            error: String::new(),
        }
    }

    /// Move the job into RUNNING; triggered once its tasks exist.
    pub fn set_running(&mut self) {
        self.state = JobState::Running;
    }

    /// Move the job into COMPLETED, noting the current UTC time.
    pub fn set_completed(&mut self) {
        self.state = JobState::Completed;
        self.completion_time = Some(Utc::now().naive_utc());
    }

    /// Move the job into FAILED, noting the error and the current UTC time.
    pub fn set_failed(&mut self, error: impl Into<String>) {
        self.state = JobState::Failed;
        self.completion_time = Some(Utc::now().naive_utc());
        self.error = error.into();
    }

    /// Hours spent so far (active jobs) or in total (terminal jobs).
    pub fn duration_hours(&self) -> f64 {
        let Some(submitted) = self.submission_time else {
            return 0.0;
        };
        let until = match self.state {
            JobState::New | JobState::Running => Utc::now().naive_utc(),
            _ => match self.completion_time {
                Some(t) => t,
                None => return 0.0,
            },
        };
        (until - submitted).num_seconds() as f64 / 3600.0
    }

    /// When a terminal job's outputs become eligible for cleanup.
    pub fn expiry_time(&self, cleanup_after_secs: u64) -> Option<NaiveDateTime> {
        if !self.state.is_terminal() {
            return None;
        }
        self.completion_time
            .map(|t| t + Duration::seconds(cleanup_after_secs as i64))
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.job_id, self.submitter_id, self.state)?;
        if self.state == JobState::Failed {
            write!(f, "({})", self.error)?;
        }
        write!(f, " {:.2} hours", self.duration_hours())
    }
}
