use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Default output filename template. The `{Y}{m}{d}{H}{M}{S}` placeholders
/// are left for the worker to substitute once it knows the data timestamps.
pub const DEFAULT_OUTPUT_FILENAME_PATTERN: &str = "{PRODUCT}-{LEVEL}-{VERSION}-{Y}{m}{d}{H}{M}{S}";

/// Process-wide configuration loaded from environment variables.
///
/// Built once at startup and passed into components explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the backing PostgreSQL database.
    pub database_url: String,
    /// Root directory under which per-job output folders are created.
    pub output_path: PathBuf,
    /// Template for output filenames, with `{LEVEL}`, `{PRODUCT}`,
    /// `{VERSION}` and date placeholders.
    pub output_filename_pattern: String,
    /// Advisory cap on the number of tasks running in parallel.
    pub task_quota: u32,
    /// Advisory cap on the number of jobs running in parallel.
    pub job_quota: u32,
    /// Retention window after a job completes or fails.
    pub cleanup_after_secs: u64,
    /// Ceiling on a task's retry count.
    pub max_task_retries: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            output_path: env::var("OUTPUT_PATH")
                .context("OUTPUT_PATH must be set")?
                .into(),
            output_filename_pattern: env::var("OUTPUT_FILENAME_PATTERN")
                .unwrap_or_else(|_| DEFAULT_OUTPUT_FILENAME_PATTERN.to_string()),
            task_quota: env::var("TASK_QUOTA")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("TASK_QUOTA must be a valid number")?,
            job_quota: env::var("JOB_QUOTA")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("JOB_QUOTA must be a valid number")?,
            cleanup_after_secs: env::var("CLEANUP_AFTER_SECS")
                .unwrap_or_else(|_| "604800".to_string())
                .parse()
                .context("CLEANUP_AFTER_SECS must be a valid number")?,
            max_task_retries: env::var("MAX_TASK_RETRIES")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("MAX_TASK_RETRIES must be a valid number")?,
        })
    }
}
