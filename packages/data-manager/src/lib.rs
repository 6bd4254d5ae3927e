//! Persistent job and task manager for a gridded Earth-observation
//! data-processing service.
//!
//! Users submit jobs that request subsets of datasets (a time range, a
//! spatial extent, and variables drawn from one or more datasets). This crate
//! decomposes each job into one-year-per-dataset tasks, queues them against
//! PostgreSQL, lets external workers dequeue tasks atomically, tracks task
//! and job state, retries transient failures, and aggregates task outcomes
//! back into an overall job result.
//!
//! The HTTP front end that accepts submissions and the compute workers that
//! execute task payloads live elsewhere; they interact with this crate
//! through [`jobs::JobManager`] and the repository traits.

pub mod catalog;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod transaction;

pub use config::Config;
pub use error::{Error, Result};
pub use store::Store;
pub use transaction::Transaction;
