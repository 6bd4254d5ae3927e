//! Jobs, tasks, the durable task queue, and the manager that ties them
//! together.
//!
//! ```text
//! submission (external)
//!     │
//!     └─► JobManager::create_tasks ── one task per (dataset, year)
//!             ├─► JobOperations::create_task
//!             └─► TaskQueueOperations::queue_task
//!
//! worker (external)
//!     ├─► TaskQueueOperations::get_next_task   (atomic leased dequeue)
//!     ├─► execute, then JobManager::complete_task / fail_task
//!     └─► retries re-queue; terminal outcomes aggregate into the job
//! ```

mod job;
mod manager;
mod ops;
mod queue;
pub mod spec_keys;
mod task;

pub use job::{Job, JobState};
pub use manager::{FailureOutcome, JobManager};
pub use ops::{JobOperations, StateSummary};
pub use queue::{TaskQueueEntry, TaskQueueOperations};
pub use task::{Task, TaskState, TASK_TYPE_SUBSET};
