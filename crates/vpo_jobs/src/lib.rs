//! Job queue, worker runtime and log lifecycle.
//!
//! Jobs are rows in the shared SQLite store; claiming is an atomic
//! status transition inside a `BEGIN IMMEDIATE` transaction. A single
//! worker process drains the queue under configurable stop conditions,
//! heartbeating each running job from a separate database connection and
//! writing one structured log file per job.

pub mod error;
pub mod logs;
pub mod maintenance;
pub mod queue;
pub mod worker;

pub use error::JobsError;
pub use logs::{read_log_tail, JobLogWriter, LogError};
pub use queue::{
    cancel_job, claim_next_job, get_job, get_queue_stats, insert_job, list_jobs, purge_old_jobs,
    recover_stale_jobs, release_job, requeue_job, update_heartbeat, update_job_log_path,
    update_job_progress, QueueStats, ReleaseRequest, DEFAULT_STALE_TIMEOUT_SECS,
};
pub use worker::{JobWorker, WorkerConfig};
