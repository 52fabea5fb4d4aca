//! Queue operations.
//!
//! All status transitions are guarded at the SQL layer (`WHERE status =
//! ...`), so a racing caller changes zero rows instead of corrupting the
//! state machine. Claiming runs inside `BEGIN IMMEDIATE` to make the
//! select-then-update atomic against other writers.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};

use vpo_db::{DbError, DbPool};
use vpo_model::{Job, JobStatus};

/// A running job whose heartbeat is older than this is considered stale.
pub const DEFAULT_STALE_TIMEOUT_SECS: i64 = 300;

fn job_from_row(row: &SqliteRow) -> Result<Job, DbError> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        file_path: row.try_get("file_path")?,
        job_type: job_type.parse()?,
        status: status.parse()?,
        priority: row.try_get("priority")?,
        policy_name: row.try_get("policy_name")?,
        policy_json: row.try_get("policy_json")?,
        progress_percent: row.try_get("progress_percent")?,
        progress_json: row.try_get("progress_json")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        worker_pid: row.try_get("worker_pid")?,
        worker_heartbeat: row.try_get("worker_heartbeat")?,
        error_message: row.try_get("error_message")?,
        output_path: row.try_get("output_path")?,
        summary_json: row.try_get("summary_json")?,
        log_path: row.try_get("log_path")?,
    })
}

/// Insert a new job row.
pub async fn insert_job(pool: &DbPool, job: &Job) -> Result<(), DbError> {
    let mut guard = pool.writer().await?;
    sqlx::query(
        "INSERT INTO jobs (id, file_id, file_path, job_type, status, priority, policy_name, \
         policy_json, progress_percent, progress_json, created_at, started_at, completed_at, \
         worker_pid, worker_heartbeat, error_message, output_path, summary_json, log_path) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.id)
    .bind(job.file_id)
    .bind(&job.file_path)
    .bind(job.job_type.as_str())
    .bind(job.status.as_str())
    .bind(job.priority)
    .bind(&job.policy_name)
    .bind(&job.policy_json)
    .bind(job.progress_percent)
    .bind(&job.progress_json)
    .bind(&job.created_at)
    .bind(&job.started_at)
    .bind(&job.completed_at)
    .bind(job.worker_pid)
    .bind(&job.worker_heartbeat)
    .bind(&job.error_message)
    .bind(&job.output_path)
    .bind(&job.summary_json)
    .bind(&job.log_path)
    .execute(guard.conn())
    .await?;
    debug!("inserted job {} ({})", job.short_id(), job.job_type);
    Ok(())
}

pub async fn get_job(pool: &DbPool, job_id: &str) -> Result<Option<Job>, DbError> {
    let mut conn = pool.read_connection().await?;
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(&mut conn)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Jobs, newest first, optionally filtered by status.
pub async fn list_jobs(
    pool: &DbPool,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<Job>, DbError> {
    let mut conn = pool.read_connection().await?;
    let rows = match status {
        Some(status) => {
            sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?")
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&mut conn)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&mut conn)
                .await?
        }
    };
    rows.iter().map(job_from_row).collect()
}

/// Claim the next queued job for `worker_pid`.
///
/// Selection order is priority ascending (lower number wins), then
/// `created_at` ascending: strict priority+FIFO. Returns `None` when the
/// queue is empty.
pub async fn claim_next_job(pool: &DbPool, worker_pid: i64) -> Result<Option<Job>, DbError> {
    let mut tx = pool.transaction().await?;

    let candidate: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM jobs WHERE status = 'queued' \
         ORDER BY priority ASC, created_at ASC LIMIT 1",
    )
    .fetch_optional(tx.conn())
    .await?;

    let Some((job_id,)) = candidate else {
        tx.commit().await?;
        return Ok(None);
    };

    let now = Utc::now().to_rfc3339();
    let updated = sqlx::query(
        "UPDATE jobs SET status = 'running', worker_pid = ?, started_at = ?, \
         worker_heartbeat = ?, error_message = NULL, progress_percent = 0, progress_json = NULL \
         WHERE id = ? AND status = 'queued'",
    )
    .bind(worker_pid)
    .bind(&now)
    .bind(&now)
    .bind(&job_id)
    .execute(tx.conn())
    .await?
    .rows_affected();

    if updated == 0 {
        // Claimed by someone else between select and update.
        tx.commit().await?;
        return Ok(None);
    }

    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(&job_id)
        .fetch_one(tx.conn())
        .await?;
    let job = job_from_row(&row)?;
    tx.commit().await?;

    info!("claimed job {} ({})", job.short_id(), job.file_path);
    Ok(Some(job))
}

/// Terminal transition parameters for [`release_job`].
#[derive(Debug, Clone, Default)]
pub struct ReleaseRequest {
    pub error_message: Option<String>,
    pub output_path: Option<String>,
    pub summary_json: Option<String>,
    /// Force `progress_percent` to 100 on completion.
    pub set_progress_complete: bool,
}

/// Transition a running job to a terminal status and stamp `completed_at`.
/// Returns false when the job was not running.
pub async fn release_job(
    pool: &DbPool,
    job_id: &str,
    status: JobStatus,
    request: &ReleaseRequest,
) -> Result<bool, DbError> {
    debug_assert!(status.is_terminal());
    let mut guard = pool.writer().await?;
    let updated = sqlx::query(
        "UPDATE jobs SET status = ?, completed_at = ?, error_message = ?, \
         output_path = COALESCE(?, output_path), \
         summary_json = COALESCE(?, summary_json), \
         progress_percent = CASE WHEN ? THEN 100.0 ELSE progress_percent END \
         WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(&request.error_message)
    .bind(&request.output_path)
    .bind(&request.summary_json)
    .bind(request.set_progress_complete)
    .bind(job_id)
    .execute(guard.conn())
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// Refresh a running job's heartbeat on the shared pool.
pub async fn update_heartbeat(pool: &DbPool, job_id: &str, worker_pid: i64) -> Result<bool, DbError> {
    let mut guard = pool.writer().await?;
    update_heartbeat_on(guard.conn(), job_id, worker_pid).await
}

/// Refresh a running job's heartbeat on a caller-owned connection.
///
/// The worker's heartbeat task uses this with its own connection so a
/// heartbeat commit can never publish the execution path's half-written
/// state. Only running jobs are touched; returns whether a row changed.
pub async fn update_heartbeat_on(
    conn: &mut SqliteConnection,
    job_id: &str,
    worker_pid: i64,
) -> Result<bool, DbError> {
    let updated = sqlx::query(
        "UPDATE jobs SET worker_heartbeat = ?, worker_pid = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(worker_pid)
    .bind(job_id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// Reset running jobs whose heartbeat is older than `timeout_secs` back to
/// queued, clearing worker binding. Returns the number recovered.
pub async fn recover_stale_jobs(pool: &DbPool, timeout_secs: i64) -> Result<u64, DbError> {
    let cutoff = (Utc::now() - ChronoDuration::seconds(timeout_secs)).to_rfc3339();
    let mut guard = pool.writer().await?;
    let recovered = sqlx::query(
        "UPDATE jobs SET status = 'queued', worker_pid = NULL, started_at = NULL \
         WHERE status = 'running' AND (worker_heartbeat IS NULL OR worker_heartbeat < ?)",
    )
    .bind(&cutoff)
    .execute(guard.conn())
    .await?
    .rows_affected();
    if recovered > 0 {
        info!("recovered {recovered} stale job(s)");
    }
    Ok(recovered)
}

/// Cancel a queued job. Running jobs are not cancellable from this path.
pub async fn cancel_job(pool: &DbPool, job_id: &str) -> Result<bool, DbError> {
    let mut guard = pool.writer().await?;
    let updated = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', completed_at = ? \
         WHERE id = ? AND status = 'queued'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(job_id)
    .execute(guard.conn())
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// Put a failed or cancelled job back in the queue.
pub async fn requeue_job(pool: &DbPool, job_id: &str) -> Result<bool, DbError> {
    let mut guard = pool.writer().await?;
    let updated = sqlx::query(
        "UPDATE jobs SET status = 'queued', error_message = NULL, progress_percent = 0, \
         completed_at = NULL, worker_pid = NULL, started_at = NULL \
         WHERE id = ? AND status IN ('failed', 'cancelled')",
    )
    .bind(job_id)
    .execute(guard.conn())
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// Write a progress update for a running job.
pub async fn update_job_progress(
    pool: &DbPool,
    job_id: &str,
    percent: f64,
    progress_json: Option<&str>,
) -> Result<bool, DbError> {
    let mut guard = pool.writer().await?;
    let updated = sqlx::query(
        "UPDATE jobs SET progress_percent = ?, progress_json = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(percent.clamp(0.0, 100.0))
    .bind(progress_json)
    .bind(job_id)
    .execute(guard.conn())
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// Record the relative log path on a job.
pub async fn update_job_log_path(
    pool: &DbPool,
    job_id: &str,
    log_path: &str,
) -> Result<(), DbError> {
    let mut guard = pool.writer().await?;
    sqlx::query("UPDATE jobs SET log_path = ? WHERE id = ?")
        .bind(log_path)
        .bind(job_id)
        .execute(guard.conn())
        .await?;
    Ok(())
}

/// Counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

pub async fn get_queue_stats(pool: &DbPool) -> Result<QueueStats, DbError> {
    let mut conn = pool.read_connection().await?;
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(&mut conn)
            .await?;

    let mut stats = QueueStats::default();
    for (status, count) in rows {
        match status.as_str() {
            "queued" => stats.queued = count,
            "running" => stats.running = count,
            "completed" => stats.completed = count,
            "failed" => stats.failed = count,
            "cancelled" => stats.cancelled = count,
            _ => {}
        }
        stats.total += count;
    }
    Ok(stats)
}

/// Delete terminal jobs older than the retention window. A no-op when
/// auto-purge is disabled.
pub async fn purge_old_jobs(
    pool: &DbPool,
    retention_days: u32,
    auto_purge: bool,
) -> Result<u64, DbError> {
    if !auto_purge {
        return Ok(0);
    }
    let cutoff = (Utc::now() - ChronoDuration::days(retention_days as i64)).to_rfc3339();
    let mut guard = pool.writer().await?;
    let purged = sqlx::query(
        "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') \
         AND completed_at IS NOT NULL AND completed_at < ?",
    )
    .bind(&cutoff)
    .execute(guard.conn())
    .await?
    .rows_affected();
    if purged > 0 {
        info!("purged {purged} old job(s)");
    }
    Ok(purged)
}
