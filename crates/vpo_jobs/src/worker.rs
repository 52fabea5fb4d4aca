//! The worker runtime.
//!
//! One process, one job at a time. The drain loop claims jobs until the
//! queue empties or a stop condition fires (max files, max duration,
//! wall-clock deadline, shutdown signal). Each running job gets a
//! heartbeat task on its own database connection and a structured log
//! file; failures are recorded on the job and never take the loop down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveTime, TimeDelta};
use serde_json::json;
use tracing::{debug, error, info, warn};

use vpo_db::DbPool;
use vpo_model::{Job, JobStatus, JobType, JobRetention, VpoConfig, WorkerLimits};
use vpo_policy::validation::validate_policy;
use vpo_policy::PolicyDocument;
use vpo_tools::ToolRegistry;
use vpo_workflow::{StatsCollector, WorkflowProcessor};

use crate::error::JobsError;
use crate::logs::JobLogWriter;
use crate::queue::{
    claim_next_job, purge_old_jobs, recover_stale_jobs, release_job, update_heartbeat_on,
    update_job_log_path, update_job_progress, ReleaseRequest, DEFAULT_STALE_TIMEOUT_SECS,
};

/// Heartbeat cadence for running jobs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive heartbeat failures that trigger worker shutdown.
pub const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Worker settings, usually derived from [`VpoConfig`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub limits: WorkerLimits,
    pub retention: JobRetention,
    pub logs_dir: PathBuf,
    pub stale_timeout_secs: i64,
}

impl WorkerConfig {
    pub fn from_config(config: &VpoConfig) -> Self {
        Self {
            limits: config.worker.clone(),
            retention: config.jobs.clone(),
            logs_dir: config.logs_dir(),
            stale_timeout_secs: DEFAULT_STALE_TIMEOUT_SECS,
        }
    }
}

/// Parse `HH:MM` into the next such local wall-clock time (tomorrow when
/// the time has already passed today).
fn parse_end_by(raw: &str) -> Option<DateTime<Local>> {
    let time = NaiveTime::parse_from_str(raw, "%H:%M").ok()?;
    let now = Local::now();
    let today = now.date_naive().and_time(time);
    let candidate = today
        .and_local_timezone(Local)
        .single()
        .or_else(|| today.and_local_timezone(Local).earliest())?;
    if candidate <= now {
        let tomorrow = candidate.checked_add_signed(TimeDelta::days(1))?;
        Some(tomorrow)
    } else {
        Some(candidate)
    }
}

struct HeartbeatHandle {
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl HeartbeatHandle {
    async fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.task.abort();
        let _ = self.task.await;
    }
}

/// The long-lived queue drain loop.
pub struct JobWorker<'a> {
    pool: &'a DbPool,
    registry: &'a ToolRegistry,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    end_by: Option<DateTime<Local>>,
    files_processed: u64,
    start_time: Option<Instant>,
}

impl<'a> JobWorker<'a> {
    pub fn new(pool: &'a DbPool, registry: &'a ToolRegistry, config: WorkerConfig) -> Self {
        let end_by = config.limits.end_by.as_deref().and_then(|raw| {
            let parsed = parse_end_by(raw);
            if parsed.is_none() {
                warn!("invalid end_by '{raw}' (expected HH:MM), ignoring");
            }
            parsed
        });
        Self {
            pool,
            registry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            end_by,
            files_processed: 0,
            start_time: None,
        }
    }

    /// The flag flipped by signal handlers (and heartbeat exhaustion) to
    /// request a graceful stop after the current job.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Install SIGTERM/SIGINT handlers that set the shutdown flag.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let flag = self.shutdown.clone();
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("received signal {signal}, requesting shutdown");
                flag.store(true, Ordering::SeqCst);
            }
        });
        Ok(())
    }

    fn should_continue(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(max_files) = self.config.limits.max_files {
            if self.files_processed >= max_files {
                info!("reached max files limit ({max_files})");
                return false;
            }
        }
        if let (Some(max_duration), Some(start)) =
            (self.config.limits.max_duration_secs, self.start_time)
        {
            if start.elapsed().as_secs() >= max_duration {
                info!("reached max duration limit ({max_duration}s)");
                return false;
            }
        }
        if let Some(end_by) = self.end_by {
            if Local::now() >= end_by {
                info!("reached end time ({})", end_by.format("%H:%M"));
                return false;
            }
        }
        true
    }

    fn start_heartbeat(&self, job_id: String) -> HeartbeatHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_task = stop.clone();
        let shutdown = self.shutdown.clone();
        let db_path = self.pool.path().to_path_buf();
        let busy_timeout = self.pool.busy_timeout();
        let pid = std::process::id() as i64;

        let task = tokio::spawn(async move {
            // A dedicated pool (one connection) keeps heartbeat commits
            // fully separate from the execution path's transactions.
            let pool = match DbPool::open(&db_path, busy_timeout).await {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("cannot open heartbeat connection: {e}");
                    return;
                }
            };
            let mut failures = 0u32;
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if stop_for_task.load(Ordering::SeqCst) {
                    break;
                }
                let result = async {
                    let mut guard = pool.writer().await?;
                    update_heartbeat_on(guard.conn(), &job_id, pid).await
                }
                .await;
                match result {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        error!(
                            "heartbeat failed ({failures}/{MAX_HEARTBEAT_FAILURES}): {e}"
                        );
                        if failures >= MAX_HEARTBEAT_FAILURES {
                            error!("max heartbeat failures reached, requesting shutdown");
                            shutdown.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
            pool.close().await;
        });

        HeartbeatHandle { stop, task }
    }

    /// Run the drain loop. Returns the number of jobs processed.
    pub async fn run(&mut self) -> Result<u64, JobsError> {
        self.start_time = Some(Instant::now());
        self.files_processed = 0;

        let mut config_parts = vec![format!("PID={}", std::process::id())];
        if let Some(max_files) = self.config.limits.max_files {
            config_parts.push(format!("max_files={max_files}"));
        }
        if let Some(max_duration) = self.config.limits.max_duration_secs {
            config_parts.push(format!("max_duration={max_duration}s"));
        }
        if let Some(end_by) = self.end_by {
            config_parts.push(format!("end_by={}", end_by.format("%H:%M")));
        }
        if let Some(cores) = self.config.limits.cpu_cores {
            config_parts.push(format!("cpu_cores={cores}"));
        }
        config_parts.push(format!("auto_purge={}", self.config.retention.auto_purge));
        info!("starting job worker: {}", config_parts.join(", "));

        purge_old_jobs(
            self.pool,
            self.config.retention.retention_days,
            self.config.retention.auto_purge,
        )
        .await?;
        recover_stale_jobs(self.pool, self.config.stale_timeout_secs).await?;

        while self.should_continue() {
            let Some(job) = claim_next_job(self.pool, std::process::id() as i64).await? else {
                info!("queue is empty");
                break;
            };
            self.process_job(job).await;
        }

        let elapsed = self
            .start_time
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        info!(
            "worker finished: {} job(s) in {elapsed:.1} seconds",
            self.files_processed
        );
        Ok(self.files_processed)
    }

    /// Execute one claimed job end to end. Never propagates job failures;
    /// they are recorded on the job row and the loop continues.
    async fn process_job(&mut self, job: Job) {
        let job_start = Instant::now();
        let heartbeat = self.start_heartbeat(job.id.clone());

        let log = match JobLogWriter::new(&self.config.logs_dir, &job.id) {
            Ok(log) => {
                if let Err(e) =
                    update_job_log_path(self.pool, &job.id, &log.relative_path()).await
                {
                    warn!("cannot record log path: {e}");
                }
                Some(log)
            }
            Err(e) => {
                warn!("cannot create job log: {e}");
                None
            }
        };

        info!("processing job {} ({})", job.short_id(), job.file_path);
        if let Some(log) = &log {
            log.write_header(
                job.job_type.as_str(),
                &job.file_path,
                &[("policy", job.policy_name.as_deref().unwrap_or("default"))],
            );
        }

        let outcome = self.execute_job(&job, log.as_ref()).await;

        let (status, request) = match outcome {
            Ok(execution) => {
                info!("job {} completed successfully", job.short_id());
                (
                    JobStatus::Completed,
                    ReleaseRequest {
                        output_path: execution.output_path,
                        summary_json: execution.summary_json,
                        set_progress_complete: true,
                        ..Default::default()
                    },
                )
            }
            Err(e) => {
                error!("job {} failed: {e}", job.short_id());
                if let Some(log) = &log {
                    log.write_error(&e.to_string(), None);
                }
                (
                    JobStatus::Failed,
                    ReleaseRequest {
                        error_message: Some(e.to_string()),
                        ..Default::default()
                    },
                )
            }
        };

        if let Some(log) = &log {
            log.write_footer(
                status == JobStatus::Completed,
                Some(job_start.elapsed().as_secs_f64()),
            );
            log.close();
        }

        if let Err(e) = release_job(self.pool, &job.id, status, &request).await {
            error!("cannot release job {}: {e}", job.short_id());
        }

        heartbeat.stop().await;
        self.files_processed += 1;
    }

    async fn execute_job(
        &self,
        job: &Job,
        log: Option<&JobLogWriter>,
    ) -> Result<JobExecution, JobsError> {
        match job.job_type {
            JobType::Process | JobType::Apply => self.execute_workflow_job(job, log).await,
            JobType::Transcode => self.execute_transcode_job(job).await,
            JobType::Scan => {
                let path = PathBuf::from(&job.file_path);
                vpo_workflow::scan::scan_file(self.pool, self.registry, &path).await?;
                Ok(JobExecution::default())
            }
            JobType::Move => Err(JobsError::InvalidState(
                "move jobs are not implemented yet".to_string(),
            )),
        }
    }

    async fn execute_workflow_job(
        &self,
        job: &Job,
        log: Option<&JobLogWriter>,
    ) -> Result<JobExecution, JobsError> {
        let policy_json = job
            .policy_json
            .as_deref()
            .ok_or_else(|| JobsError::InvalidState("process job has no policy".to_string()))?;
        let policy = PolicyDocument::from_json(policy_json)?;
        validate_policy(&policy)?;

        let path = PathBuf::from(&job.file_path);
        let policy_name = job.policy_name.clone().unwrap_or_else(|| "default".to_string());

        let mut processor = WorkflowProcessor::new(self.pool, self.registry, &policy, &policy_name);
        if let Some(log) = log {
            processor = processor.with_log(log);
        }

        // The stats collector needs the file id; resolve or scan first.
        let file_id = match vpo_db::files::get_file_by_path(self.pool, &job.file_path).await? {
            Some(record) => record.id,
            None => {
                vpo_workflow::scan::scan_file(self.pool, self.registry, &path)
                    .await?
                    .0
                    .id
            }
        };
        let mut stats = StatsCollector::new(Some(job.id.clone()), file_id, Some(policy_name));

        let result = processor.process_file(&path, Some(&mut stats)).await?;

        // Stats persistence happens before the job's release transaction.
        if let Err(e) = stats.persist(self.pool).await {
            warn!("cannot persist processing stats: {e}");
        }

        let summary = json!({
            "success": result.success,
            "total_changes": result.total_changes,
            "phases_completed": result.phases_completed,
            "phases_failed": result.phases_failed,
            "phases_skipped": result.phases_skipped,
            "failed_phase": result.failed_phase,
        });

        if result.success {
            Ok(JobExecution {
                output_path: None,
                summary_json: Some(summary.to_string()),
            })
        } else {
            Err(JobsError::InvalidState(
                result
                    .error_message
                    .unwrap_or_else(|| "workflow failed".to_string()),
            ))
        }
    }

    async fn execute_transcode_job(&self, job: &Job) -> Result<JobExecution, JobsError> {
        use vpo_policy::types::VideoTranscodeConfig;
        use vpo_policy::video::analyze_video;
        use vpo_tools::transcode::{
            build_video_args, run_transcode, transcode_temp_path, TranscodeRequest,
        };

        let path = PathBuf::from(&job.file_path);
        let config: VideoTranscodeConfig = match job.policy_json.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => VideoTranscodeConfig::default(),
        };

        let probe = vpo_tools::probe_file(self.registry, &path).await?;
        let duration = probe.duration_seconds;
        let decision = analyze_video(&probe.tracks, &config);
        if !decision.needs_transcode {
            debug!("transcode job {}: nothing to do", job.short_id());
            return Ok(JobExecution::default());
        }

        let temp = transcode_temp_path(&path);
        let request = TranscodeRequest {
            input: path.clone(),
            output: temp.clone(),
            args: build_video_args(&decision, &config.target_codec, decision.hdr_type),
            threads: self.config.limits.cpu_cores,
            timeout: None,
        };

        // Progress ticks flow through a channel to a writer that coalesces
        // to at most one database write per second; the terminal update is
        // written at release via set_progress_complete.
        let (tick_tx, mut tick_rx) = tokio::sync::mpsc::unbounded_channel();
        let transcode = run_transcode(self.registry, &request, move |tick| {
            let _ = tick_tx.send(tick);
        });
        let pool = self.pool;
        let job_id = job.id.clone();
        let progress_writer = async {
            let mut last_write = Instant::now() - Duration::from_secs(2);
            while let Some(tick) = tick_rx.recv().await {
                if last_write.elapsed() < Duration::from_secs(1) {
                    continue;
                }
                last_write = Instant::now();
                let percent = match (tick.out_time_seconds, duration) {
                    (Some(out_time), Some(total)) if total > 0.0 => {
                        ((out_time / total) * 100.0).clamp(0.0, 99.9)
                    }
                    _ => 0.0,
                };
                let payload = json!({
                    "frame": tick.frame,
                    "fps": tick.fps,
                    "bitrate": tick.bitrate,
                    "speed": tick.speed,
                    "out_time_seconds": tick.out_time_seconds,
                })
                .to_string();
                if let Err(e) = update_job_progress(pool, &job_id, percent, Some(&payload)).await
                {
                    warn!("cannot update job progress: {e}");
                }
            }
        };
        let (transcode_result, ()) = tokio::join!(transcode, progress_writer);
        transcode_result?;

        std::fs::rename(&temp, &path).map_err(vpo_workflow::WorkflowError::Io)?;
        Ok(JobExecution {
            output_path: Some(path.to_string_lossy().into_owned()),
            summary_json: None,
        })
    }
}

#[derive(Debug, Default)]
struct JobExecution {
    output_path: Option<String>,
    summary_json: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vpo_db::schema;

    async fn open_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(&dir.path().join("t.db"), Duration::from_secs(10))
            .await
            .unwrap();
        schema::initialize(&pool).await.unwrap();
        (dir, pool)
    }

    fn config(dir: &tempfile::TempDir, limits: WorkerLimits) -> WorkerConfig {
        WorkerConfig {
            limits,
            retention: JobRetention::default(),
            logs_dir: dir.path().join("logs"),
            stale_timeout_secs: 300,
        }
    }

    #[test]
    fn end_by_parses_and_anchors_forward() {
        let parsed = parse_end_by("23:59").unwrap();
        assert!(parsed > Local::now());
        // A past time anchors to tomorrow.
        let early = parse_end_by("00:00").unwrap();
        assert!(early > Local::now());
        assert!(parse_end_by("not-a-time").is_none());
        assert!(parse_end_by("25:00").is_none());
    }

    #[tokio::test]
    async fn shutdown_flag_stops_the_loop() {
        let (dir, pool) = open_pool().await;
        let registry = ToolRegistry::default();
        let mut worker = JobWorker::new(&pool, &registry, config(&dir, WorkerLimits::default()));
        worker.shutdown_flag().store(true, Ordering::SeqCst);
        assert_eq!(worker.run().await.unwrap(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn max_files_is_honoured() {
        let (dir, pool) = open_pool().await;
        let registry = ToolRegistry::default();
        let limits = WorkerLimits {
            max_files: Some(0),
            ..Default::default()
        };
        let mut worker = JobWorker::new(&pool, &registry, config(&dir, limits));
        assert_eq!(worker.run().await.unwrap(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn empty_queue_exits_cleanly() {
        let (dir, pool) = open_pool().await;
        let registry = ToolRegistry::default();
        let mut worker = JobWorker::new(&pool, &registry, config(&dir, WorkerLimits::default()));
        assert_eq!(worker.run().await.unwrap(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn worker_drains_a_process_job_end_to_end() {
        // One-phase policy whose only operation is default_flags, planned
        // against a file whose flags are already correct: a no-op success.
        let media_dir = tempfile::tempdir().unwrap();
        let file_path = media_dir.path().join("a.mkv");
        std::fs::write(&file_path, b"bytes").unwrap();

        let (dir, pool) = open_pool().await;
        let mut record =
            vpo_model::FileRecord::from_path(&file_path, 5);
        record.container_format = Some("matroska".to_string());
        let file_id = vpo_db::files::upsert_file(&pool, &record).await.unwrap();
        let mut audio = vpo_model::TrackInfo::new(file_id, 0, vpo_model::TrackType::Audio);
        audio.language = Some("eng".to_string());
        audio.is_default = true;
        vpo_db::files::replace_tracks(&pool, file_id, &[audio])
            .await
            .unwrap();

        let policy = serde_json::json!({
            "schema_version": 12,
            "config": {},
            "phases": [{
                "name": "defaults",
                "default_flags": {"audio_language": "eng", "clear_others": true}
            }]
        });
        let job = Job::new(JobType::Process, file_path.to_string_lossy())
            .with_policy("test", policy.to_string())
            .with_file_id(file_id);
        crate::queue::insert_job(&pool, &job).await.unwrap();

        let registry = ToolRegistry::default();
        let limits = WorkerLimits {
            max_files: Some(1),
            ..Default::default()
        };
        let mut worker = JobWorker::new(&pool, &registry, config(&dir, limits));
        assert_eq!(worker.run().await.unwrap(), 1);

        let stored = crate::queue::get_job(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress_percent, 100.0);
        assert!(stored.completed_at.is_some());
        assert_eq!(
            stored.log_path.as_deref(),
            Some(format!("logs/{}.log", job.id).as_str())
        );

        // The log footer states SUCCESS on its last non-empty content line.
        let log_file = dir.path().join("logs").join(format!("{}.log", job.id));
        let content = std::fs::read_to_string(&log_file).unwrap();
        assert!(content.contains("JOB END: SUCCESS"));

        // One stats row references this job.
        let stats = vpo_db::stats::stats_count_for_job(&pool, &job.id)
            .await
            .unwrap();
        assert_eq!(stats, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn move_jobs_fail_with_a_clear_message() {
        let (dir, pool) = open_pool().await;
        let job = Job::new(JobType::Move, "/m/f.mkv");
        crate::queue::insert_job(&pool, &job).await.unwrap();

        let registry = ToolRegistry::default();
        let mut worker = JobWorker::new(&pool, &registry, config(&dir, WorkerLimits::default()));
        worker.run().await.unwrap();

        let stored = crate::queue::get_job(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored
            .error_message
            .unwrap()
            .contains("not implemented"));
        pool.close().await;
    }

    #[tokio::test]
    async fn process_job_without_policy_fails_cleanly() {
        let (dir, pool) = open_pool().await;
        let job = Job::new(JobType::Process, "/m/f.mkv");
        crate::queue::insert_job(&pool, &job).await.unwrap();

        let registry = ToolRegistry::default();
        let mut worker = JobWorker::new(&pool, &registry, config(&dir, WorkerLimits::default()));
        assert_eq!(worker.run().await.unwrap(), 1);

        let stored = crate::queue::get_job(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().contains("no policy"));
        pool.close().await;
    }
}
