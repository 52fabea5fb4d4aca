//! The workflow processor: phases over one file.
//!
//! Resolves the file, re-introspects when track data is missing, walks the
//! policy's phases with gating, re-introspects after each modifying phase,
//! and aggregates the per-phase results into one
//! [`FileProcessingResult`]. Batch processing repeats per file and stops on
//! failure when the policy's on-error mode is `fail`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use vpo_db::{analysis, files, DbPool};
use vpo_model::{OnErrorMode, TrackInfo};
use vpo_policy::conditions::EvalContext;
use vpo_policy::planner::{evaluate_gating, PhaseGate};
use vpo_policy::types::PolicyDocument;
use vpo_tools::ToolRegistry;

use crate::error::WorkflowError;
use crate::executor::{PhaseExecutor, PhaseResult};
use crate::scan::scan_file;
use crate::stats::{ActionCapture, PhaseMetricsCapture, StatsCollector};
use crate::{NullLog, WorkflowLog};

/// Progress callback payload: one tick per phase start.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub file_path: PathBuf,
    pub current_phase: String,
    pub phase_index: usize,
    pub total_phases: usize,
    pub phase_progress: f64,
}

impl ProgressUpdate {
    /// Overall fraction across phases, in `[0, 1]`.
    pub fn overall(&self) -> f64 {
        if self.total_phases == 0 {
            return 1.0;
        }
        (self.phase_index as f64 + self.phase_progress) / self.total_phases as f64
    }
}

/// Aggregated outcome of processing one file.
#[derive(Debug, Clone)]
pub struct FileProcessingResult {
    pub file_path: PathBuf,
    pub success: bool,
    pub phase_results: Vec<PhaseResult>,
    pub total_duration_seconds: f64,
    pub total_changes: i64,
    pub phases_completed: usize,
    pub phases_failed: usize,
    pub phases_skipped: usize,
    pub failed_phase: Option<String>,
    pub error_message: Option<String>,
}

type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Runs a validated policy against files.
pub struct WorkflowProcessor<'a> {
    pool: &'a DbPool,
    registry: &'a ToolRegistry,
    policy: &'a PolicyDocument,
    policy_name: String,
    dry_run: bool,
    progress_callback: Option<ProgressCallback>,
    log: &'a dyn WorkflowLog,
}

impl<'a> WorkflowProcessor<'a> {
    pub fn new(
        pool: &'a DbPool,
        registry: &'a ToolRegistry,
        policy: &'a PolicyDocument,
        policy_name: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            registry,
            policy,
            policy_name: policy_name.into(),
            dry_run: false,
            progress_callback: None,
            log: &NullLog,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_log(mut self, log: &'a dyn WorkflowLog) -> Self {
        self.log = log;
        self
    }

    fn emit_progress(&self, file_path: &Path, phase: &str, index: usize, total: usize) {
        if let Some(callback) = &self.progress_callback {
            callback(ProgressUpdate {
                file_path: file_path.to_path_buf(),
                current_phase: phase.to_string(),
                phase_index: index,
                total_phases: total,
                phase_progress: 0.0,
            });
        }
    }

    /// Load the file's tracks and sidecar context, re-introspecting if the
    /// database has never seen this file (or has no tracks for it).
    async fn resolve_state(
        &self,
        path: &Path,
    ) -> Result<(i64, Vec<TrackInfo>, EvalContext), WorkflowError> {
        let path_str = path.to_string_lossy();
        let mut ctx = EvalContext::default();
        let record = match files::get_file_by_path(self.pool, &path_str).await? {
            Some(record) => record,
            None => {
                let (record, probe) = scan_file(self.pool, self.registry, path).await?;
                ctx.container_tags = probe.container_tags;
                record
            }
        };
        let mut tracks = files::get_tracks_for_file(self.pool, record.id).await?;
        if tracks.is_empty() {
            let (_, probe) = scan_file(self.pool, self.registry, path).await?;
            ctx.container_tags = probe.container_tags;
            tracks = files::get_tracks_for_file(self.pool, record.id).await?;
        }

        ctx.language_results = analysis::get_analyses_for_file(self.pool, record.id).await?;
        Ok((record.id, tracks, ctx))
    }

    /// Process one file through all phases.
    ///
    /// Never returns `Err` for per-phase failures; those are folded into
    /// the result. `Err` is reserved for being unable to start at all
    /// (missing file, storage failure).
    pub async fn process_file(
        &self,
        path: &Path,
        stats: Option<&mut StatsCollector>,
    ) -> Result<FileProcessingResult, WorkflowError> {
        let start = Instant::now();
        let (file_id, mut tracks, mut ctx) = self.resolve_state(path).await?;
        let mut container = files::get_file_by_path(self.pool, &path.to_string_lossy())
            .await?
            .and_then(|f| f.container_format);

        let total = self.policy.phases.len();
        info!("processing {} with {total} phase(s)", path.display());

        let mut stats = stats;
        if let Some(collector) = stats.as_deref_mut() {
            collector.capture_before_state(path, &tracks);
        }

        let executor = PhaseExecutor::new(self.registry, &self.policy.config, self.dry_run, self.log);
        let mut current_path = path.to_path_buf();
        let mut modified_phases: HashSet<String> = HashSet::new();
        let mut phase_results: Vec<PhaseResult> = Vec::new();
        let mut phases_completed = 0;
        let mut phases_failed = 0;
        let mut phases_skipped = 0;
        let mut total_changes = 0;
        let mut failed_phase = None;
        let mut error_message = None;

        for (index, phase) in self.policy.phases.iter().enumerate() {
            self.emit_progress(&current_path, &phase.name, index, total);

            match evaluate_gating(phase, &modified_phases, &tracks, &ctx) {
                PhaseGate::Skipped(reason) => {
                    info!(
                        "phase {}/{} [{}]: skipped ({reason})",
                        index + 1,
                        total,
                        phase.name
                    );
                    self.log
                        .write_line(&format!("phase '{}' skipped: {reason}", phase.name));
                    phases_skipped += 1;
                    continue;
                }
                PhaseGate::Run => {}
            }

            let phase_start = Instant::now();
            match executor
                .execute_phase(phase, &current_path, &tracks, container.as_deref(), &ctx)
                .await
            {
                Ok(result) => {
                    phases_completed += 1;
                    total_changes += result.changes_made;
                    info!(
                        "phase {}/{} [{}]: completed ({} change(s))",
                        index + 1,
                        total,
                        phase.name,
                        result.changes_made
                    );

                    if let Some(collector) = stats.as_deref_mut() {
                        for outcome in &result.outcomes {
                            collector.add_action(ActionCapture {
                                action_type: outcome.operation.clone(),
                                track_type: None,
                                track_index: None,
                                before_state: None,
                                after_state: None,
                                success: outcome.success,
                                duration_ms: Some((outcome.duration_seconds * 1000.0) as i64),
                                rule_reference: Some(phase.name.clone()),
                                message: outcome.message.clone(),
                            });
                        }
                        collector.add_phase_metrics(PhaseMetricsCapture {
                            phase_name: phase.name.clone(),
                            wall_time_seconds: phase_start.elapsed().as_secs_f64(),
                            bytes_read: None,
                            bytes_written: None,
                            encoding_fps: None,
                            encoding_bitrate: None,
                        });
                    }

                    let modified = result.file_modified;
                    current_path = result.output_path.clone();
                    phase_results.push(result);

                    if modified {
                        modified_phases.insert(phase.name.clone());
                        if !self.dry_run {
                            // Refresh the in-memory view for the next phase.
                            match scan_file(self.pool, self.registry, &current_path).await {
                                Ok((record, probe)) => {
                                    tracks =
                                        files::get_tracks_for_file(self.pool, record.id).await?;
                                    container = probe.container.clone();
                                    ctx.container_tags = probe.container_tags;
                                    ctx.language_results =
                                        analysis::get_analyses_for_file(self.pool, record.id)
                                            .await?;
                                }
                                Err(e) => {
                                    warn!("re-introspection after phase failed: {e}");
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    phases_failed += 1;
                    failed_phase = Some(phase.name.clone());
                    let message = e.to_string();
                    error_message = Some(message.clone());
                    warn!(
                        "phase {}/{} [{}]: failed - {message}",
                        index + 1,
                        total,
                        phase.name
                    );
                    phase_results.push(PhaseResult {
                        phase_name: phase.name.clone(),
                        success: false,
                        duration_seconds: phase_start.elapsed().as_secs_f64(),
                        operations_executed: Vec::new(),
                        outcomes: Vec::new(),
                        changes_made: 0,
                        file_modified: false,
                        output_path: current_path.clone(),
                        warnings: Vec::new(),
                        error: Some(message),
                    });

                    let effective = phase.on_error.unwrap_or(self.policy.config.on_error);
                    match effective {
                        OnErrorMode::Fail | OnErrorMode::Skip => {
                            phases_skipped += total - index - 1;
                            break;
                        }
                        OnErrorMode::Continue => {}
                    }
                }
            }
        }

        let result = FileProcessingResult {
            file_path: path.to_path_buf(),
            success: phases_failed == 0,
            phase_results,
            total_duration_seconds: start.elapsed().as_secs_f64(),
            total_changes,
            phases_completed,
            phases_failed,
            phases_skipped,
            failed_phase,
            error_message,
        };

        if let Some(collector) = stats.as_deref_mut() {
            let after_tracks = files::get_tracks_for_file(self.pool, file_id).await.ok();
            collector.capture_after_state(&current_path, after_tracks.as_deref(), &result);
        }

        Ok(result)
    }

    /// Process several files; stop at the first failure when the policy's
    /// on-error is `fail`.
    pub async fn process_files(
        &self,
        paths: &[PathBuf],
    ) -> Result<Vec<FileProcessingResult>, WorkflowError> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let result = self.process_file(path, None).await?;
            let failed = !result.success;
            results.push(result);
            if failed && self.policy.config.on_error == OnErrorMode::Fail {
                warn!("stopping batch: {} failed and on_error=fail", path.display());
                break;
            }
        }
        Ok(results)
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vpo_db::{schema, DbPool};
    use vpo_model::{FileRecord, TrackType};
    use vpo_policy::types::Phase;

    async fn seeded_pool(path: &Path) -> (tempfile::TempDir, DbPool, i64) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(&dir.path().join("t.db"), Duration::from_secs(10))
            .await
            .unwrap();
        schema::initialize(&pool).await.unwrap();

        let mut record = FileRecord::from_path(path, 100);
        record.container_format = Some("matroska".to_string());
        let file_id = files::upsert_file(&pool, &record).await.unwrap();

        let mut video = TrackInfo::new(file_id, 0, TrackType::Video);
        video.codec = Some("hevc".to_string());
        let mut audio = TrackInfo::new(file_id, 1, TrackType::Audio);
        audio.language = Some("eng".to_string());
        files::replace_tracks(&pool, file_id, &[video, audio])
            .await
            .unwrap();
        (dir, pool, file_id)
    }

    fn empty_policy(phases: Vec<Phase>) -> PolicyDocument {
        PolicyDocument {
            schema_version: 12,
            config: Default::default(),
            phases,
        }
    }

    #[tokio::test]
    async fn empty_policy_is_a_noop_success() {
        let media_dir = tempfile::tempdir().unwrap();
        let file = media_dir.path().join("a.mkv");
        std::fs::write(&file, b"bytes").unwrap();
        let (_db_dir, pool, _) = seeded_pool(&file).await;

        let policy = empty_policy(vec![
            Phase {
                name: "one".to_string(),
                ..Default::default()
            },
            Phase {
                name: "two".to_string(),
                ..Default::default()
            },
        ]);
        let registry = ToolRegistry::default();
        let processor = WorkflowProcessor::new(&pool, &registry, &policy, "test");
        let result = processor.process_file(&file, None).await.unwrap();

        assert!(result.success);
        assert_eq!(result.total_changes, 0);
        assert_eq!(result.phases_completed, 2);
        assert_eq!(result.phases_failed, 0);
        assert_eq!(std::fs::read(&file).unwrap(), b"bytes");
        pool.close().await;
    }

    #[tokio::test]
    async fn dependent_phase_is_skipped_when_nothing_modified() {
        let media_dir = tempfile::tempdir().unwrap();
        let file = media_dir.path().join("a.mkv");
        std::fs::write(&file, b"bytes").unwrap();
        let (_db_dir, pool, _) = seeded_pool(&file).await;

        let mut second = Phase {
            name: "second".to_string(),
            ..Default::default()
        };
        second.depends_on = Some(vec!["first".to_string()]);
        let policy = empty_policy(vec![
            Phase {
                name: "first".to_string(),
                ..Default::default()
            },
            second,
        ]);
        let registry = ToolRegistry::default();
        let processor = WorkflowProcessor::new(&pool, &registry, &policy, "test");
        let result = processor.process_file(&file, None).await.unwrap();

        assert!(result.success);
        assert_eq!(result.phases_completed, 1);
        assert_eq!(result.phases_skipped, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn stats_collector_records_before_and_after() {
        let media_dir = tempfile::tempdir().unwrap();
        let file = media_dir.path().join("a.mkv");
        std::fs::write(&file, b"bytes").unwrap();
        let (_db_dir, pool, file_id) = seeded_pool(&file).await;

        let policy = empty_policy(vec![Phase {
            name: "only".to_string(),
            ..Default::default()
        }]);
        let registry = ToolRegistry::default();
        let processor = WorkflowProcessor::new(&pool, &registry, &policy, "test");
        let mut collector = StatsCollector::new(
            Some("11111111-2222-3333-4444-555555555555".to_string()),
            file_id,
            Some("test".to_string()),
        );
        let result = processor
            .process_file(&file, Some(&mut collector))
            .await
            .unwrap();
        assert!(result.success);

        collector.persist(&pool).await.unwrap();
        let count = vpo_db::stats::stats_count_for_job(
            &pool,
            "11111111-2222-3333-4444-555555555555",
        )
        .await
        .unwrap();
        assert_eq!(count, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let media_dir = tempfile::tempdir().unwrap();
        let ghost = media_dir.path().join("ghost.mkv");
        let db_dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(&db_dir.path().join("t.db"), Duration::from_secs(10))
            .await
            .unwrap();
        schema::initialize(&pool).await.unwrap();

        let policy = empty_policy(vec![]);
        let registry = ToolRegistry::default();
        let processor = WorkflowProcessor::new(&pool, &registry, &policy, "test");
        let err = processor.process_file(&ghost, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::FileNotFound(_)));
        pool.close().await;
    }
}
