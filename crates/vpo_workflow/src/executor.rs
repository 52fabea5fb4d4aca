//! Phase execution.
//!
//! One phase, one file: plan, back up, run the operations in canonical
//! order, roll back from the backup if anything fails after a
//! modification. All decisions were made by the planner; this module only
//! routes planned operations to tool adapters and bookkeeps results.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use vpo_model::{OnErrorMode, TrackInfo, TrackType};
use vpo_policy::actions::{FlagKind, TrackFlagChange, TrackLanguageChange};
use vpo_policy::conditions::EvalContext;
use vpo_policy::planner::{plan_phase, PlanInputs, PlannedOperation};
use vpo_policy::types::{GlobalConfig, Phase};
use vpo_tools::editor::{apply_metadata_edits, MetadataEdit};
use vpo_tools::remux::{run_remux, RemuxRequest};
use vpo_tools::routing::{select_route, PlanShape};
use vpo_tools::transcode::{
    build_synthesis_args, build_video_args, run_transcode, transcode_temp_path, TranscodeRequest,
};
use vpo_tools::{ProgressTick, ToolRegistry};

use crate::error::WorkflowError;
use crate::WorkflowLog;

/// Extension for the sibling backup written before a phase mutates a file.
pub const BACKUP_SUFFIX: &str = "vpo-backup";

/// Result of one executed (or attempted) operation.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub operation: String,
    pub success: bool,
    pub changes_made: i64,
    pub duration_seconds: f64,
    pub message: Option<String>,
}

/// Result of one executed phase.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub phase_name: String,
    pub success: bool,
    pub duration_seconds: f64,
    pub operations_executed: Vec<String>,
    pub outcomes: Vec<OperationOutcome>,
    pub changes_made: i64,
    pub file_modified: bool,
    /// Path after execution; changes only on container change.
    pub output_path: PathBuf,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

struct ExecState {
    current_path: PathBuf,
    backup_path: Option<PathBuf>,
    original_path: PathBuf,
    pre_phase_mtime: Option<filetime::FileTime>,
    file_modified: bool,
}

/// Executes planned phases against files.
pub struct PhaseExecutor<'a> {
    registry: &'a ToolRegistry,
    global: &'a GlobalConfig,
    dry_run: bool,
    log: &'a dyn WorkflowLog,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        global: &'a GlobalConfig,
        dry_run: bool,
        log: &'a dyn WorkflowLog,
    ) -> Self {
        Self {
            registry,
            global,
            dry_run,
            log,
        }
    }

    /// Execute one phase. Returns `Err` only for hard failures (on-error
    /// `fail` or an unexpected error); recoverable operation failures under
    /// `skip`/`continue` yield a successful `PhaseResult` with failed
    /// outcomes inside.
    pub async fn execute_phase(
        &self,
        phase: &Phase,
        file_path: &Path,
        tracks: &[TrackInfo],
        container: Option<&str>,
        ctx: &EvalContext,
    ) -> Result<PhaseResult, WorkflowError> {
        let start = Instant::now();
        let encoders = self.registry.encoder_names();

        let inputs = PlanInputs {
            tracks,
            container,
            ctx,
            available_encoders: encoders.as_deref(),
        };
        let plan = plan_phase(phase, self.global, &file_path.to_string_lossy(), &inputs)
            .map_err(|e| WorkflowError::phase(&phase.name, None, e.to_string()))?;

        for warning in &plan.warnings {
            self.log.write_line(&format!("WARNING: {warning}"));
        }
        for skip in &plan.synthesis_skipped {
            self.log.write_line(&format!(
                "synthesis '{}' skipped ({:?}): {}",
                skip.definition_name, skip.reason, skip.details
            ));
        }

        if plan.is_empty() {
            debug!("phase '{}' plans no operations", phase.name);
            return Ok(PhaseResult {
                phase_name: phase.name.clone(),
                success: true,
                duration_seconds: start.elapsed().as_secs_f64(),
                operations_executed: Vec::new(),
                outcomes: Vec::new(),
                changes_made: 0,
                file_modified: false,
                output_path: file_path.to_path_buf(),
                warnings: plan.warnings.clone(),
                error: None,
            });
        }

        info!(
            "executing phase '{}' with {} operation(s): {}",
            phase.name,
            plan.operations.len(),
            plan.operations
                .iter()
                .map(|op| op.kind())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.log.write_section(&format!("Phase: {}", phase.name));

        let mut state = ExecState {
            current_path: file_path.to_path_buf(),
            backup_path: None,
            original_path: file_path.to_path_buf(),
            pre_phase_mtime: std::fs::metadata(file_path)
                .ok()
                .map(|m| filetime::FileTime::from_last_modification_time(&m)),
            file_modified: false,
        };

        if !self.dry_run {
            state.backup_path = self.create_backup(file_path);
        }

        let on_error = phase.on_error.unwrap_or(self.global.on_error);
        let mut outcomes: Vec<OperationOutcome> = Vec::new();
        let mut operations_executed = Vec::new();
        let mut changes_made = 0;

        for operation in &plan.operations {
            let outcome = self.execute_operation(operation, tracks, &mut state).await;
            self.log.write_line(&format!(
                "operation {}: {} ({} change(s))",
                outcome.operation,
                if outcome.success { "ok" } else { "FAILED" },
                outcome.changes_made
            ));

            if outcome.success {
                operations_executed.push(outcome.operation.clone());
                changes_made += outcome.changes_made;
                if outcome.changes_made > 0 && !self.dry_run {
                    state.file_modified = true;
                }
                outcomes.push(outcome);
            } else {
                let message = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "operation failed".to_string());
                let operation_name = outcome.operation.clone();
                outcomes.push(outcome);

                match on_error {
                    OnErrorMode::Fail => {
                        self.handle_phase_failure(&state);
                        return Err(WorkflowError::phase(
                            &phase.name,
                            Some(operation_name),
                            message,
                        ));
                    }
                    OnErrorMode::Skip => {
                        warn!(
                            "operation {operation_name} failed in phase '{}', skipping remaining operations",
                            phase.name
                        );
                        break;
                    }
                    OnErrorMode::Continue => {}
                }
            }
        }

        self.cleanup_backup(&mut state);

        Ok(PhaseResult {
            phase_name: phase.name.clone(),
            success: true,
            duration_seconds: start.elapsed().as_secs_f64(),
            operations_executed,
            outcomes,
            changes_made,
            file_modified: state.file_modified,
            output_path: state.current_path,
            warnings: plan.warnings,
            error: None,
        })
    }

    fn create_backup(&self, file_path: &Path) -> Option<PathBuf> {
        let backup = backup_path_for(file_path);
        match std::fs::copy(file_path, &backup) {
            Ok(_) => {
                debug!("created backup at {}", backup.display());
                Some(backup)
            }
            Err(e) => {
                warn!("cannot create backup for {}: {e}", file_path.display());
                None
            }
        }
    }

    /// Restore the original from the backup after a failure that may have
    /// modified the file.
    fn handle_phase_failure(&self, state: &ExecState) {
        if !state.file_modified {
            return;
        }
        let Some(backup) = &state.backup_path else {
            error!("file was modified but no backup exists; cannot roll back");
            return;
        };
        match std::fs::copy(backup, &state.original_path) {
            Ok(_) => {
                if state.current_path != state.original_path && state.current_path.exists() {
                    let _ = std::fs::remove_file(&state.current_path);
                }
                info!("rolled back {} from backup", state.original_path.display());
                self.log.write_line("rollback from backup: ok");
            }
            Err(e) => {
                error!("rollback failed: {e}");
                self.log.write_line(&format!("rollback from backup FAILED: {e}"));
            }
        }
    }

    fn cleanup_backup(&self, state: &mut ExecState) {
        if let Some(backup) = state.backup_path.take() {
            if let Err(e) = std::fs::remove_file(&backup) {
                warn!("cannot remove backup {}: {e}", backup.display());
            }
        }
    }

    async fn execute_operation(
        &self,
        operation: &PlannedOperation,
        tracks: &[TrackInfo],
        state: &mut ExecState,
    ) -> OperationOutcome {
        let start = Instant::now();
        let kind = operation.kind().to_string();

        let result = self.dispatch_operation(operation, tracks, state).await;
        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(changes) => OperationOutcome {
                operation: kind,
                success: true,
                changes_made: changes,
                duration_seconds: duration,
                message: None,
            },
            Err(e) => {
                error!("operation {kind} failed: {e}");
                OperationOutcome {
                    operation: kind,
                    success: false,
                    changes_made: 0,
                    duration_seconds: duration,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    async fn dispatch_operation(
        &self,
        operation: &PlannedOperation,
        tracks: &[TrackInfo],
        state: &mut ExecState,
    ) -> Result<i64, WorkflowError> {
        match operation {
            PlannedOperation::Container { target } => {
                if self.dry_run {
                    return Ok(1);
                }
                let shape = PlanShape {
                    changes_container: true,
                    ..Default::default()
                };
                let route = select_route(self.registry, shape, target)?;
                let request = build_container_request(target, tracks);
                let outcome =
                    run_remux(self.registry, route.tool, &state.current_path, tracks, &request)
                        .await?;
                state.current_path = outcome.output_path;
                Ok(1)
            }

            PlannedOperation::TrackFilter {
                outcome_removed, ..
            } => {
                if self.dry_run {
                    return Ok(outcome_removed.len() as i64);
                }
                let shape = PlanShape {
                    removes_tracks: true,
                    ..Default::default()
                };
                let container = state
                    .current_path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "mkv".to_string());
                let route = select_route(self.registry, shape, &container)?;
                let request = RemuxRequest {
                    removed_track_indices: outcome_removed.clone(),
                    ..Default::default()
                };
                let outcome =
                    run_remux(self.registry, route.tool, &state.current_path, tracks, &request)
                        .await?;
                state.current_path = outcome.output_path;
                Ok(outcome_removed.len() as i64)
            }

            PlannedOperation::TrackOrder { order } => {
                if self.dry_run {
                    return Ok(1);
                }
                let shape = PlanShape {
                    reorders_tracks: true,
                    ..Default::default()
                };
                let container = state
                    .current_path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "mkv".to_string());
                let route = select_route(self.registry, shape, &container)?;
                let request = RemuxRequest {
                    track_order: Some(order.clone()),
                    ..Default::default()
                };
                let outcome =
                    run_remux(self.registry, route.tool, &state.current_path, tracks, &request)
                        .await?;
                state.current_path = outcome.output_path;
                Ok(1)
            }

            PlannedOperation::DefaultFlags { changes } => {
                self.apply_flag_changes(changes, &[], state).await
            }

            PlannedOperation::Conditional {
                flag_changes,
                language_changes,
            } => {
                self.apply_flag_changes(flag_changes, language_changes, state)
                    .await
            }

            PlannedOperation::AudioActions { changes }
            | PlannedOperation::SubtitleActions { changes } => {
                self.apply_flag_changes(changes, &[], state).await
            }

            PlannedOperation::AudioSynthesis { operations } => {
                if self.dry_run {
                    return Ok(operations.len() as i64);
                }
                let audio_count = tracks
                    .iter()
                    .filter(|t| t.track_type == TrackType::Audio)
                    .count();
                for (index, synthesis) in operations.iter().enumerate() {
                    let append_position = audio_count + index;
                    let temp = transcode_temp_path(&state.current_path);
                    let request = TranscodeRequest {
                        input: state.current_path.clone(),
                        output: temp.clone(),
                        args: build_synthesis_args(synthesis, append_position),
                        threads: None,
                        timeout: None,
                    };
                    if let Err(e) = run_transcode(self.registry, &request, |_tick| {}).await {
                        let _ = std::fs::remove_file(&temp);
                        return Err(e.into());
                    }
                    std::fs::rename(&temp, &state.current_path)?;
                }
                Ok(operations.len() as i64)
            }

            PlannedOperation::VideoTranscode {
                target_codec,
                decision,
            } => {
                if self.dry_run {
                    return Ok(1);
                }
                let temp = transcode_temp_path(&state.current_path);
                let request = TranscodeRequest {
                    input: state.current_path.clone(),
                    output: temp.clone(),
                    args: build_video_args(decision, target_codec, decision.hdr_type),
                    threads: None,
                    timeout: None,
                };
                if let Err(e) = run_transcode(self.registry, &request, |_tick: ProgressTick| {})
                    .await
                {
                    let _ = std::fs::remove_file(&temp);
                    return Err(e.into());
                }
                std::fs::rename(&temp, &state.current_path)?;
                Ok(1)
            }

            PlannedOperation::AudioTranscode {
                config,
                track_indices,
            } => {
                if self.dry_run {
                    return Ok(track_indices.len() as i64);
                }
                let audio_positions: Vec<usize> = tracks
                    .iter()
                    .filter(|t| t.track_type == TrackType::Audio)
                    .enumerate()
                    .filter(|(_, t)| track_indices.contains(&t.track_index))
                    .map(|(position, _)| position)
                    .collect();

                let mut args = vec![
                    "-map".to_string(),
                    "0".to_string(),
                    "-c".to_string(),
                    "copy".to_string(),
                ];
                for position in &audio_positions {
                    args.push(format!("-c:a:{position}"));
                    args.push(config.target_codec.clone());
                    if let Some(bitrate) = &config.bitrate {
                        args.push(format!("-b:a:{position}"));
                        args.push(bitrate.clone());
                    }
                }

                let temp = transcode_temp_path(&state.current_path);
                let request = TranscodeRequest {
                    input: state.current_path.clone(),
                    output: temp.clone(),
                    args,
                    threads: None,
                    timeout: None,
                };
                if let Err(e) = run_transcode(self.registry, &request, |_tick| {}).await {
                    let _ = std::fs::remove_file(&temp);
                    return Err(e.into());
                }
                std::fs::rename(&temp, &state.current_path)?;
                Ok(track_indices.len() as i64)
            }

            PlannedOperation::Transcription { .. } => Err(WorkflowError::Tool(
                vpo_tools::ToolError::not_available(
                    "transcriber",
                    "track transcription is delegated to an external plugin",
                ),
            )),

            PlannedOperation::FileTimestamp { .. } => {
                if self.dry_run {
                    return Ok(0);
                }
                let Some(mtime) = state.pre_phase_mtime else {
                    return Ok(0);
                };
                if !state.file_modified {
                    return Ok(0);
                }
                filetime::set_file_mtime(&state.current_path, mtime)?;
                Ok(1)
            }
        }
    }

    async fn apply_flag_changes(
        &self,
        flag_changes: &[TrackFlagChange],
        language_changes: &[TrackLanguageChange],
        state: &mut ExecState,
    ) -> Result<i64, WorkflowError> {
        let total = (flag_changes.len() + language_changes.len()) as i64;
        if total == 0 {
            return Ok(0);
        }
        if self.dry_run {
            return Ok(total);
        }

        let mut edits: Vec<MetadataEdit> = Vec::new();
        let mut edit_for = |track_index: i64, edits: &mut Vec<MetadataEdit>| -> usize {
            match edits.iter().position(|e| e.track_index == track_index) {
                Some(position) => position,
                None => {
                    edits.push(MetadataEdit {
                        track_index,
                        ..Default::default()
                    });
                    edits.len() - 1
                }
            }
        };

        for change in flag_changes {
            let position = edit_for(change.track_index, &mut edits);
            match change.flag {
                FlagKind::Default => edits[position].set_default = Some(change.value),
                FlagKind::Forced => edits[position].set_forced = Some(change.value),
            }
        }
        for change in language_changes {
            let position = edit_for(change.track_index, &mut edits);
            edits[position].set_language = Some(change.new_language.clone());
        }

        apply_metadata_edits(self.registry, &state.current_path, &edits).await?;
        Ok(total)
    }
}

/// Build the remux request for a container change.
///
/// MP4 cannot stream-copy everything Matroska holds: text subtitles convert
/// to `mov_text`, bitmap subtitles are dropped, and incompatible audio
/// (TrueHD, DTS-HD) is forced through the per-codec default encoder.
fn build_container_request(target: &str, tracks: &[TrackInfo]) -> RemuxRequest {
    use vpo_policy::codecs;

    let mut request = RemuxRequest {
        target_container: Some(target.to_string()),
        ..Default::default()
    };
    if !target.eq_ignore_ascii_case("mp4") {
        return request;
    }

    let mut audio_position = 0usize;
    for track in tracks {
        match track.track_type {
            TrackType::Audio => {
                let codec = track.codec.as_deref().unwrap_or("");
                if codecs::mp4_requires_audio_transcode(codec) {
                    let target = codecs::mp4_audio_transcode_target(codec);
                    request.forced_audio_transcodes.push(
                        vpo_tools::remux::ForcedAudioTranscode {
                            audio_position,
                            codec: target.codec.to_string(),
                            bitrate: target.bitrate.to_string(),
                        },
                    );
                }
                audio_position += 1;
            }
            TrackType::Subtitle => {
                let codec = track
                    .codec
                    .as_deref()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if codecs::BITMAP_SUBTITLE_CODECS.contains(&codec.as_str()) {
                    request.removed_track_indices.push(track.track_index);
                } else if codecs::MP4_CONVERTIBLE_SUBTITLE_CODECS.contains(&codec.as_str()) {
                    request.convert_text_subtitles = true;
                }
            }
            _ => {}
        }
    }
    request
}

/// `<path>.vpo-backup`, next to the original.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(BACKUP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullLog;
    use vpo_policy::types::DefaultFlagsConfig;

    fn audio(index: i64, lang: &str, default: bool) -> TrackInfo {
        let mut t = TrackInfo::new(1, index, TrackType::Audio);
        t.language = Some(lang.to_string());
        t.is_default = default;
        t
    }

    #[test]
    fn mp4_container_request_transcodes_and_drops_what_mp4_cannot_hold() {
        let mut truehd = TrackInfo::new(1, 1, TrackType::Audio);
        truehd.codec = Some("truehd".to_string());
        let mut aac = TrackInfo::new(1, 2, TrackType::Audio);
        aac.codec = Some("aac".to_string());
        let mut pgs = TrackInfo::new(1, 3, TrackType::Subtitle);
        pgs.codec = Some("hdmv_pgs_subtitle".to_string());
        let mut srt = TrackInfo::new(1, 4, TrackType::Subtitle);
        srt.codec = Some("subrip".to_string());
        let tracks = vec![
            TrackInfo::new(1, 0, TrackType::Video),
            truehd,
            aac,
            pgs,
            srt,
        ];

        let request = build_container_request("mp4", &tracks);
        assert_eq!(request.forced_audio_transcodes.len(), 1);
        assert_eq!(request.forced_audio_transcodes[0].audio_position, 0);
        assert_eq!(request.forced_audio_transcodes[0].bitrate, "256k");
        assert_eq!(request.removed_track_indices, vec![3]);
        assert!(request.convert_text_subtitles);

        // Matroska targets carry everything; nothing is forced.
        let passthrough = build_container_request("mkv", &tracks);
        assert!(passthrough.forced_audio_transcodes.is_empty());
        assert!(passthrough.removed_track_indices.is_empty());
    }

    #[test]
    fn backup_path_appends_suffix() {
        let backup = backup_path_for(Path::new("/media/show/e01.mkv"));
        assert_eq!(
            backup,
            PathBuf::from("/media/show/e01.mkv.vpo-backup")
        );
    }

    #[tokio::test]
    async fn empty_phase_succeeds_without_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mkv");
        std::fs::write(&file, b"container bytes").unwrap();
        let before = std::fs::read(&file).unwrap();

        let registry = ToolRegistry::default();
        let global = GlobalConfig::default();
        let executor = PhaseExecutor::new(&registry, &global, false, &NullLog);
        let phase = Phase {
            name: "noop".to_string(),
            ..Default::default()
        };
        let result = executor
            .execute_phase(&phase, &file, &[], Some("matroska"), &EvalContext::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.changes_made, 0);
        assert!(!result.file_modified);
        assert_eq!(std::fs::read(&file).unwrap(), before);
        assert!(!backup_path_for(&file).exists());
    }

    #[tokio::test]
    async fn dry_run_counts_changes_without_modifying() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mkv");
        std::fs::write(&file, b"container bytes").unwrap();
        let before = std::fs::read(&file).unwrap();

        let tracks = vec![audio(0, "eng", false), audio(1, "deu", true)];
        let registry = ToolRegistry::default();
        let global = GlobalConfig::default();
        let executor = PhaseExecutor::new(&registry, &global, true, &NullLog);
        let phase = Phase {
            name: "defaults".to_string(),
            default_flags: Some(DefaultFlagsConfig {
                audio_language: Some("eng".to_string()),
                subtitle_language: None,
                clear_others: true,
            }),
            ..Default::default()
        };
        let result = executor
            .execute_phase(&phase, &file, &tracks, Some("matroska"), &EvalContext::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.changes_made, 2);
        assert!(!result.file_modified);
        assert_eq!(std::fs::read(&file).unwrap(), before);
        // Dry run never writes a backup.
        assert!(!backup_path_for(&file).exists());
    }

    #[tokio::test]
    async fn missing_editor_fails_phase_under_fail_mode() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mkv");
        std::fs::write(&file, b"container bytes").unwrap();

        let tracks = vec![audio(0, "eng", false)];
        let registry = ToolRegistry::default();
        let global = GlobalConfig::default();
        let executor = PhaseExecutor::new(&registry, &global, false, &NullLog);
        let phase = Phase {
            name: "defaults".to_string(),
            default_flags: Some(DefaultFlagsConfig {
                audio_language: Some("eng".to_string()),
                subtitle_language: None,
                clear_others: false,
            }),
            ..Default::default()
        };
        let err = executor
            .execute_phase(&phase, &file, &tracks, Some("matroska"), &EvalContext::default())
            .await
            .unwrap_err();
        match err {
            WorkflowError::PhaseExecution {
                phase, operation, ..
            } => {
                assert_eq!(phase, "defaults");
                assert_eq!(operation.as_deref(), Some("default_flags"));
            }
            other => panic!("unexpected: {other}"),
        }
        // The backup is only removed on success; after a failure it stays
        // until the next successful phase or cleanup sweep.
        assert!(backup_path_for(&file).exists());
        assert_eq!(std::fs::read(&file).unwrap(), b"container bytes");
    }

    #[tokio::test]
    async fn continue_mode_swallows_operation_failures() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mkv");
        std::fs::write(&file, b"container bytes").unwrap();

        let tracks = vec![audio(0, "eng", false)];
        let registry = ToolRegistry::default();
        let global = GlobalConfig {
            on_error: OnErrorMode::Continue,
            ..Default::default()
        };
        let executor = PhaseExecutor::new(&registry, &global, false, &NullLog);
        let phase = Phase {
            name: "defaults".to_string(),
            default_flags: Some(DefaultFlagsConfig {
                audio_language: Some("eng".to_string()),
                subtitle_language: None,
                clear_others: false,
            }),
            ..Default::default()
        };
        let result = executor
            .execute_phase(&phase, &file, &tracks, Some("matroska"), &EvalContext::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.changes_made, 0);
        assert!(result.outcomes.iter().any(|o| !o.success));
    }
}
