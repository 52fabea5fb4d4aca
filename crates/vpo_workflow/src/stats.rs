//! Statistics capture during workflow processing.
//!
//! A [`StatsCollector`] lives for one (job, file) run: capture the before
//! state, accumulate actions and phase metrics while phases execute, capture
//! the after state, persist everything in one transaction.

use std::io::Read;
use std::path::Path;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use vpo_db::{stats as stats_queries, DbError, DbPool};
use vpo_model::{
    ActionResultRecord, EncoderType, PerformanceMetricsRecord, ProcessingStatsRecord, TrackInfo,
    TrackType,
};

use crate::processor::FileProcessingResult;

/// Bytes hashed for the cheap change fingerprint.
pub const HASH_CHUNK_SIZE: usize = 16 * 1024;

/// SHA-256 of the first 16 KiB of a file, hex-encoded (64 chars).
pub fn compute_partial_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut read_total = 0;
    while read_total < HASH_CHUNK_SIZE {
        let n = file.read(&mut buffer[read_total..])?;
        if n == 0 {
            break;
        }
        read_total += n;
    }
    let mut hasher = Sha256::new();
    hasher.update(&buffer[..read_total]);
    Ok(format!("{:x}", hasher.finalize()))
}

/// (audio, subtitle, attachment) counts.
pub fn count_tracks_by_type(tracks: &[TrackInfo]) -> (i64, i64, i64) {
    let mut audio = 0;
    let mut subtitle = 0;
    let mut attachment = 0;
    for track in tracks {
        match track.track_type {
            TrackType::Audio => audio += 1,
            TrackType::Subtitle => subtitle += 1,
            TrackType::Attachment => attachment += 1,
            TrackType::Video => {}
        }
    }
    (audio, subtitle, attachment)
}

fn video_codec(tracks: &[TrackInfo]) -> Option<String> {
    tracks
        .iter()
        .find(|t| t.track_type == TrackType::Video)
        .and_then(|t| t.codec.clone())
}

/// One executed operation, captured for the `action_results` table.
#[derive(Debug, Clone, Default)]
pub struct ActionCapture {
    pub action_type: String,
    pub track_type: Option<String>,
    pub track_index: Option<i64>,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub success: bool,
    pub duration_ms: Option<i64>,
    pub rule_reference: Option<String>,
    pub message: Option<String>,
}

/// One phase's timing for the `performance_metrics` table.
#[derive(Debug, Clone)]
pub struct PhaseMetricsCapture {
    pub phase_name: String,
    pub wall_time_seconds: f64,
    pub bytes_read: Option<i64>,
    pub bytes_written: Option<i64>,
    pub encoding_fps: Option<f64>,
    pub encoding_bitrate: Option<String>,
}

/// Accumulates statistics for one (job, file) and persists them atomically.
#[derive(Debug)]
pub struct StatsCollector {
    stats_id: String,
    job_id: Option<String>,
    file_id: i64,
    policy_name: Option<String>,

    size_before: i64,
    size_after: i64,
    hash_before: Option<String>,
    hash_after: Option<String>,
    audio_before: i64,
    subtitle_before: i64,
    attachments_before: i64,
    audio_after: i64,
    subtitle_after: i64,
    attachments_after: i64,
    video_source_codec: Option<String>,
    video_target_codec: Option<String>,
    audio_tracks_transcoded: i64,
    audio_tracks_preserved: i64,
    encoder_type: Option<EncoderType>,

    duration_seconds: f64,
    phases_completed: i64,
    phases_total: i64,
    total_changes: i64,
    success: bool,
    error_message: Option<String>,

    actions: Vec<ActionCapture>,
    phase_metrics: Vec<PhaseMetricsCapture>,
}

impl StatsCollector {
    pub fn new(job_id: Option<String>, file_id: i64, policy_name: Option<String>) -> Self {
        Self {
            stats_id: Uuid::new_v4().to_string(),
            job_id,
            file_id,
            policy_name,
            size_before: 0,
            size_after: 0,
            hash_before: None,
            hash_after: None,
            audio_before: 0,
            subtitle_before: 0,
            attachments_before: 0,
            audio_after: 0,
            subtitle_after: 0,
            attachments_after: 0,
            video_source_codec: None,
            video_target_codec: None,
            audio_tracks_transcoded: 0,
            audio_tracks_preserved: 0,
            encoder_type: None,
            duration_seconds: 0.0,
            phases_completed: 0,
            phases_total: 0,
            total_changes: 0,
            success: false,
            error_message: None,
            actions: Vec::new(),
            phase_metrics: Vec::new(),
        }
    }

    pub fn stats_id(&self) -> &str {
        &self.stats_id
    }

    /// Snapshot filesystem size, partial hash, track counts and source
    /// video codec before the first phase runs.
    pub fn capture_before_state(&mut self, path: &Path, tracks: &[TrackInfo]) {
        self.size_before = std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0);
        self.hash_before = compute_partial_hash(path).ok();
        let (audio, subtitle, attachment) = count_tracks_by_type(tracks);
        self.audio_before = audio;
        self.subtitle_before = subtitle;
        self.attachments_before = attachment;
        self.video_source_codec = video_codec(tracks);
    }

    /// Symmetric to [`StatsCollector::capture_before_state`]. When no fresh
    /// track set is available (re-introspection failed or was skipped) the
    /// before-counts are copied; counts are never inferred from the plan.
    pub fn capture_after_state(
        &mut self,
        path: &Path,
        tracks: Option<&[TrackInfo]>,
        result: &FileProcessingResult,
    ) {
        self.size_after = std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0);
        self.hash_after = compute_partial_hash(path).ok();
        match tracks {
            Some(tracks) => {
                let (audio, subtitle, attachment) = count_tracks_by_type(tracks);
                self.audio_after = audio;
                self.subtitle_after = subtitle;
                self.attachments_after = attachment;
            }
            None => {
                self.audio_after = self.audio_before;
                self.subtitle_after = self.subtitle_before;
                self.attachments_after = self.attachments_before;
            }
        }
        self.duration_seconds = result.total_duration_seconds;
        self.phases_completed = result.phases_completed as i64;
        self.phases_total =
            (result.phases_completed + result.phases_failed + result.phases_skipped) as i64;
        self.total_changes = result.total_changes;
        self.success = result.success;
        self.error_message = result.error_message.clone();
    }

    pub fn add_action(&mut self, action: ActionCapture) {
        self.actions.push(action);
    }

    pub fn add_phase_metrics(&mut self, metrics: PhaseMetricsCapture) {
        self.phase_metrics.push(metrics);
    }

    pub fn set_video_transcode_info(
        &mut self,
        target_codec: Option<String>,
        encoder_type: Option<EncoderType>,
    ) {
        self.video_target_codec = target_codec;
        self.encoder_type = encoder_type;
    }

    pub fn set_audio_transcode_counts(&mut self, transcoded: i64, preserved: i64) {
        self.audio_tracks_transcoded = transcoded;
        self.audio_tracks_preserved = preserved;
    }

    /// Persist the stats row with its actions and metrics in a single
    /// transaction. Removal counts are clamped at zero to tolerate tracks
    /// that appear post-run (synthesis).
    pub async fn persist(&self, pool: &DbPool) -> Result<String, DbError> {
        let record = ProcessingStatsRecord {
            id: self.stats_id.clone(),
            job_id: self.job_id.clone(),
            file_id: self.file_id,
            processed_at: Utc::now().to_rfc3339(),
            policy_name: self.policy_name.clone(),
            size_before: self.size_before,
            size_after: self.size_after,
            size_change: self.size_before - self.size_after,
            audio_tracks_before: self.audio_before,
            subtitle_tracks_before: self.subtitle_before,
            attachments_before: self.attachments_before,
            audio_tracks_after: self.audio_after,
            subtitle_tracks_after: self.subtitle_after,
            attachments_after: self.attachments_after,
            audio_tracks_removed: (self.audio_before - self.audio_after).max(0),
            subtitle_tracks_removed: (self.subtitle_before - self.subtitle_after).max(0),
            attachments_removed: (self.attachments_before - self.attachments_after).max(0),
            duration_seconds: self.duration_seconds,
            phases_completed: self.phases_completed,
            phases_total: self.phases_total,
            total_changes: self.total_changes,
            video_source_codec: self.video_source_codec.clone(),
            video_target_codec: self.video_target_codec.clone(),
            audio_tracks_transcoded: self.audio_tracks_transcoded,
            audio_tracks_preserved: self.audio_tracks_preserved,
            hash_before: self.hash_before.clone(),
            hash_after: self.hash_after.clone(),
            success: self.success,
            error_message: self.error_message.clone(),
            encoder_type: self.encoder_type,
        };

        let actions: Vec<ActionResultRecord> = self
            .actions
            .iter()
            .map(|action| ActionResultRecord {
                id: None,
                stats_id: self.stats_id.clone(),
                action_type: action.action_type.clone(),
                track_type: action.track_type.clone(),
                track_index: action.track_index,
                before_state: action
                    .before_state
                    .as_ref()
                    .map(|v| v.to_string()),
                after_state: action.after_state.as_ref().map(|v| v.to_string()),
                success: action.success,
                duration_ms: action.duration_ms,
                rule_reference: action.rule_reference.clone(),
                message: action.message.clone(),
            })
            .collect();

        let metrics: Vec<PerformanceMetricsRecord> = self
            .phase_metrics
            .iter()
            .map(|metric| PerformanceMetricsRecord {
                id: None,
                stats_id: self.stats_id.clone(),
                phase_name: metric.phase_name.clone(),
                wall_time_seconds: metric.wall_time_seconds,
                bytes_read: metric.bytes_read,
                bytes_written: metric.bytes_written,
                encoding_fps: metric.encoding_fps,
                encoding_bitrate: metric.encoding_bitrate.clone(),
            })
            .collect();

        stats_queries::persist_stats(pool, &record, &actions, &metrics).await?;
        debug!(
            "persisted stats {} ({} actions, {} metrics)",
            self.stats_id,
            actions.len(),
            metrics.len()
        );
        Ok(self.stats_id.clone())
    }
}
