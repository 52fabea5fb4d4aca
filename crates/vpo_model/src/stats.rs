//! Processing statistics records.
//!
//! A job that processes a file produces one [`ProcessingStatsRecord`] with
//! its owned [`ActionResultRecord`]s and [`PerformanceMetricsRecord`]s. The
//! three are persisted in a single transaction; stats outlive their job so
//! reports keep working after job purges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::StatusParseError;

/// Which kind of encoder performed a video transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    Hardware,
    Software,
}

impl EncoderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Software => "software",
        }
    }
}

impl fmt::Display for EncoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hardware" => Ok(Self::Hardware),
            "software" => Ok(Self::Software),
            other => Err(StatusParseError::new("encoder type", other)),
        }
    }
}

/// Aggregate before/after state for one processed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatsRecord {
    /// UUIDv4 assigned by the collector.
    pub id: String,
    pub job_id: Option<String>,
    pub file_id: i64,
    pub processed_at: String,
    pub policy_name: Option<String>,
    pub size_before: i64,
    pub size_after: i64,
    pub size_change: i64,
    pub audio_tracks_before: i64,
    pub subtitle_tracks_before: i64,
    pub attachments_before: i64,
    pub audio_tracks_after: i64,
    pub subtitle_tracks_after: i64,
    pub attachments_after: i64,
    pub audio_tracks_removed: i64,
    pub subtitle_tracks_removed: i64,
    pub attachments_removed: i64,
    pub duration_seconds: f64,
    pub phases_completed: i64,
    pub phases_total: i64,
    pub total_changes: i64,
    pub video_source_codec: Option<String>,
    pub video_target_codec: Option<String>,
    pub audio_tracks_transcoded: i64,
    pub audio_tracks_preserved: i64,
    pub hash_before: Option<String>,
    pub hash_after: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub encoder_type: Option<EncoderType>,
}

/// One executed operation within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResultRecord {
    pub id: Option<i64>,
    pub stats_id: String,
    pub action_type: String,
    pub track_type: Option<String>,
    pub track_index: Option<i64>,
    /// JSON snapshots of the affected state, when captured.
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    pub success: bool,
    pub duration_ms: Option<i64>,
    pub rule_reference: Option<String>,
    pub message: Option<String>,
}

/// Timing and throughput for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetricsRecord {
    pub id: Option<i64>,
    pub stats_id: String,
    pub phase_name: String,
    pub wall_time_seconds: f64,
    pub bytes_read: Option<i64>,
    pub bytes_written: Option<i64>,
    pub encoding_fps: Option<f64>,
    pub encoding_bitrate: Option<String>,
}
