//! Track metadata as produced by container introspection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::StatusParseError;

/// Kind of elementary stream within a media container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
    Attachment,
}

impl TrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
            Self::Attachment => "attachment",
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "subtitle" | "subtitles" => Ok(Self::Subtitle),
            "attachment" => Ok(Self::Attachment),
            other => Err(StatusParseError::new("track type", other)),
        }
    }
}

/// One track of a scanned file.
///
/// `track_index` is the zero-based index within the container and is unique
/// per file. Type-specific fields are `None` when they do not apply or the
/// introspector did not report them; re-scans replace the whole track set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Surrogate key assigned by the store. Zero for not-yet-persisted tracks.
    pub id: i64,
    pub file_id: i64,
    pub track_index: i64,
    pub track_type: TrackType,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    // Audio
    pub channels: Option<i64>,
    pub channel_layout: Option<String>,
    // Video
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub frame_rate: Option<String>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub color_space: Option<String>,
    pub color_range: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl TrackInfo {
    /// A minimal track with only the identifying fields set. Used by tests
    /// and by builders that fill in type-specific attributes afterwards.
    pub fn new(file_id: i64, track_index: i64, track_type: TrackType) -> Self {
        Self {
            id: 0,
            file_id,
            track_index,
            track_type,
            codec: None,
            language: None,
            title: None,
            is_default: false,
            is_forced: false,
            channels: None,
            channel_layout: None,
            width: None,
            height: None,
            frame_rate: None,
            color_transfer: None,
            color_primaries: None,
            color_space: None,
            color_range: None,
            duration_seconds: None,
        }
    }

    /// `WIDTHxHEIGHT` for video tracks with known dimensions.
    pub fn resolution(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }
}
