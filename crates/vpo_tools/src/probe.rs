//! Container introspection via ffprobe.
//!
//! `ffprobe -print_format json -show_format -show_streams` is the only
//! invocation; everything else is parsing. Pure read, no side effects on
//! the file.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use vpo_model::{TrackInfo, TrackType};

use crate::detection::{ToolKind, ToolRegistry};
use crate::error::ToolError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Parsed introspection result.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub container: Option<String>,
    pub duration_seconds: Option<f64>,
    pub tracks: Vec<TrackInfo>,
    pub container_tags: HashMap<String, String>,
    /// Non-fatal oddities (unknown stream types, missing duration).
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: i64,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    channels: Option<i64>,
    channel_layout: Option<String>,
    r_frame_rate: Option<String>,
    color_transfer: Option<String>,
    color_primaries: Option<String>,
    color_space: Option<String>,
    color_range: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, i64>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

fn tag_get<'a>(tags: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Convert raw ffprobe JSON into a [`ProbeResult`].
///
/// Stream indices are renumbered per file in declaration order, matching
/// the `track_index` the rest of the system uses. Unknown stream types are
/// reported as warnings and skipped.
pub fn parse_probe_output(raw: &str) -> Result<ProbeResult, ToolError> {
    let parsed: FfprobeOutput = serde_json::from_str(raw).map_err(|e| ToolError::Parse {
        tool: "ffprobe".to_string(),
        message: e.to_string(),
    })?;

    let mut result = ProbeResult::default();

    if let Some(format) = parsed.format {
        result.container = format.format_name;
        result.duration_seconds = format.duration.as_deref().and_then(|d| d.parse().ok());
        result.container_tags = format.tags;
    }
    if result.duration_seconds.is_none() {
        result
            .warnings
            .push("container reports no duration".to_string());
    }

    let mut next_index: i64 = 0;
    for stream in parsed.streams {
        let track_type = match stream.codec_type.as_deref() {
            Some("video") => TrackType::Video,
            Some("audio") => TrackType::Audio,
            Some("subtitle") => TrackType::Subtitle,
            Some("attachment") => TrackType::Attachment,
            other => {
                result.warnings.push(format!(
                    "stream {} has unsupported type {:?}",
                    stream.index, other
                ));
                continue;
            }
        };

        let mut track = TrackInfo::new(0, next_index, track_type);
        next_index += 1;
        track.codec = stream.codec_name;
        track.language = tag_get(&stream.tags, "language").map(|s| s.to_string());
        track.title = tag_get(&stream.tags, "title").map(|s| s.to_string());
        track.is_default = stream.disposition.get("default").copied().unwrap_or(0) != 0;
        track.is_forced = stream.disposition.get("forced").copied().unwrap_or(0) != 0;
        track.channels = stream.channels;
        track.channel_layout = stream.channel_layout;
        track.width = stream.width;
        track.height = stream.height;
        track.frame_rate = stream.r_frame_rate;
        track.color_transfer = stream.color_transfer;
        track.color_primaries = stream.color_primaries;
        track.color_space = stream.color_space;
        track.color_range = stream.color_range;
        track.duration_seconds = stream.duration.as_deref().and_then(|d| d.parse().ok());
        result.tracks.push(track);
    }

    Ok(result)
}

/// Run the introspector against a file.
pub async fn probe_file(registry: &ToolRegistry, path: &Path) -> Result<ProbeResult, ToolError> {
    let ffprobe = registry.require(ToolKind::Ffprobe)?;

    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path.as_os_str())
            .output(),
    )
    .await
    .map_err(|_| ToolError::Timeout {
        tool: "ffprobe".to_string(),
        seconds: PROBE_TIMEOUT.as_secs(),
    })?
    .map_err(|e| ToolError::io("ffprobe", e))?;

    if !output.status.success() {
        return Err(ToolError::ExitFailure {
            tool: "ffprobe".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "hevc",
                "codec_type": "video",
                "width": 3840,
                "height": 2160,
                "r_frame_rate": "24000/1001",
                "color_transfer": "smpte2084",
                "disposition": {"default": 1, "forced": 0},
                "tags": {"language": "und"}
            },
            {
                "index": 1,
                "codec_name": "eac3",
                "codec_type": "audio",
                "channels": 6,
                "channel_layout": "5.1(side)",
                "disposition": {"default": 1, "forced": 0},
                "tags": {"language": "eng", "title": "Surround 5.1"}
            },
            {
                "index": 2,
                "codec_name": "subrip",
                "codec_type": "subtitle",
                "disposition": {"default": 0, "forced": 1},
                "tags": {"LANGUAGE": "ger"}
            },
            {
                "index": 3,
                "codec_type": "data",
                "disposition": {}
            }
        ],
        "format": {
            "format_name": "matroska,webm",
            "duration": "5400.012000",
            "tags": {"title": "Feature", "encoder": "libebml"}
        }
    }"#;

    #[test]
    fn parses_streams_and_format() {
        let result = parse_probe_output(SAMPLE).unwrap();
        assert_eq!(result.container.as_deref(), Some("matroska,webm"));
        assert!((result.duration_seconds.unwrap() - 5400.012).abs() < 1e-6);
        assert_eq!(result.tracks.len(), 3);

        let video = &result.tracks[0];
        assert_eq!(video.track_type, TrackType::Video);
        assert_eq!(video.width, Some(3840));
        assert_eq!(video.color_transfer.as_deref(), Some("smpte2084"));
        assert!(video.is_default);

        let audio = &result.tracks[1];
        assert_eq!(audio.channels, Some(6));
        assert_eq!(audio.title.as_deref(), Some("Surround 5.1"));

        // Tag keys are matched case-insensitively.
        let subtitle = &result.tracks[2];
        assert_eq!(subtitle.language.as_deref(), Some("ger"));
        assert!(subtitle.is_forced);

        // The data stream surfaces as a warning, not a track.
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("unsupported type"));
    }

    #[test]
    fn track_indices_are_renumbered_contiguously() {
        let result = parse_probe_output(SAMPLE).unwrap();
        let indices: Vec<i64> = result.tracks.iter().map(|t| t.track_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn missing_duration_is_a_warning() {
        let raw = r#"{"streams": [], "format": {"format_name": "mp4"}}"#;
        let result = parse_probe_output(raw).unwrap();
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("no duration")));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(matches!(
            parse_probe_output("not json"),
            Err(ToolError::Parse { .. })
        ));
    }
}
