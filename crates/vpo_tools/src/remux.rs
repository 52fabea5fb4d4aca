//! Stream-copy remuxing.
//!
//! Track filtering, reordering and container changes are all remuxes: the
//! tool writes a temp sibling (`.vpo_temp_*`), the temp is fsynced and then
//! renamed over (or next to) the original. On any failure the temp is
//! removed and the original is untouched.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use vpo_model::{TrackInfo, TrackType};

use crate::detection::{ToolKind, ToolRegistry};
use crate::error::ToolError;
use crate::exec::{run_tool, ToolOutput};

const REMUX_TIMEOUT: Duration = Duration::from_secs(3600);

/// One audio stream forced through an encoder during a remux (container
/// changes to MP4 cannot stream-copy TrueHD or DTS-HD).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedAudioTranscode {
    /// Zero-based position among the output's audio streams.
    pub audio_position: usize,
    pub codec: String,
    pub bitrate: String,
}

/// A remux to perform. `removed_track_indices` and `track_order` use the
/// zero-based container indices of the *input* file.
#[derive(Debug, Clone, Default)]
pub struct RemuxRequest {
    pub removed_track_indices: Vec<i64>,
    /// Complete new order of the kept tracks; `None` keeps source order.
    pub track_order: Option<Vec<i64>>,
    /// Target container (`mkv`, `mp4`); `None` keeps the current one.
    pub target_container: Option<String>,
    /// Convert text subtitles to mov_text during an MP4 container change.
    pub convert_text_subtitles: bool,
    /// Audio streams the target container cannot carry as-is.
    pub forced_audio_transcodes: Vec<ForcedAudioTranscode>,
}

/// Result of a successful remux.
#[derive(Debug, Clone)]
pub struct RemuxOutcome {
    /// Final path; differs from the input only on container change.
    pub output_path: PathBuf,
    pub tool_output: ToolOutput,
}

fn temp_path_for(path: &Path, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = format!(".vpo_temp_{}_{stem}.{extension}", std::process::id());
    path.with_file_name(name)
}

fn extension_for_container(container: &str) -> &'static str {
    match container.to_ascii_lowercase().as_str() {
        "mp4" | "mov" => "mp4",
        "webm" => "webm",
        _ => "mkv",
    }
}

/// Build mkvmerge arguments writing `output` from `input`.
pub fn build_mkvmerge_args(
    input: &Path,
    output: &Path,
    tracks: &[TrackInfo],
    request: &RemuxRequest,
) -> Vec<String> {
    let removed: BTreeSet<i64> = request.removed_track_indices.iter().copied().collect();
    let mut args = vec!["-o".to_string(), output.to_string_lossy().into_owned()];

    for track_type in [TrackType::Audio, TrackType::Subtitle] {
        let all: Vec<i64> = tracks
            .iter()
            .filter(|t| t.track_type == track_type)
            .map(|t| t.track_index)
            .collect();
        let kept: Vec<i64> = all
            .iter()
            .copied()
            .filter(|index| !removed.contains(index))
            .collect();
        if kept.len() == all.len() {
            continue;
        }
        let flag = match track_type {
            TrackType::Audio => ("--no-audio", "--audio-tracks"),
            TrackType::Subtitle => ("--no-subtitles", "--subtitle-tracks"),
            _ => unreachable!(),
        };
        if kept.is_empty() {
            args.push(flag.0.to_string());
        } else {
            args.push(flag.1.to_string());
            args.push(
                kept.iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
    }

    // Attachment selection is 1-based in mkvmerge.
    let attachments: Vec<i64> = tracks
        .iter()
        .filter(|t| t.track_type == TrackType::Attachment)
        .map(|t| t.track_index)
        .collect();
    let kept_attachments: Vec<usize> = attachments
        .iter()
        .enumerate()
        .filter(|(_, index)| !removed.contains(*index))
        .map(|(position, _)| position + 1)
        .collect();
    if kept_attachments.len() != attachments.len() {
        if kept_attachments.is_empty() {
            args.push("--no-attachments".to_string());
        } else {
            args.push("--attachments".to_string());
            args.push(
                kept_attachments
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
    }

    if let Some(order) = &request.track_order {
        args.push("--track-order".to_string());
        args.push(
            order
                .iter()
                .map(|index| format!("0:{index}"))
                .collect::<Vec<_>>()
                .join(","),
        );
    }

    args.push(input.to_string_lossy().into_owned());
    args
}

/// Build ffmpeg stream-copy arguments writing `output` from `input`.
pub fn build_ffmpeg_remux_args(
    input: &Path,
    output: &Path,
    tracks: &[TrackInfo],
    request: &RemuxRequest,
) -> Vec<String> {
    let removed: BTreeSet<i64> = request.removed_track_indices.iter().copied().collect();
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
    ];

    // Maps follow the requested order when given, else source order.
    let order: Vec<i64> = match &request.track_order {
        Some(order) => order.clone(),
        None => tracks.iter().map(|t| t.track_index).collect(),
    };
    for index in order {
        if removed.contains(&index) {
            continue;
        }
        args.push("-map".to_string());
        args.push(format!("0:{index}"));
    }

    args.push("-map_metadata".to_string());
    args.push("0".to_string());
    args.push("-c".to_string());
    args.push("copy".to_string());
    if request.convert_text_subtitles {
        args.push("-c:s".to_string());
        args.push("mov_text".to_string());
    }
    for forced in &request.forced_audio_transcodes {
        args.push(format!("-c:a:{}", forced.audio_position));
        args.push(forced.codec.clone());
        args.push(format!("-b:a:{}", forced.audio_position));
        args.push(forced.bitrate.clone());
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

fn fsync(path: &Path) -> Result<(), ToolError> {
    std::fs::File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(|e| ToolError::io("fsync", e))
}

/// Execute a remux with the given tool. Writes a temp sibling, fsyncs, then
/// renames into place. On container change the output keeps the original
/// stem with the new extension and the original file is removed afterwards.
pub async fn run_remux(
    registry: &ToolRegistry,
    tool: ToolKind,
    input: &Path,
    tracks: &[TrackInfo],
    request: &RemuxRequest,
) -> Result<RemuxOutcome, ToolError> {
    let tool_path = registry.require(tool)?;

    let current_extension = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mkv".to_string());
    let target_extension = request
        .target_container
        .as_deref()
        .map(extension_for_container)
        .unwrap_or(current_extension.as_str())
        .to_string();

    let temp = temp_path_for(input, &target_extension);
    let args = match tool {
        ToolKind::Mkvmerge => build_mkvmerge_args(input, &temp, tracks, request),
        ToolKind::Ffmpeg => build_ffmpeg_remux_args(input, &temp, tracks, request),
        other => {
            return Err(ToolError::not_available(
                other.binary_name(),
                "remuxing requires mkvmerge or ffmpeg",
            ))
        }
    };

    let tool_output = match run_tool(tool.binary_name(), tool_path, &args, REMUX_TIMEOUT).await {
        Ok(output) => output,
        Err(e) => {
            if temp.exists() {
                if let Err(cleanup) = std::fs::remove_file(&temp) {
                    warn!("failed to remove temp file {}: {cleanup}", temp.display());
                }
            }
            return Err(e);
        }
    };

    fsync(&temp)?;

    let final_path = input.with_extension(&target_extension);
    std::fs::rename(&temp, &final_path).map_err(|e| ToolError::io("rename", e))?;
    if final_path != input && input.exists() {
        // Container change left the old file behind.
        std::fs::remove_file(input).map_err(|e| ToolError::io("remove original", e))?;
    }
    debug!("remux complete: {}", final_path.display());

    Ok(RemuxOutcome {
        output_path: final_path,
        tool_output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(index: i64, track_type: TrackType) -> TrackInfo {
        TrackInfo::new(1, index, track_type)
    }

    fn sample_tracks() -> Vec<TrackInfo> {
        vec![
            track(0, TrackType::Video),
            track(1, TrackType::Audio),
            track(2, TrackType::Audio),
            track(3, TrackType::Subtitle),
            track(4, TrackType::Attachment),
        ]
    }

    #[test]
    fn mkvmerge_keeps_only_surviving_audio() {
        let request = RemuxRequest {
            removed_track_indices: vec![2],
            ..Default::default()
        };
        let args = build_mkvmerge_args(
            &PathBuf::from("/m/in.mkv"),
            &PathBuf::from("/m/.vpo_temp_in.mkv"),
            &sample_tracks(),
            &request,
        );
        let joined = args.join(" ");
        assert!(joined.contains("--audio-tracks 1"));
        assert!(!joined.contains("--no-audio"));
        assert!(!joined.contains("--subtitle-tracks"));
    }

    #[test]
    fn mkvmerge_no_audio_when_all_removed() {
        let request = RemuxRequest {
            removed_track_indices: vec![1, 2],
            ..Default::default()
        };
        let args = build_mkvmerge_args(
            &PathBuf::from("/m/in.mkv"),
            &PathBuf::from("/m/out.mkv"),
            &sample_tracks(),
            &request,
        );
        assert!(args.contains(&"--no-audio".to_string()));
    }

    #[test]
    fn mkvmerge_track_order_is_zero_prefixed() {
        let request = RemuxRequest {
            track_order: Some(vec![0, 2, 1, 3, 4]),
            ..Default::default()
        };
        let args = build_mkvmerge_args(
            &PathBuf::from("/m/in.mkv"),
            &PathBuf::from("/m/out.mkv"),
            &sample_tracks(),
            &request,
        );
        let position = args.iter().position(|a| a == "--track-order").unwrap();
        assert_eq!(args[position + 1], "0:0,0:2,0:1,0:3,0:4");
    }

    #[test]
    fn mkvmerge_attachment_selection_is_one_based() {
        let request = RemuxRequest {
            removed_track_indices: vec![4],
            ..Default::default()
        };
        let args = build_mkvmerge_args(
            &PathBuf::from("/m/in.mkv"),
            &PathBuf::from("/m/out.mkv"),
            &sample_tracks(),
            &request,
        );
        assert!(args.contains(&"--no-attachments".to_string()));
    }

    #[test]
    fn ffmpeg_remux_maps_kept_tracks_and_copies() {
        let request = RemuxRequest {
            removed_track_indices: vec![2],
            target_container: Some("mp4".to_string()),
            convert_text_subtitles: true,
            ..Default::default()
        };
        let args = build_ffmpeg_remux_args(
            &PathBuf::from("/m/in.mkv"),
            &PathBuf::from("/m/out.mp4"),
            &sample_tracks(),
            &request,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:0"));
        assert!(joined.contains("-map 0:1"));
        assert!(!joined.contains("-map 0:2"));
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-c:s mov_text"));
    }

    #[test]
    fn ffmpeg_remux_forces_incompatible_audio_through_an_encoder() {
        let request = RemuxRequest {
            target_container: Some("mp4".to_string()),
            forced_audio_transcodes: vec![ForcedAudioTranscode {
                audio_position: 0,
                codec: "aac".to_string(),
                bitrate: "256k".to_string(),
            }],
            ..Default::default()
        };
        let args = build_ffmpeg_remux_args(
            &PathBuf::from("/m/in.mkv"),
            &PathBuf::from("/m/out.mp4"),
            &sample_tracks(),
            &request,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:a:0 aac"));
        assert!(joined.contains("-b:a:0 256k"));
    }

    #[test]
    fn temp_path_is_hidden_sibling() {
        let temp = temp_path_for(&PathBuf::from("/media/show/e01.mkv"), "mkv");
        assert_eq!(temp.parent().unwrap(), Path::new("/media/show"));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".vpo_temp_"));
        assert!(name.ends_with("_e01.mkv"));
    }
}
