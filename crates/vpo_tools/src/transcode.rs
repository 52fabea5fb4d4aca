//! Transcoding via ffmpeg with live progress.
//!
//! The transcoder is the only adapter that streams: `-progress pipe:1`
//! emits `key=value` blocks on stdout which are parsed into
//! [`ProgressTick`]s and handed to the caller's callback as they arrive.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use vpo_policy::synthesis::SynthesisOperation;
use vpo_policy::video::{hdr_preservation_args, HdrType, TranscodeDecision};

use crate::detection::{ToolKind, ToolRegistry};
use crate::error::ToolError;
use crate::progress::{ProgressParser, ProgressTick};

/// A transcode invocation, already reduced to argument fragments.
#[derive(Debug, Clone, Default)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Codec/filter arguments between input and output.
    pub args: Vec<String>,
    /// Thread count for the encoder (worker `cpu_cores` setting).
    pub threads: Option<u32>,
    /// Kill the child after this long; `None` means no limit.
    pub timeout: Option<Duration>,
}

/// Build the video-codec argument fragment for a planned video transcode.
pub fn build_video_args(
    decision: &TranscodeDecision,
    target_codec: &str,
    hdr_type: HdrType,
) -> Vec<String> {
    let encoder = match target_codec.to_ascii_lowercase().as_str() {
        "hevc" | "h265" | "x265" => "libx265",
        "h264" | "avc" | "x264" => "libx264",
        "av1" => "libsvtav1",
        other => return vec!["-c:v".to_string(), other.to_string()],
    };

    let mut args = vec!["-c:v".to_string(), encoder.to_string()];
    if decision.needs_scale {
        if let (Some(width), Some(height)) = (decision.target_width, decision.target_height) {
            args.push("-vf".to_string());
            args.push(format!("scale={width}:{height}"));
        }
    }
    args.extend(hdr_preservation_args(hdr_type));
    args.push("-c:a".to_string());
    args.push("copy".to_string());
    args.push("-c:s".to_string());
    args.push("copy".to_string());
    args
}

/// Build the argument fragment that appends one synthesized audio track.
///
/// All existing streams are mapped and copied; the source audio track is
/// mapped a second time and encoded to the target codec. `new_track_audio
/// _position` is the zero-based index the new track gets among the output's
/// audio streams.
pub fn build_synthesis_args(
    operation: &SynthesisOperation,
    new_track_audio_position: usize,
) -> Vec<String> {
    let mut args = vec![
        "-map".to_string(),
        "0".to_string(),
        "-map".to_string(),
        format!("0:{}", operation.source_track_index),
        "-c".to_string(),
        "copy".to_string(),
        format!("-c:a:{new_track_audio_position}"),
        operation.target_codec.ffmpeg_encoder().to_string(),
    ];

    if let Some(bitrate) = operation.target_bitrate {
        args.push(format!("-b:a:{new_track_audio_position}"));
        args.push(format!("{}k", bitrate / 1000));
    }
    match &operation.downmix_filter {
        Some(filter) => {
            args.push(format!("-filter:a:{new_track_audio_position}"));
            args.push(filter.clone());
        }
        None if operation.target_channels != operation.source_channels => {
            args.push(format!("-ac:a:{new_track_audio_position}"));
            args.push(operation.target_channels.to_string());
        }
        None => {}
    }
    args.push(format!("-metadata:s:a:{new_track_audio_position}"));
    args.push(format!("language={}", operation.target_language));
    if !operation.target_title.is_empty() {
        args.push(format!("-metadata:s:a:{new_track_audio_position}"));
        args.push(format!("title={}", operation.target_title));
    }

    args
}

/// Run a transcode, streaming progress ticks to `on_progress`.
pub async fn run_transcode<F>(
    registry: &ToolRegistry,
    request: &TranscodeRequest,
    mut on_progress: F,
) -> Result<(), ToolError>
where
    F: FnMut(ProgressTick),
{
    let ffmpeg = registry.require(ToolKind::Ffmpeg)?;

    let mut command = Command::new(ffmpeg);
    command
        .arg("-y")
        .arg("-nostats")
        .arg("-i")
        .arg(request.input.as_os_str());
    command.args(&request.args);
    if let Some(threads) = request.threads {
        command.arg("-threads").arg(threads.to_string());
    }
    command
        .arg("-progress")
        .arg("pipe:1")
        .arg(request.output.as_os_str())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // A timed-out child is reaped when the driving future drops.
        .kill_on_drop(true);

    debug!("spawning ffmpeg transcode of {}", request.input.display());
    let mut child = command
        .spawn()
        .map_err(|e| ToolError::io("ffmpeg", e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Stderr drains on its own task so a full pipe can never stall ffmpeg.
    let stderr_task = tokio::spawn(async move {
        let mut captured = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
        captured
    });

    // Progress is delivered live: read stdout to EOF (blocks of key=value
    // lines), emitting a tick per completed block, then reap the child.
    // The final block before exit is therefore never dropped.
    let drive = async {
        let mut parser = ProgressParser::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(tick) = parser.feed(&line) {
                    on_progress(tick);
                }
            }
        }
        child.wait().await.map_err(|e| ToolError::io("ffmpeg", e))
    };

    let status = match request.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, drive).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("ffmpeg timed out after {}s, killing", timeout.as_secs());
                return Err(ToolError::Timeout {
                    tool: "ffmpeg".to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        },
        None => drive.await?,
    };

    if !status.success() {
        let stderr = stderr_task.await.unwrap_or_default();
        return Err(ToolError::ExitFailure {
            tool: "ffmpeg".to_string(),
            code: status.code().unwrap_or(-1),
            stderr,
        });
    }

    Ok(())
}

/// Default temp output path for a transcode of `input`.
pub fn transcode_temp_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let extension = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mkv".to_string());
    input.with_file_name(format!(
        ".vpo_temp_{}_{stem}.{extension}",
        std::process::id()
    ))
}
