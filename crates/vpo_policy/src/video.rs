//! Video transcode analysis.
//!
//! A pure decision function over the source video's codec and dimensions:
//! whether to transcode, whether to scale, and what to preserve for HDR
//! content. No probing, no ffmpeg here.

use serde::{Deserialize, Serialize};

use vpo_model::{TrackInfo, TrackType};

use crate::codecs::codecs_equal;
use crate::types::VideoTranscodeConfig;

/// HDR variant detected from colour metadata or the track title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrType {
    None,
    Hdr10,
    Hlg,
    DolbyVision,
}

/// Outcome of the transcode decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeDecision {
    pub needs_transcode: bool,
    pub needs_scale: bool,
    pub target_width: Option<i64>,
    pub target_height: Option<i64>,
    pub hdr_type: HdrType,
    pub reasons: Vec<String>,
}

impl TranscodeDecision {
    pub fn noop() -> Self {
        Self {
            needs_transcode: false,
            needs_scale: false,
            target_width: None,
            target_height: None,
            hdr_type: HdrType::None,
            reasons: Vec::new(),
        }
    }
}

/// Detect HDR from colour transfer, falling back to title keywords.
///
/// `smpte2084` is the PQ transfer function (HDR10); `arib-std-b67` is HLG.
/// Dolby Vision carries no distinctive transfer tag in many containers, so
/// the title is consulted as a last resort.
pub fn detect_hdr(tracks: &[TrackInfo]) -> (HdrType, Option<String>) {
    for track in tracks.iter().filter(|t| t.track_type == TrackType::Video) {
        if let Some(transfer) = track.color_transfer.as_deref() {
            match transfer.to_ascii_lowercase().as_str() {
                "smpte2084" => {
                    return (HdrType::Hdr10, Some("HDR10 (PQ transfer function)".to_string()))
                }
                "arib-std-b67" => {
                    return (HdrType::Hlg, Some("HLG (Hybrid Log-Gamma)".to_string()))
                }
                _ => {}
            }
        }
        if let Some(title) = track.title.as_deref() {
            let lowered = title.to_lowercase();
            if lowered.contains("dolby vision") || lowered.contains("dovi") {
                return (
                    HdrType::DolbyVision,
                    Some("Dolby Vision (from title)".to_string()),
                );
            }
            if lowered.contains("hlg") {
                return (HdrType::Hlg, Some("HLG (title)".to_string()));
            }
            if lowered.contains("hdr") {
                return (HdrType::Hdr10, Some("HDR content (title)".to_string()));
            }
        }
    }
    (HdrType::None, None)
}

/// ffmpeg arguments that keep BT.2020 primaries and the PQ/HLG transfer
/// intact through a transcode. Tone mapping is deliberately not performed.
pub fn hdr_preservation_args(hdr_type: HdrType) -> Vec<String> {
    let color_trc = match hdr_type {
        HdrType::None => return Vec::new(),
        HdrType::Hdr10 | HdrType::DolbyVision => "smpte2084",
        HdrType::Hlg => "arib-std-b67",
    };
    vec![
        "-color_primaries".to_string(),
        "bt2020".to_string(),
        "-color_trc".to_string(),
        color_trc.to_string(),
        "-colorspace".to_string(),
        "bt2020nc".to_string(),
    ]
}

fn round_even(value: i64) -> i64 {
    // Encoders require even dimensions; odd values round up.
    value + (value & 1)
}

/// Decide whether (and how) the primary video track needs transcoding.
pub fn analyze_video(tracks: &[TrackInfo], config: &VideoTranscodeConfig) -> TranscodeDecision {
    let Some(video) = tracks.iter().find(|t| t.track_type == TrackType::Video) else {
        return TranscodeDecision::noop();
    };

    let mut decision = TranscodeDecision::noop();
    let (hdr_type, hdr_description) = detect_hdr(tracks);
    decision.hdr_type = hdr_type;

    let codec = video.codec.as_deref().unwrap_or("");
    if !codec.is_empty() && !codecs_equal(TrackType::Video, codec, &config.target_codec) {
        decision.needs_transcode = true;
        decision
            .reasons
            .push(format!("codec {codec} != target {}", config.target_codec));
    }

    if let (Some(width), Some(height)) = (video.width, video.height) {
        let width_over = config.max_width.map_or(false, |max| width > max);
        let height_over = config.max_height.map_or(false, |max| height > max);
        if width_over || height_over {
            // Scale to fit inside the bounding box, preserving aspect ratio
            // and rounding to even dimensions.
            let width_ratio = config
                .max_width
                .map(|max| max as f64 / width as f64)
                .unwrap_or(f64::INFINITY);
            let height_ratio = config
                .max_height
                .map(|max| max as f64 / height as f64)
                .unwrap_or(f64::INFINITY);
            let ratio = width_ratio.min(height_ratio);

            decision.needs_transcode = true;
            decision.needs_scale = true;
            decision.target_width = Some(round_even((width as f64 * ratio).round() as i64));
            decision.target_height = Some(round_even((height as f64 * ratio).round() as i64));
            decision.reasons.push(format!(
                "resolution {}x{} exceeds {}x{}",
                width,
                height,
                config.max_width.map_or("-".to_string(), |w| w.to_string()),
                config.max_height.map_or("-".to_string(), |h| h.to_string()),
            ));

            if hdr_type != HdrType::None {
                if let Some(description) = &hdr_description {
                    decision
                        .reasons
                        .push(format!("scaling HDR content ({description}); preserving metadata"));
                }
            }
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(codec: &str, width: i64, height: i64) -> TrackInfo {
        let mut t = TrackInfo::new(1, 0, TrackType::Video);
        t.codec = Some(codec.to_string());
        t.width = Some(width);
        t.height = Some(height);
        t
    }

    fn config(target: &str, max_width: Option<i64>, max_height: Option<i64>) -> VideoTranscodeConfig {
        VideoTranscodeConfig {
            target_codec: target.to_string(),
            max_width,
            max_height,
        }
    }

    #[test]
    fn matching_codec_within_bounds_is_noop() {
        let tracks = vec![video("hevc", 1920, 1080)];
        let decision = analyze_video(&tracks, &config("h265", None, None));
        assert!(!decision.needs_transcode);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn codec_mismatch_uses_canonical_comparison() {
        let tracks = vec![video("h264", 1920, 1080)];
        let decision = analyze_video(&tracks, &config("hevc", None, None));
        assert!(decision.needs_transcode);
        assert!(!decision.needs_scale);
    }

    #[test]
    fn oversize_scales_preserving_aspect_and_even_dims() {
        // 3840x2160 down into a 1920 wide box -> 1920x1080.
        let tracks = vec![video("hevc", 3840, 2160)];
        let decision = analyze_video(&tracks, &config("hevc", Some(1920), Some(1080)));
        assert!(decision.needs_scale);
        assert_eq!(decision.target_width, Some(1920));
        assert_eq!(decision.target_height, Some(1080));
    }

    #[test]
    fn odd_scaled_dimensions_round_to_even() {
        // 1998x1080 scaled into 1280 wide: height 691.9 -> 692.
        let tracks = vec![video("hevc", 1998, 1080)];
        let decision = analyze_video(&tracks, &config("hevc", Some(1280), None));
        assert_eq!(decision.target_width, Some(1280));
        let height = decision.target_height.unwrap();
        assert_eq!(height % 2, 0);
        assert!((height - 692).abs() <= 2);
    }

    #[test]
    fn hdr10_detected_from_transfer() {
        let mut t = video("hevc", 3840, 2160);
        t.color_transfer = Some("smpte2084".to_string());
        let (hdr, description) = detect_hdr(&[t]);
        assert_eq!(hdr, HdrType::Hdr10);
        assert!(description.unwrap().contains("PQ"));
    }

    #[test]
    fn hlg_detected_from_transfer() {
        let mut t = video("hevc", 3840, 2160);
        t.color_transfer = Some("arib-std-b67".to_string());
        assert_eq!(detect_hdr(&[t]).0, HdrType::Hlg);
    }

    #[test]
    fn dolby_vision_detected_from_title() {
        let mut t = video("hevc", 3840, 2160);
        t.title = Some("Feature (Dolby Vision)".to_string());
        assert_eq!(detect_hdr(&[t]).0, HdrType::DolbyVision);
    }

    #[test]
    fn hdr_preservation_args_by_type() {
        assert!(hdr_preservation_args(HdrType::None).is_empty());
        let hdr10 = hdr_preservation_args(HdrType::Hdr10);
        assert!(hdr10.contains(&"smpte2084".to_string()));
        assert!(hdr10.contains(&"bt2020".to_string()));
        let hlg = hdr_preservation_args(HdrType::Hlg);
        assert!(hlg.contains(&"arib-std-b67".to_string()));
    }

    #[test]
    fn no_video_track_is_noop() {
        let decision = analyze_video(&[], &config("hevc", Some(1920), None));
        assert_eq!(decision, TranscodeDecision::noop());
    }
}
