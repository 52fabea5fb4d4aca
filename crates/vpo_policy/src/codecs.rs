//! Codec canonicalisation and compatibility tables.
//!
//! Introspectors, containers and policies all spell codecs differently
//! (`h265`/`hevc`/`hvc1`); every comparison goes through the canonical form.

use vpo_model::TrackType;

use crate::types::AudioCodec;

const VIDEO_ALIASES: &[(&str, &[&str])] = &[
    ("hevc", &["h265", "x265", "hvc1", "hev1"]),
    ("h264", &["avc", "avc1", "x264"]),
    ("av1", &["av01"]),
    ("vc1", &["wmv3"]),
    ("mpeg2video", &["mpeg2"]),
    ("mpeg4", &["xvid", "divx"]),
];

const AUDIO_ALIASES: &[(&str, &[&str])] = &[
    ("aac", &["mp4a", "aac_latm"]),
    ("ac3", &["dolby_digital"]),
    ("eac3", &["ec-3", "ddp", "dolby_digital_plus"]),
    ("dts", &["dca"]),
    ("opus", &["libopus"]),
    ("mp3", &["mp3float"]),
];

const SUBTITLE_ALIASES: &[(&str, &[&str])] = &[
    ("subrip", &["srt"]),
    ("ass", &["ssa"]),
    ("hdmv_pgs_subtitle", &["pgs", "pgssub"]),
    ("dvd_subtitle", &["dvdsub", "vobsub"]),
];

/// Map a codec name to its canonical spelling for the given track type.
/// Unknown codecs are returned lowercased.
pub fn canonical_codec(track_type: TrackType, codec: &str) -> String {
    let lowered = codec.trim().to_ascii_lowercase();
    let table = match track_type {
        TrackType::Video => VIDEO_ALIASES,
        TrackType::Audio => AUDIO_ALIASES,
        TrackType::Subtitle => SUBTITLE_ALIASES,
        TrackType::Attachment => return lowered,
    };
    for (canonical, aliases) in table {
        if lowered == *canonical || aliases.contains(&lowered.as_str()) {
            return (*canonical).to_string();
        }
    }
    lowered
}

/// True when two codec names denote the same codec.
pub fn codecs_equal(track_type: TrackType, a: &str, b: &str) -> bool {
    canonical_codec(track_type, a) == canonical_codec(track_type, b)
}

// ============================================================================
// MP4 compatibility
// ============================================================================

pub const MP4_COMPATIBLE_VIDEO_CODECS: &[&str] = &["h264", "hevc", "av1", "mpeg4"];
pub const MP4_COMPATIBLE_AUDIO_CODECS: &[&str] =
    &["aac", "ac3", "eac3", "mp3", "flac", "opus", "alac"];
pub const MP4_COMPATIBLE_SUBTITLE_CODECS: &[&str] = &["mov_text"];
/// Text subtitles that can be converted to `mov_text` on container change.
pub const MP4_CONVERTIBLE_SUBTITLE_CODECS: &[&str] = &["subrip", "srt", "ass", "ssa"];
/// Bitmap subtitles that cannot be carried into MP4.
pub const BITMAP_SUBTITLE_CODECS: &[&str] = &["hdmv_pgs_subtitle", "dvd_subtitle"];

/// Target codec and bitrate for an audio transcode forced by a container
/// change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeTarget {
    pub codec: &'static str,
    pub bitrate: &'static str,
}

/// Default target when an MP4-incompatible audio codec must be transcoded.
pub const DEFAULT_AUDIO_TRANSCODE_TARGET: TranscodeTarget = TranscodeTarget {
    codec: "aac",
    bitrate: "192k",
};

/// Per-source-codec transcode targets for MP4 container changes. Lossless
/// and HD formats get more headroom than the default.
pub fn mp4_audio_transcode_target(source_codec: &str) -> TranscodeTarget {
    match canonical_codec(TrackType::Audio, source_codec).as_str() {
        "truehd" => TranscodeTarget {
            codec: "aac",
            bitrate: "256k",
        },
        "dts_hd_ma" | "dts-hd ma" | "dtshd" => TranscodeTarget {
            codec: "aac",
            bitrate: "320k",
        },
        _ => DEFAULT_AUDIO_TRANSCODE_TARGET,
    }
}

/// Whether an audio track must be transcoded when the container becomes MP4.
pub fn mp4_requires_audio_transcode(codec: &str) -> bool {
    let canonical = canonical_codec(TrackType::Audio, codec);
    !MP4_COMPATIBLE_AUDIO_CODECS.contains(&canonical.as_str())
}

// ============================================================================
// Synthesis bitrate defaults
// ============================================================================

/// Default bitrate (bits/second) for a synthesis target, by codec and
/// channel count. Anything above stereo uses the surround row. `None` means
/// lossless, no bitrate argument.
pub fn default_bitrate(codec: AudioCodec, channels: u32) -> Option<u32> {
    let surround = channels > 2;
    match codec {
        AudioCodec::Eac3 => Some(if surround { 640_000 } else { 384_000 }),
        AudioCodec::Ac3 => Some(if surround { 448_000 } else { 192_000 }),
        AudioCodec::Aac => Some(if surround { 384_000 } else { 192_000 }),
        AudioCodec::Opus => Some(if surround { 256_000 } else { 128_000 }),
        AudioCodec::Flac => None,
    }
}

// ============================================================================
// Downmix
// ============================================================================

/// Refuse upmixing: a synthesized track may have at most as many channels as
/// its source.
pub fn validate_downmix(source_channels: u32, target_channels: u32) -> Result<(), String> {
    if target_channels > source_channels {
        return Err(format!(
            "would upmix from {source_channels} to {target_channels} channels"
        ));
    }
    Ok(())
}

/// The ffmpeg `pan` filter for a known downmix pair, or `None` when the
/// channel counts are equal or no curated filter exists (the transcoder then
/// falls back to `-ac`).
pub fn downmix_filter(source_channels: u32, target_channels: u32) -> Option<String> {
    match (source_channels, target_channels) {
        (s, t) if s == t => None,
        (6, 2) | (8, 2) => Some(
            "pan=stereo|FL=0.5*FC+0.707*FL+0.707*BL+0.5*LFE|FR=0.5*FC+0.707*FR+0.707*BR+0.5*LFE"
                .to_string(),
        ),
        (8, 6) => Some(
            "pan=5.1|FL=FL+0.707*SL|FR=FR+0.707*SR|FC=FC|LFE=LFE|BL=BL+0.707*SL|BR=BR+0.707*SR"
                .to_string(),
        ),
        _ => None,
    }
}
