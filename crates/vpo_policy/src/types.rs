//! In-memory form of the policy document.
//!
//! The JSON rendering of these types is the canonical serialized policy: it
//! is what `jobs.policy_json` carries and what [`PolicyDocument::from_json`]
//! parses. Validation is separate (`validation`); deserializing alone does
//! not prove a document sane.

use serde::{Deserialize, Serialize};

use vpo_model::{OnErrorMode, TrackType};

use crate::error::PolicyError;

/// Lowest schema version this build understands.
pub const MIN_SCHEMA_VERSION: u32 = 12;

/// Phase names that cannot be used by policy authors.
pub const RESERVED_PHASE_NAMES: &[&str] = &["all", "none", "default"];

/// A complete, versioned policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub schema_version: u32,
    #[serde(default)]
    pub config: GlobalConfig,
    pub phases: Vec<Phase>,
}

impl PolicyDocument {
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, PolicyError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Policy-wide configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Preferred languages, most preferred first.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Regex patterns identifying commentary tracks by title.
    #[serde(default)]
    pub commentary_patterns: Vec<String>,
    #[serde(default)]
    pub on_error: OnErrorMode,
}

/// One named step of a policy: a bundle of optional operations plus gating.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Phase {
    pub name: String,
    pub container: Option<ContainerConfig>,
    pub audio_filter: Option<AudioFilterConfig>,
    pub subtitle_filter: Option<SubtitleFilterConfig>,
    pub attachment_filter: Option<AttachmentFilterConfig>,
    pub track_order: Option<Vec<TrackOrderSlot>>,
    pub default_flags: Option<DefaultFlagsConfig>,
    pub conditional: Option<Vec<ConditionalRule>>,
    pub audio_synthesis: Option<AudioSynthesisConfig>,
    pub video_transcode: Option<VideoTranscodeConfig>,
    pub audio_transcode: Option<AudioTranscodeConfig>,
    pub transcription: Option<TranscriptionConfig>,
    pub file_timestamp: Option<FileTimestampConfig>,
    pub audio_actions: Option<TrackActionsConfig>,
    pub subtitle_actions: Option<TrackActionsConfig>,
    /// Skip the phase when ANY of these holds.
    pub skip_when: Option<Vec<Condition>>,
    /// Run only if every named earlier phase modified the file.
    pub depends_on: Option<Vec<String>>,
    pub run_if: Option<RunIfCondition>,
    /// Per-phase override of the global on-error mode.
    pub on_error: Option<OnErrorMode>,
}

/// Gate on an earlier phase having modified the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIfCondition {
    pub phase_modified: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Target container, e.g. `mkv` or `mp4`.
    pub target: String,
}

/// Fallback when audio filtering would keep fewer than `minimum` tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    Error,
    KeepAll,
    KeepFirst,
    /// Keep every track matching the language of the first audio track.
    ContentLanguage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFilterConfig {
    /// Language keep-list (cross-standard matching).
    pub languages: Vec<String>,
    pub minimum: u32,
    pub fallback: Option<FallbackMode>,
    pub keep_commentary: bool,
    pub keep_music_tracks: bool,
    pub exclude_music_from_language_filter: bool,
    pub keep_sfx_tracks: bool,
    pub exclude_sfx_from_language_filter: bool,
}

impl Default for AudioFilterConfig {
    fn default() -> Self {
        Self {
            languages: Vec::new(),
            minimum: 1,
            fallback: None,
            keep_commentary: true,
            keep_music_tracks: true,
            exclude_music_from_language_filter: false,
            keep_sfx_tracks: true,
            exclude_sfx_from_language_filter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleFilterConfig {
    /// `None` keeps everything (subject to `remove_all`).
    pub languages: Option<Vec<String>>,
    pub remove_all: bool,
    pub preserve_forced: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentFilterConfig {
    pub remove_all: bool,
}

/// Symbolic slot in a track-order sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackOrderSlot {
    Video,
    AudioMain,
    AudioAlternate,
    AudioCommentary,
    SubtitleMain,
    SubtitleAlternate,
    Attachment,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultFlagsConfig {
    /// Language whose first audio track becomes default.
    pub audio_language: Option<String>,
    /// Language whose first subtitle track becomes default.
    pub subtitle_language: Option<String>,
    /// Clear the default flag on every other track of the same type.
    pub clear_others: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub name: String,
    pub when: Condition,
    #[serde(default)]
    pub then_actions: Vec<ConditionalAction>,
    #[serde(default)]
    pub else_actions: Vec<ConditionalAction>,
}

// ============================================================================
// Condition algebra
// ============================================================================

/// Numeric comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl ComparisonOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
        }
    }

    pub fn compare(&self, actual: i64, expected: i64) -> bool {
        match self {
            Self::Eq => actual == expected,
            Self::Lt => actual < expected,
            Self::Lte => actual <= expected,
            Self::Gt => actual > expected,
            Self::Gte => actual >= expected,
        }
    }
}

/// Either an exact value or an operator comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberMatch {
    Exact(i64),
    Compare {
        operator: ComparisonOperator,
        value: i64,
    },
}

impl NumberMatch {
    pub fn matches(&self, actual: i64) -> bool {
        match self {
            Self::Exact(v) => actual == *v,
            Self::Compare { operator, value } => operator.compare(actual, *value),
        }
    }
}

/// Title matcher: bare string means case-insensitive substring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TitleMatch {
    Contains(String),
    Spec {
        #[serde(default)]
        contains: Option<String>,
        #[serde(default)]
        regex: Option<String>,
    },
}

/// Per-track filter criteria; unspecified fields always match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackFilters {
    pub language: Option<Vec<String>>,
    /// Lowercased exact match; `pcm_*` style trailing wildcard allowed.
    pub codec: Option<Vec<String>>,
    pub is_default: Option<bool>,
    pub is_forced: Option<bool>,
    pub channels: Option<NumberMatch>,
    pub width: Option<NumberMatch>,
    pub height: Option<NumberMatch>,
    pub title: Option<TitleMatch>,
}

/// Operator set for metadata conditions. `Exists` takes no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataOperator {
    #[default]
    Eq,
    Neq,
    Contains,
    Lt,
    Lte,
    Gt,
    Gte,
    Exists,
}

impl MetadataOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Contains => "contains",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Exists => "exists",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Lt | Self::Lte | Self::Gt | Self::Gte)
    }
}

fn default_threshold() -> f64 {
    0.05
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.5
}

/// The condition algebra. A closed sum; the evaluator branches on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Exists {
        track_type: TrackType,
        #[serde(default)]
        filters: TrackFilters,
    },
    Count {
        track_type: TrackType,
        #[serde(default)]
        filters: TrackFilters,
        operator: ComparisonOperator,
        value: i64,
    },
    AudioIsMultiLanguage {
        #[serde(default)]
        track_index: Option<i64>,
        #[serde(default)]
        primary_language: Option<String>,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    PluginMetadata {
        plugin: String,
        field: String,
        #[serde(default)]
        value: Option<serde_json::Value>,
        #[serde(default)]
        operator: MetadataOperator,
    },
    ContainerMetadata {
        field: String,
        #[serde(default)]
        value: Option<serde_json::Value>,
        #[serde(default)]
        operator: MetadataOperator,
    },
    IsOriginal {
        #[serde(default = "default_true")]
        value: bool,
        #[serde(default = "default_confidence")]
        min_confidence: f64,
        #[serde(default)]
        language: Option<String>,
    },
    IsDubbed {
        #[serde(default = "default_true")]
        value: bool,
        #[serde(default = "default_confidence")]
        min_confidence: f64,
        #[serde(default)]
        language: Option<String>,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

// ============================================================================
// Conditional actions
// ============================================================================

/// What a `skip` action suppresses for the rest of the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipTarget {
    VideoTranscode,
    AudioTranscode,
    TrackFilter,
}

/// Reference to a plugin-provided metadata field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginFieldRef {
    pub plugin: String,
    pub field: String,
}

/// Side effects a conditional rule can trigger. Message templates accept
/// `{filename}`, `{path}` and `{rule_name}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConditionalAction {
    Skip {
        target: SkipTarget,
    },
    Warn {
        message: String,
    },
    Fail {
        message: String,
    },
    SetForced {
        track_type: TrackType,
        #[serde(default)]
        language: Option<String>,
        value: bool,
    },
    SetDefault {
        track_type: TrackType,
        #[serde(default)]
        language: Option<String>,
        value: bool,
    },
    SetLanguage {
        track_type: TrackType,
        #[serde(default)]
        new_language: Option<String>,
        #[serde(default)]
        from_plugin_metadata: Option<PluginFieldRef>,
        #[serde(default)]
        match_language: Option<String>,
    },
}

// ============================================================================
// Audio synthesis
// ============================================================================

/// Target audio codec for synthesis. `ffmpeg_encoder` names the encoder the
/// transcoder must have available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Ac3,
    Eac3,
    Opus,
    Flac,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
            Self::Opus => "opus",
            Self::Flac => "flac",
        }
    }

    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
            Self::Opus => "libopus",
            Self::Flac => "flac",
        }
    }
}

/// Channel count, numeric or by common name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSpec {
    Count(u32),
    Named(String),
}

impl ChannelSpec {
    /// Resolve to a channel count. Unknown names resolve to stereo.
    pub fn channel_count(&self) -> u32 {
        match self {
            Self::Count(n) => *n,
            Self::Named(name) => match name.to_ascii_lowercase().as_str() {
                "mono" => 1,
                "stereo" => 2,
                "5.1" => 6,
                "7.1" => 8,
                _ => 2,
            },
        }
    }
}

/// Channel preference within a source-selection criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelPreference {
    Exact(u32),
    Keyword(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedChannelPreference {
    Max,
    Min,
    Exact(u32),
}

impl ChannelPreference {
    pub fn resolve(&self) -> Option<ResolvedChannelPreference> {
        match self {
            Self::Exact(n) => Some(ResolvedChannelPreference::Exact(*n)),
            Self::Keyword(k) => match k.to_ascii_lowercase().as_str() {
                "max" => Some(ResolvedChannelPreference::Max),
                "min" => Some(ResolvedChannelPreference::Min),
                _ => None,
            },
        }
    }
}

/// One step of the source-track preference list. Criteria narrow the
/// candidate set in order; a criterion that would empty it is skipped.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceCriterion {
    pub language: Option<Vec<String>>,
    pub not_commentary: Option<bool>,
    pub channels: Option<ChannelPreference>,
    pub codec: Option<Vec<String>>,
}

/// Where the synthesized track lands in the audio track order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionSpec {
    /// 1-based absolute position.
    Absolute(u32),
    /// `after_source` or `end`.
    Keyword(String),
}

impl Default for PositionSpec {
    fn default() -> Self {
        Self::Keyword("end".to_string())
    }
}

fn default_inherit() -> String {
    "inherit".to_string()
}

/// One audio track to synthesize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisTrackDefinition {
    pub name: String,
    pub codec: AudioCodec,
    pub channels: ChannelSpec,
    #[serde(default)]
    pub source_prefer: Vec<PreferenceCriterion>,
    /// Bits per second; `None` uses the codec/channel default table.
    #[serde(default)]
    pub bitrate: Option<u32>,
    #[serde(default)]
    pub create_if: Option<Condition>,
    /// `inherit` copies from the source track.
    #[serde(default = "default_inherit")]
    pub title: String,
    #[serde(default = "default_inherit")]
    pub language: String,
    #[serde(default)]
    pub position: PositionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSynthesisConfig {
    pub tracks: Vec<SynthesisTrackDefinition>,
}

// ============================================================================
// Transcode, transcription, timestamps, track actions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoTranscodeConfig {
    /// Canonicalised before comparison (h265 ≡ hevc, …).
    pub target_codec: String,
    pub max_width: Option<i64>,
    pub max_height: Option<i64>,
}

impl Default for VideoTranscodeConfig {
    fn default() -> Self {
        Self {
            target_codec: "hevc".to_string(),
            max_width: None,
            max_height: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioTranscodeConfig {
    pub target_codec: String,
    /// e.g. `192k`; `None` uses the per-codec default table.
    pub bitrate: Option<String>,
    /// Restrict to source tracks of these codecs; empty means all.
    pub only_codecs: Vec<String>,
}

impl Default for AudioTranscodeConfig {
    fn default() -> Self {
        Self {
            target_codec: "aac".to_string(),
            bitrate: None,
            only_codecs: Vec::new(),
        }
    }
}

/// Request track transcription through an external plugin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTimestampConfig {
    /// Restore the pre-phase modification time after mutating operations.
    pub preserve_modification_time: bool,
}

/// Bulk flag clearing for audio or subtitle tracks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackActionsConfig {
    pub clear_forced: bool,
    pub clear_default: bool,
}

impl TrackActionsConfig {
    pub fn is_noop(&self) -> bool {
        !self.clear_forced && !self.clear_default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_json_round_trip() {
        let condition = Condition::And {
            conditions: vec![
                Condition::Exists {
                    track_type: TrackType::Video,
                    filters: TrackFilters {
                        codec: Some(vec!["hevc".to_string()]),
                        ..Default::default()
                    },
                },
                Condition::Not {
                    condition: Box::new(Condition::Exists {
                        track_type: TrackType::Audio,
                        filters: TrackFilters {
                            language: Some(vec!["fra".to_string()]),
                            ..Default::default()
                        },
                    }),
                },
            ],
        };
        let json = serde_json::to_string(&condition).unwrap();
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, condition);
    }

    #[test]
    fn condition_parses_snake_case_tags() {
        let json = r#"{"type":"audio_is_multi_language","threshold":0.1}"#;
        let condition: Condition = serde_json::from_str(json).unwrap();
        match condition {
            Condition::AudioIsMultiLanguage { threshold, .. } => assert_eq!(threshold, 0.1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn channel_spec_resolves_names() {
        assert_eq!(ChannelSpec::Named("5.1".to_string()).channel_count(), 6);
        assert_eq!(ChannelSpec::Named("stereo".to_string()).channel_count(), 2);
        assert_eq!(ChannelSpec::Count(8).channel_count(), 8);
    }

    #[test]
    fn number_match_accepts_bare_and_operator_forms() {
        let bare: NumberMatch = serde_json::from_str("6").unwrap();
        assert!(bare.matches(6));
        let cmp: NumberMatch = serde_json::from_str(r#"{"operator":"gte","value":6}"#).unwrap();
        assert!(cmp.matches(8));
        assert!(!cmp.matches(2));
    }

    #[test]
    fn minimal_policy_document_parses() {
        let json = r#"{
            "schema_version": 12,
            "config": {"languages": ["eng"], "on_error": "fail"},
            "phases": [{"name": "cleanup", "audio_filter": {"languages": ["eng"]}}]
        }"#;
        let doc = PolicyDocument::from_json(json).unwrap();
        assert_eq!(doc.phases.len(), 1);
        assert_eq!(doc.phases[0].audio_filter.as_ref().unwrap().minimum, 1);
    }
}
