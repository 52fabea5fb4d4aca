//! Audio synthesis planning.
//!
//! Each synthesis definition either resolves to a concrete
//! [`SynthesisOperation`] (source chosen, bitrate computed, position fixed)
//! or to a [`SkippedSynthesis`] record explaining why not. A skip never
//! aborts the phase.

use serde::{Deserialize, Serialize};

use vpo_model::{languages_match, TrackInfo, TrackType};

use crate::codecs::{default_bitrate, downmix_filter, validate_downmix};
use crate::conditions::{evaluate_condition, EvalContext};
use crate::filtering::CommentaryMatcher;
use crate::types::{
    AudioCodec, PositionSpec, PreferenceCriterion, ResolvedChannelPreference,
    SynthesisTrackDefinition,
};

/// Why a synthesis definition produced no operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    ConditionNotMet,
    EncoderUnavailable,
    NoSourceAvailable,
    WouldUpmix,
}

/// Record of a definition that was skipped, kept for dry-run and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSynthesis {
    pub definition_name: String,
    pub reason: SkipReason,
    pub details: String,
}

/// A fully resolved synthesis operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOperation {
    pub definition_name: String,
    /// Container index of the chosen source track.
    pub source_track_index: i64,
    pub source_channels: u32,
    pub target_codec: AudioCodec,
    pub target_channels: u32,
    /// Bits per second; `None` for lossless targets.
    pub target_bitrate: Option<u32>,
    pub target_title: String,
    pub target_language: String,
    /// Zero-based position within the audio tracks after synthesis.
    pub target_position: usize,
    /// ffmpeg pan filter; `None` means rely on `-ac`.
    pub downmix_filter: Option<String>,
}

/// Narrow `candidates` by one preference criterion. Returns the surviving
/// set, or `None` when the criterion matches nothing (caller skips it).
fn apply_criterion<'a>(
    candidates: &[&'a TrackInfo],
    criterion: &PreferenceCriterion,
    matcher: &CommentaryMatcher,
) -> Option<Vec<&'a TrackInfo>> {
    let mut survivors: Vec<&TrackInfo> = candidates.to_vec();

    if let Some(languages) = &criterion.language {
        survivors.retain(|t| {
            t.language
                .as_deref()
                .map(|lang| languages.iter().any(|want| languages_match(lang, want)))
                .unwrap_or(false)
        });
    }
    if criterion.not_commentary == Some(true) {
        survivors.retain(|t| !matcher.is_commentary(t.title.as_deref()));
    }
    if let Some(codecs) = &criterion.codec {
        survivors.retain(|t| {
            t.codec
                .as_deref()
                .map(|c| codecs.iter().any(|want| c.eq_ignore_ascii_case(want)))
                .unwrap_or(false)
        });
    }
    if let Some(preference) = &criterion.channels {
        if let Some(ResolvedChannelPreference::Exact(n)) = preference.resolve() {
            survivors.retain(|t| t.channels == Some(n as i64));
        }
        // Max/Min impose an ordering, not a filter.
    }

    if survivors.is_empty() {
        None
    } else {
        Some(survivors)
    }
}

/// Pick the source track for a synthesis definition.
///
/// Criteria narrow in order; one that would empty the candidate set is
/// skipped. The final set is ranked by the first criterion that imposed an
/// ordering (max/min channels); ties break by original track index.
pub fn select_source_track<'a>(
    audio_tracks: &[&'a TrackInfo],
    prefer: &[PreferenceCriterion],
    matcher: &CommentaryMatcher,
) -> Option<&'a TrackInfo> {
    if audio_tracks.is_empty() {
        return None;
    }

    let mut candidates: Vec<&TrackInfo> = audio_tracks.to_vec();
    let mut ordering: Option<ResolvedChannelPreference> = None;

    for criterion in prefer {
        if let Some(survivors) = apply_criterion(&candidates, criterion, matcher) {
            candidates = survivors;
        }
        if ordering.is_none() {
            if let Some(resolved) = criterion.channels.as_ref().and_then(|c| c.resolve()) {
                if matches!(
                    resolved,
                    ResolvedChannelPreference::Max | ResolvedChannelPreference::Min
                ) {
                    ordering = Some(resolved);
                }
            }
        }
    }

    match ordering {
        Some(ResolvedChannelPreference::Max) => {
            candidates.sort_by_key(|t| (std::cmp::Reverse(t.channels.unwrap_or(0)), t.track_index))
        }
        Some(ResolvedChannelPreference::Min) => {
            candidates.sort_by_key(|t| (t.channels.unwrap_or(i64::MAX), t.track_index))
        }
        _ => candidates.sort_by_key(|t| t.track_index),
    }

    candidates.first().copied()
}

fn resolve_position(
    position: &PositionSpec,
    source_track_index: i64,
    audio_tracks: &[&TrackInfo],
    planned_so_far: usize,
) -> usize {
    match position {
        // 1-based in the document, 0-based internally.
        PositionSpec::Absolute(n) => (*n as usize).saturating_sub(1),
        PositionSpec::Keyword(keyword) if keyword.eq_ignore_ascii_case("after_source") => {
            audio_tracks
                .iter()
                .position(|t| t.track_index == source_track_index)
                .map(|i| i + 1 + planned_so_far)
                .unwrap_or(audio_tracks.len() + planned_so_far)
        }
        _ => audio_tracks.len() + planned_so_far,
    }
}

/// Resolve one definition against the current track set.
pub fn resolve_synthesis_operation(
    definition: &SynthesisTrackDefinition,
    all_tracks: &[TrackInfo],
    ctx: &EvalContext,
    commentary_patterns: &[String],
    available_encoders: Option<&[String]>,
    existing_operations: &[SynthesisOperation],
) -> Result<SynthesisOperation, SkippedSynthesis> {
    let audio_tracks: Vec<&TrackInfo> = all_tracks
        .iter()
        .filter(|t| t.track_type == TrackType::Audio)
        .collect();

    if let Some(condition) = &definition.create_if {
        let (should_create, reason) = evaluate_condition(condition, all_tracks, ctx);
        if !should_create {
            return Err(SkippedSynthesis {
                definition_name: definition.name.clone(),
                reason: SkipReason::ConditionNotMet,
                details: format!("condition not satisfied: {reason}"),
            });
        }
    }

    // Encoder availability, when the caller knows the encoder set. `None`
    // means discovery has not run (dry-run planning) and the check is
    // deferred to execution.
    if let Some(encoders) = available_encoders {
        let needed = definition.codec.ffmpeg_encoder();
        if !encoders.iter().any(|e| e == needed) {
            return Err(SkippedSynthesis {
                definition_name: definition.name.clone(),
                reason: SkipReason::EncoderUnavailable,
                details: format!("encoder '{needed}' not available"),
            });
        }
    }

    let matcher = CommentaryMatcher::new(commentary_patterns);
    let Some(source) = select_source_track(&audio_tracks, &definition.source_prefer, &matcher)
    else {
        return Err(SkippedSynthesis {
            definition_name: definition.name.clone(),
            reason: SkipReason::NoSourceAvailable,
            details: "no audio tracks available".to_string(),
        });
    };

    let source_channels = source.channels.unwrap_or(2) as u32;
    let target_channels = definition.channels.channel_count();
    if let Err(message) = validate_downmix(source_channels, target_channels) {
        return Err(SkippedSynthesis {
            definition_name: definition.name.clone(),
            reason: SkipReason::WouldUpmix,
            details: message,
        });
    }

    let target_bitrate = definition
        .bitrate
        .or_else(|| default_bitrate(definition.codec, target_channels));

    let target_title = if definition.title == "inherit" {
        source.title.clone().unwrap_or_default()
    } else {
        definition.title.clone()
    };
    let target_language = if definition.language == "inherit" {
        source
            .language
            .clone()
            .unwrap_or_else(|| "und".to_string())
    } else {
        definition.language.clone()
    };

    let target_position = resolve_position(
        &definition.position,
        source.track_index,
        &audio_tracks,
        existing_operations.len(),
    );

    Ok(SynthesisOperation {
        definition_name: definition.name.clone(),
        source_track_index: source.track_index,
        source_channels,
        target_codec: definition.codec,
        target_channels,
        target_bitrate,
        target_title,
        target_language,
        target_position,
        downmix_filter: downmix_filter(source_channels, target_channels),
    })
}

/// Plan every synthesis definition of a phase. Skips accumulate; they never
/// fail the plan.
pub fn plan_synthesis(
    definitions: &[SynthesisTrackDefinition],
    all_tracks: &[TrackInfo],
    ctx: &EvalContext,
    commentary_patterns: &[String],
    available_encoders: Option<&[String]>,
) -> (Vec<SynthesisOperation>, Vec<SkippedSynthesis>) {
    let mut operations = Vec::new();
    let mut skipped = Vec::new();

    for definition in definitions {
        match resolve_synthesis_operation(
            definition,
            all_tracks,
            ctx,
            commentary_patterns,
            available_encoders,
            &operations,
        ) {
            Ok(operation) => operations.push(operation),
            Err(skip) => skipped.push(skip),
        }
    }

    (operations, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelPreference, ChannelSpec};

    fn audio(index: i64, lang: &str, codec: &str, channels: i64, title: Option<&str>) -> TrackInfo {
        let mut t = TrackInfo::new(1, index, TrackType::Audio);
        t.id = 100 + index;
        t.language = Some(lang.to_string());
        t.codec = Some(codec.to_string());
        t.channels = Some(channels);
        t.title = title.map(|s| s.to_string());
        t
    }

    fn definition(channels: ChannelSpec) -> SynthesisTrackDefinition {
        SynthesisTrackDefinition {
            name: "Stereo Mix".to_string(),
            codec: AudioCodec::Aac,
            channels,
            source_prefer: vec![],
            bitrate: None,
            create_if: None,
            title: "inherit".to_string(),
            language: "inherit".to_string(),
            position: PositionSpec::default(),
        }
    }

    #[test]
    fn upmix_is_skipped_not_planned() {
        // Stereo source, 5.1 target.
        let tracks = vec![audio(0, "eng", "aac", 2, None)];
        let def = definition(ChannelSpec::Named("5.1".to_string()));
        let result =
            resolve_synthesis_operation(&def, &tracks, &EvalContext::default(), &[], None, &[]);
        let skip = result.unwrap_err();
        assert_eq!(skip.reason, SkipReason::WouldUpmix);
    }

    #[test]
    fn downmix_resolves_bitrate_title_language() {
        let tracks = vec![audio(0, "deu", "truehd", 8, Some("Atmos"))];
        let def = definition(ChannelSpec::Count(2));
        let op = resolve_synthesis_operation(
            &def,
            &tracks,
            &EvalContext::default(),
            &[],
            None,
            &[],
        )
        .unwrap();
        assert_eq!(op.source_track_index, 0);
        assert_eq!(op.target_channels, 2);
        assert_eq!(op.target_bitrate, Some(192_000));
        assert_eq!(op.target_title, "Atmos");
        assert_eq!(op.target_language, "deu");
        assert!(op.downmix_filter.unwrap().starts_with("pan=stereo"));
    }

    #[test]
    fn preference_criteria_narrow_then_rank_by_max_channels() {
        let tracks = vec![
            audio(0, "eng", "ac3", 6, Some("Commentary")),
            audio(1, "eng", "truehd", 8, None),
            audio(2, "eng", "aac", 2, None),
            audio(3, "jpn", "dts", 8, None),
        ];
        let refs: Vec<&TrackInfo> = tracks.iter().collect();
        let prefer = vec![
            PreferenceCriterion {
                language: Some(vec!["eng".to_string()]),
                ..Default::default()
            },
            PreferenceCriterion {
                not_commentary: Some(true),
                ..Default::default()
            },
            PreferenceCriterion {
                channels: Some(ChannelPreference::Keyword("max".to_string())),
                ..Default::default()
            },
        ];
        let matcher = CommentaryMatcher::new(&[]);
        let source = select_source_track(&refs, &prefer, &matcher).unwrap();
        assert_eq!(source.track_index, 1);
    }

    #[test]
    fn unsatisfiable_criterion_is_skipped() {
        let tracks = vec![audio(0, "eng", "aac", 2, None), audio(1, "deu", "ac3", 6, None)];
        let refs: Vec<&TrackInfo> = tracks.iter().collect();
        let prefer = vec![
            PreferenceCriterion {
                language: Some(vec!["fra".to_string()]),
                ..Default::default()
            },
            PreferenceCriterion {
                codec: Some(vec!["ac3".to_string()]),
                ..Default::default()
            },
        ];
        let matcher = CommentaryMatcher::new(&[]);
        // French filter matches nothing and is skipped; ac3 then narrows.
        let source = select_source_track(&refs, &prefer, &matcher).unwrap();
        assert_eq!(source.track_index, 1);
    }

    #[test]
    fn ties_break_by_original_index() {
        let tracks = vec![audio(0, "eng", "ac3", 6, None), audio(1, "eng", "dts", 6, None)];
        let refs: Vec<&TrackInfo> = tracks.iter().collect();
        let prefer = vec![PreferenceCriterion {
            channels: Some(ChannelPreference::Keyword("max".to_string())),
            ..Default::default()
        }];
        let matcher = CommentaryMatcher::new(&[]);
        let source = select_source_track(&refs, &prefer, &matcher).unwrap();
        assert_eq!(source.track_index, 0);
    }

    #[test]
    fn missing_encoder_skips() {
        let tracks = vec![audio(0, "eng", "truehd", 8, None)];
        let def = SynthesisTrackDefinition {
            codec: AudioCodec::Opus,
            ..definition(ChannelSpec::Count(2))
        };
        let encoders = vec!["aac".to_string(), "ac3".to_string()];
        let result = resolve_synthesis_operation(
            &def,
            &tracks,
            &EvalContext::default(),
            &[],
            Some(&encoders),
            &[],
        );
        assert_eq!(result.unwrap_err().reason, SkipReason::EncoderUnavailable);
    }

    #[test]
    fn create_if_condition_gates_the_definition() {
        let tracks = vec![audio(0, "eng", "truehd", 8, None)];
        let mut def = definition(ChannelSpec::Count(2));
        def.create_if = Some(crate::types::Condition::Exists {
            track_type: TrackType::Audio,
            filters: crate::types::TrackFilters {
                codec: Some(vec!["aac".to_string()]),
                ..Default::default()
            },
        });
        let result =
            resolve_synthesis_operation(&def, &tracks, &EvalContext::default(), &[], None, &[]);
        assert_eq!(result.unwrap_err().reason, SkipReason::ConditionNotMet);
    }

    #[test]
    fn positions_resolve_absolute_after_source_and_end() {
        let tracks = vec![
            audio(0, "eng", "truehd", 8, None),
            audio(1, "deu", "ac3", 6, None),
        ];
        let ctx = EvalContext::default();

        let mut def = definition(ChannelSpec::Count(2));
        def.position = PositionSpec::Absolute(1);
        let op = resolve_synthesis_operation(&def, &tracks, &ctx, &[], None, &[]).unwrap();
        assert_eq!(op.target_position, 0);

        def.position = PositionSpec::Keyword("after_source".to_string());
        let op = resolve_synthesis_operation(&def, &tracks, &ctx, &[], None, &[]).unwrap();
        assert_eq!(op.target_position, 1);

        def.position = PositionSpec::Keyword("end".to_string());
        let op = resolve_synthesis_operation(&def, &tracks, &ctx, &[], None, &[]).unwrap();
        assert_eq!(op.target_position, 2);

        // A second planned track shifts `end` by the operations already
        // planned.
        let existing = vec![op.clone()];
        let op2 = resolve_synthesis_operation(&def, &tracks, &ctx, &[], None, &existing).unwrap();
        assert_eq!(op2.target_position, 3);
    }
}
