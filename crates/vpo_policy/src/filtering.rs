//! Track filtering: who stays, who goes, and why.
//!
//! Filtering never mutates tracks; it produces a disposition per track that
//! the planner turns into a remux operation. Audio filtering is the only
//! place that can refuse outright, via [`PolicyError::InsufficientTracks`].

use std::collections::HashMap;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use vpo_model::{languages_match, TrackInfo, TrackType};

use crate::error::PolicyError;
use crate::types::{AttachmentFilterConfig, AudioFilterConfig, FallbackMode, SubtitleFilterConfig};

/// Keep or remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackAction {
    Keep,
    Remove,
}

/// Decision for one track, with the human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDisposition {
    pub track_index: i64,
    pub track_type: TrackType,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub channels: Option<i64>,
    pub resolution: Option<String>,
    pub action: TrackAction,
    pub reason: String,
}

/// Content class of an audio track, derived from its title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioClass {
    Dialog,
    Commentary,
    Music,
    Sfx,
}

/// Compiled commentary title patterns. An empty pattern list falls back to
/// the word "commentary" itself.
pub struct CommentaryMatcher {
    patterns: Vec<regex::Regex>,
}

impl CommentaryMatcher {
    pub fn new(patterns: &[String]) -> Self {
        let mut compiled: Vec<regex::Regex> = patterns
            .iter()
            .filter_map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .ok()
            })
            .collect();
        if compiled.is_empty() {
            if let Ok(re) = RegexBuilder::new("commentary").case_insensitive(true).build() {
                compiled.push(re);
            }
        }
        Self { patterns: compiled }
    }

    pub fn is_commentary(&self, title: Option<&str>) -> bool {
        let Some(title) = title else { return false };
        self.patterns.iter().any(|re| re.is_match(title))
    }
}

const MUSIC_KEYWORDS: &[&str] = &["music", "score", "soundtrack", "instrumental"];
const SFX_KEYWORDS: &[&str] = &["sfx", "sound effects", "effects only", "foley"];

fn title_has_keyword(title: Option<&str>, keywords: &[&str]) -> bool {
    let Some(title) = title else { return false };
    let lowered = title.to_lowercase();
    keywords.iter().any(|k| lowered.contains(k))
}

/// Classify an audio track from its title.
pub fn classify_audio_track(track: &TrackInfo, matcher: &CommentaryMatcher) -> AudioClass {
    if matcher.is_commentary(track.title.as_deref()) {
        return AudioClass::Commentary;
    }
    if title_has_keyword(track.title.as_deref(), MUSIC_KEYWORDS) {
        return AudioClass::Music;
    }
    if title_has_keyword(track.title.as_deref(), SFX_KEYWORDS) {
        return AudioClass::Sfx;
    }
    AudioClass::Dialog
}

fn evaluate_audio_track(
    track: &TrackInfo,
    config: &AudioFilterConfig,
    class: AudioClass,
) -> (TrackAction, String) {
    match class {
        AudioClass::Commentary => {
            if !config.keep_commentary {
                return (TrackAction::Remove, "commentary track excluded by policy".to_string());
            }
        }
        AudioClass::Music => {
            if !config.keep_music_tracks {
                return (TrackAction::Remove, "music track excluded by policy".to_string());
            }
            if config.exclude_music_from_language_filter {
                return (
                    TrackAction::Keep,
                    "music track (exempt from language filter)".to_string(),
                );
            }
        }
        AudioClass::Sfx => {
            if !config.keep_sfx_tracks {
                return (TrackAction::Remove, "sfx track excluded by policy".to_string());
            }
            if config.exclude_sfx_from_language_filter {
                return (
                    TrackAction::Keep,
                    "sfx track (exempt from language filter)".to_string(),
                );
            }
        }
        AudioClass::Dialog => {}
    }

    let language = track.language.as_deref().unwrap_or("und");
    for keep in &config.languages {
        if languages_match(language, keep) {
            return (TrackAction::Keep, "language in keep list".to_string());
        }
    }
    (TrackAction::Remove, "language not in keep list".to_string())
}

fn evaluate_subtitle_track(
    track: &TrackInfo,
    config: &SubtitleFilterConfig,
    forced_will_be_cleared: bool,
) -> (TrackAction, String) {
    if config.remove_all {
        return (TrackAction::Remove, "remove_all enabled".to_string());
    }

    // If a later subtitle_actions operation clears forced flags, the current
    // forced state must not rescue the track.
    if config.preserve_forced && !forced_will_be_cleared && track.is_forced {
        return (TrackAction::Keep, "forced subtitle preserved".to_string());
    }

    let Some(languages) = &config.languages else {
        return (TrackAction::Keep, "no language filter applied".to_string());
    };

    let language = track.language.as_deref().unwrap_or("und");
    for keep in languages {
        if languages_match(language, keep) {
            return (TrackAction::Keep, "language in keep list".to_string());
        }
    }
    (TrackAction::Remove, "language not in keep list".to_string())
}

fn is_font_attachment(track: &TrackInfo) -> bool {
    let codec = track
        .codec
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    matches!(codec.as_str(), "ttf" | "otf" | "ttc" | "woff" | "woff2")
        || codec.starts_with("font/")
        || matches!(
            codec.as_str(),
            "application/x-truetype-font" | "application/x-font-ttf" | "application/font-sfnt"
        )
}

fn has_styled_subtitles(tracks: &[TrackInfo]) -> bool {
    tracks.iter().any(|t| {
        t.track_type == TrackType::Subtitle
            && matches!(
                t.codec.as_deref().unwrap_or("").to_ascii_lowercase().as_str(),
                "ass" | "ssa"
            )
    })
}

fn detect_content_language(tracks: &[TrackInfo]) -> Option<String> {
    tracks
        .iter()
        .find(|t| t.track_type == TrackType::Audio)
        .map(|t| t.language.clone().unwrap_or_else(|| "und".to_string()))
}

/// Filter output: the dispositions plus any warnings raised along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub dispositions: Vec<TrackDisposition>,
    pub warnings: Vec<String>,
}

impl FilterOutcome {
    /// Track indices whose disposition is `Remove`.
    pub fn removed_indices(&self) -> Vec<i64> {
        self.dispositions
            .iter()
            .filter(|d| d.action == TrackAction::Remove)
            .map(|d| d.track_index)
            .collect()
    }
}

fn apply_fallback(
    audio_tracks: &[&TrackInfo],
    actions: &mut HashMap<i64, (TrackAction, String)>,
    config: &AudioFilterConfig,
    all_tracks: &[TrackInfo],
) -> Result<(), PolicyError> {
    let kept = actions
        .values()
        .filter(|(action, _)| *action == TrackAction::Keep)
        .count() as u32;

    match config.fallback {
        None | Some(FallbackMode::Error) => Err(PolicyError::InsufficientTracks {
            track_type: "audio",
            required: config.minimum,
            available: kept,
            policy_languages: config.languages.clone(),
            file_languages: audio_tracks
                .iter()
                .map(|t| t.language.clone().unwrap_or_else(|| "und".to_string()))
                .collect(),
        }),

        Some(FallbackMode::KeepAll) => {
            for track in audio_tracks {
                actions.insert(
                    track.track_index,
                    (TrackAction::Keep, "fallback: keep_all applied".to_string()),
                );
            }
            Ok(())
        }

        Some(FallbackMode::KeepFirst) => {
            let mut needed = config.minimum.saturating_sub(kept);
            for track in audio_tracks {
                if needed == 0 {
                    break;
                }
                let entry = actions
                    .entry(track.track_index)
                    .or_insert((TrackAction::Remove, String::new()));
                if entry.0 == TrackAction::Remove {
                    *entry = (TrackAction::Keep, "fallback: keep_first applied".to_string());
                    needed -= 1;
                }
            }
            Ok(())
        }

        Some(FallbackMode::ContentLanguage) => {
            if let Some(content_language) = detect_content_language(all_tracks) {
                for track in audio_tracks {
                    let language = track.language.as_deref().unwrap_or("und");
                    if languages_match(language, &content_language) {
                        actions.insert(
                            track.track_index,
                            (
                                TrackAction::Keep,
                                "fallback: content language match".to_string(),
                            ),
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

/// Compute a disposition for every track under the given filter configs.
///
/// Configs that are `None` leave their track type untouched. Raises
/// [`PolicyError::InsufficientTracks`] only when audio filtering keeps fewer
/// than `minimum` tracks and the fallback is `error` (or absent); a minimum
/// of zero can never raise.
pub fn compute_track_dispositions(
    tracks: &[TrackInfo],
    audio: Option<&AudioFilterConfig>,
    subtitle: Option<&SubtitleFilterConfig>,
    attachment: Option<&AttachmentFilterConfig>,
    commentary_patterns: &[String],
    subtitle_forced_will_be_cleared: bool,
) -> Result<FilterOutcome, PolicyError> {
    let matcher = CommentaryMatcher::new(commentary_patterns);
    let audio_tracks: Vec<&TrackInfo> = tracks
        .iter()
        .filter(|t| t.track_type == TrackType::Audio)
        .collect();
    let styled_subs = has_styled_subtitles(tracks);

    let mut warnings = Vec::new();
    let mut audio_actions: HashMap<i64, (TrackAction, String)> = HashMap::new();
    let mut dispositions = Vec::with_capacity(tracks.len());

    for track in tracks {
        let (action, reason) = match track.track_type {
            TrackType::Audio => match audio {
                Some(config) => {
                    let class = classify_audio_track(track, &matcher);
                    let decision = evaluate_audio_track(track, config, class);
                    audio_actions.insert(track.track_index, decision.clone());
                    decision
                }
                None => (TrackAction::Keep, "no filter applied".to_string()),
            },
            TrackType::Subtitle => match subtitle {
                Some(config) => {
                    evaluate_subtitle_track(track, config, subtitle_forced_will_be_cleared)
                }
                None => (TrackAction::Keep, "no filter applied".to_string()),
            },
            TrackType::Attachment => match attachment {
                Some(config) if config.remove_all => {
                    if is_font_attachment(track) && styled_subs {
                        warnings.push(format!(
                            "removing font attachment '{}' may affect ASS/SSA subtitle styling",
                            track.title.as_deref().unwrap_or("unnamed")
                        ));
                    }
                    (TrackAction::Remove, "remove_all enabled".to_string())
                }
                _ => (TrackAction::Keep, "attachment kept".to_string()),
            },
            TrackType::Video => (TrackAction::Keep, "no filter applied".to_string()),
        };

        dispositions.push(TrackDisposition {
            track_index: track.track_index,
            track_type: track.track_type,
            codec: track.codec.clone(),
            language: track.language.clone(),
            title: track.title.clone(),
            channels: track.channels,
            resolution: track.resolution(),
            action,
            reason,
        });
    }

    // Fallback pass when audio filtering kept fewer than the minimum. A
    // configured minimum of zero is always satisfied and never raises.
    if let Some(config) = audio {
        if !audio_tracks.is_empty() && config.minimum > 0 {
            let kept = audio_actions
                .values()
                .filter(|(action, _)| *action == TrackAction::Keep)
                .count() as u32;
            if kept < config.minimum {
                apply_fallback(&audio_tracks, &mut audio_actions, config, tracks)?;
                for disposition in &mut dispositions {
                    if disposition.track_type != TrackType::Audio {
                        continue;
                    }
                    if let Some((action, reason)) = audio_actions.get(&disposition.track_index) {
                        if *action != disposition.action || *reason != disposition.reason {
                            disposition.action = *action;
                            disposition.reason = reason.clone();
                        }
                    }
                }
            }
        }
    }

    Ok(FilterOutcome {
        dispositions,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(index: i64, lang: &str) -> TrackInfo {
        let mut t = TrackInfo::new(1, index, TrackType::Audio);
        t.language = Some(lang.to_string());
        t.codec = Some("aac".to_string());
        t.channels = Some(2);
        t
    }

    fn subtitle(index: i64, lang: &str, forced: bool) -> TrackInfo {
        let mut t = TrackInfo::new(1, index, TrackType::Subtitle);
        t.language = Some(lang.to_string());
        t.codec = Some("subrip".to_string());
        t.is_forced = forced;
        t
    }

    fn audio_config(languages: &[&str], minimum: u32, fallback: Option<FallbackMode>) -> AudioFilterConfig {
        AudioFilterConfig {
            languages: languages.iter().map(|s| s.to_string()).collect(),
            minimum,
            fallback,
            ..Default::default()
        }
    }

    fn dispositions_for_audio(
        tracks: &[TrackInfo],
        config: &AudioFilterConfig,
    ) -> Result<FilterOutcome, PolicyError> {
        compute_track_dispositions(tracks, Some(config), None, None, &[], false)
    }

    #[test]
    fn content_language_fallback_keeps_majority_language() {
        // Audio [jpn, jpn, spa], policy keeps [eng]: both jpn tracks stay
        // via the content-language fallback, spa goes.
        let tracks = vec![audio(0, "jpn"), audio(1, "jpn"), audio(2, "spa")];
        let config = audio_config(&["eng"], 1, Some(FallbackMode::ContentLanguage));
        let outcome = dispositions_for_audio(&tracks, &config).unwrap();

        let by_index: HashMap<i64, &TrackDisposition> = outcome
            .dispositions
            .iter()
            .map(|d| (d.track_index, d))
            .collect();
        assert_eq!(by_index[&0].action, TrackAction::Keep);
        assert_eq!(by_index[&0].reason, "fallback: content language match");
        assert_eq!(by_index[&1].action, TrackAction::Keep);
        assert_eq!(by_index[&2].action, TrackAction::Remove);
    }

    #[test]
    fn no_fallback_raises_insufficient_tracks() {
        let tracks = vec![audio(0, "jpn")];
        let config = audio_config(&["eng"], 1, None);
        let err = dispositions_for_audio(&tracks, &config).unwrap_err();
        match err {
            PolicyError::InsufficientTracks {
                required,
                available,
                file_languages,
                ..
            } => {
                assert_eq!(required, 1);
                assert_eq!(available, 0);
                assert_eq!(file_languages, vec!["jpn".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn minimum_zero_with_error_fallback_never_raises() {
        let tracks = vec![audio(0, "jpn")];
        let config = audio_config(&["eng"], 0, Some(FallbackMode::Error));
        let outcome = dispositions_for_audio(&tracks, &config).unwrap();
        assert_eq!(outcome.dispositions[0].action, TrackAction::Remove);
    }

    #[test]
    fn keep_first_meets_minimum_bounded_by_track_count() {
        let tracks = vec![audio(0, "jpn"), audio(1, "spa")];
        let config = audio_config(&["eng"], 3, Some(FallbackMode::KeepFirst));
        let outcome = dispositions_for_audio(&tracks, &config).unwrap();
        let kept = outcome
            .dispositions
            .iter()
            .filter(|d| d.action == TrackAction::Keep)
            .count();
        // min(minimum, total audio tracks)
        assert_eq!(kept, 2);
    }

    #[test]
    fn keep_all_fallback_keeps_everything() {
        let tracks = vec![audio(0, "jpn"), audio(1, "spa")];
        let config = audio_config(&["eng"], 1, Some(FallbackMode::KeepAll));
        let outcome = dispositions_for_audio(&tracks, &config).unwrap();
        assert!(outcome
            .dispositions
            .iter()
            .all(|d| d.action == TrackAction::Keep));
    }

    #[test]
    fn commentary_exclusion_by_title() {
        let mut commentary = audio(1, "eng");
        commentary.title = Some("Director's Commentary".to_string());
        let tracks = vec![audio(0, "eng"), commentary];
        let mut config = audio_config(&["eng"], 1, None);
        config.keep_commentary = false;
        let outcome = dispositions_for_audio(&tracks, &config).unwrap();
        assert_eq!(outcome.dispositions[1].action, TrackAction::Remove);
        assert!(outcome.dispositions[1].reason.contains("commentary"));
    }

    #[test]
    fn music_track_exempt_from_language_filter() {
        let mut music = audio(1, "jpn");
        music.title = Some("Isolated Score Music".to_string());
        let tracks = vec![audio(0, "eng"), music];
        let mut config = audio_config(&["eng"], 1, None);
        config.exclude_music_from_language_filter = true;
        let outcome = dispositions_for_audio(&tracks, &config).unwrap();
        assert_eq!(outcome.dispositions[1].action, TrackAction::Keep);
        assert!(outcome.dispositions[1].reason.contains("exempt"));
    }

    #[test]
    fn preserve_forced_is_void_when_flags_will_be_cleared() {
        let tracks = vec![subtitle(0, "fra", true)];
        let config = SubtitleFilterConfig {
            languages: Some(vec!["eng".to_string()]),
            remove_all: false,
            preserve_forced: true,
        };

        let kept = compute_track_dispositions(&tracks, None, Some(&config), None, &[], false)
            .unwrap();
        assert_eq!(kept.dispositions[0].action, TrackAction::Keep);

        let cleared = compute_track_dispositions(&tracks, None, Some(&config), None, &[], true)
            .unwrap();
        assert_eq!(cleared.dispositions[0].action, TrackAction::Remove);
    }

    #[test]
    fn font_removal_with_styled_subs_warns() {
        let mut ass = TrackInfo::new(1, 0, TrackType::Subtitle);
        ass.codec = Some("ass".to_string());
        let mut font = TrackInfo::new(1, 1, TrackType::Attachment);
        font.codec = Some("ttf".to_string());
        let tracks = vec![ass, font];

        let config = AttachmentFilterConfig { remove_all: true };
        let outcome =
            compute_track_dispositions(&tracks, None, None, Some(&config), &[], false).unwrap();
        assert_eq!(outcome.dispositions[1].action, TrackAction::Remove);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("styling"));
    }
}
