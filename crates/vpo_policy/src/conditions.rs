//! Condition evaluation.
//!
//! Stateless and pure: a [`Condition`] plus the file's tracks and sidecar
//! metadata evaluate to `(bool, reason)`. Reasons feed dry-run output and
//! job logs, so each one names what matched or why nothing did.

use std::collections::HashMap;

use regex::RegexBuilder;
use serde_json::Value;

use vpo_model::{languages_match, LanguageAnalysisResult, LanguageClassification, TrackInfo};

use crate::types::{Condition, MetadataOperator, TitleMatch, TrackFilters};

/// Original/dubbed classification for one audio track, produced by the
/// track-classification service.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackClassification {
    pub is_original: bool,
    pub is_dubbed: bool,
    pub confidence: f64,
    pub language: Option<String>,
}

/// Sidecar inputs for evaluation, all keyed independently of the track list.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Language analysis by track database id.
    pub language_results: HashMap<i64, LanguageAnalysisResult>,
    /// Plugin metadata: plugin name → field → value.
    pub plugin_metadata: HashMap<String, HashMap<String, Value>>,
    /// Container-level tags.
    pub container_tags: HashMap<String, String>,
    /// Original/dubbed classification by track database id.
    pub classifications: HashMap<i64, TrackClassification>,
}

fn matches_string_list(actual: Option<&str>, patterns: &[String], language_mode: bool) -> bool {
    let Some(actual) = actual else { return false };
    patterns.iter().any(|p| {
        if language_mode {
            languages_match(actual, p)
        } else if let Some(prefix) = p.strip_suffix('*') {
            // pcm_* style trailing wildcard
            actual.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase())
        } else {
            actual.eq_ignore_ascii_case(p)
        }
    })
}

fn matches_title(actual: Option<&str>, pattern: &TitleMatch) -> bool {
    let Some(actual) = actual else { return false };
    match pattern {
        TitleMatch::Contains(needle) => actual.to_lowercase().contains(&needle.to_lowercase()),
        TitleMatch::Spec { contains, regex } => {
            if let Some(needle) = contains {
                return actual.to_lowercase().contains(&needle.to_lowercase());
            }
            if let Some(pattern) = regex {
                // Invalid patterns are rejected at validation time; an
                // unparseable one here simply never matches.
                return RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| re.is_match(actual))
                    .unwrap_or(false);
            }
            false
        }
    }
}

/// Whether a single track passes every specified filter. Unspecified
/// criteria always match.
pub fn matches_track(track: &TrackInfo, filters: &TrackFilters) -> bool {
    if let Some(languages) = &filters.language {
        if !matches_string_list(track.language.as_deref(), languages, true) {
            return false;
        }
    }
    if let Some(codecs) = &filters.codec {
        if !matches_string_list(track.codec.as_deref(), codecs, false) {
            return false;
        }
    }
    if let Some(expected) = filters.is_default {
        if track.is_default != expected {
            return false;
        }
    }
    if let Some(expected) = filters.is_forced {
        if track.is_forced != expected {
            return false;
        }
    }
    if let Some(channels) = &filters.channels {
        match track.channels {
            Some(actual) => {
                if !channels.matches(actual) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(width) = &filters.width {
        match track.width {
            Some(actual) => {
                if !width.matches(actual) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(height) = &filters.height {
        match track.height {
            Some(actual) => {
                if !height.matches(actual) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(title) = &filters.title {
        if !matches_title(track.title.as_deref(), title) {
            return false;
        }
    }
    true
}

fn metadata_compare(actual: &Value, expected: Option<&Value>, op: MetadataOperator) -> bool {
    match op {
        MetadataOperator::Exists => true,
        MetadataOperator::Eq | MetadataOperator::Neq => {
            let Some(expected) = expected else { return false };
            let equal = match (actual, expected) {
                (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
                (Value::Number(a), Value::Number(b)) => a == b,
                (a, b) => a == b,
            };
            if op == MetadataOperator::Eq {
                equal
            } else {
                !equal
            }
        }
        MetadataOperator::Contains => {
            let (Some(Value::String(needle)), Value::String(haystack)) = (expected, actual) else {
                return false;
            };
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }
        MetadataOperator::Lt | MetadataOperator::Lte | MetadataOperator::Gt
        | MetadataOperator::Gte => {
            let (Some(a), Some(b)) = (value_as_f64(actual), expected.and_then(value_as_f64))
            else {
                return false;
            };
            match op {
                MetadataOperator::Lt => a < b,
                MetadataOperator::Lte => a <= b,
                MetadataOperator::Gt => a > b,
                MetadataOperator::Gte => a >= b,
                _ => false,
            }
        }
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn lookup_case_insensitive<'a, V>(map: &'a HashMap<String, V>, key: &str) -> Option<&'a V> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Evaluate a condition against the track set and sidecar maps.
///
/// Boolean operators short-circuit; the composite reason embeds the first
/// falsifying child for `and`, the first satisfying child for `or`, and the
/// negated child for `not`.
pub fn evaluate_condition(
    condition: &Condition,
    tracks: &[TrackInfo],
    ctx: &EvalContext,
) -> (bool, String) {
    match condition {
        Condition::Exists { track_type, filters } => {
            let matching: Vec<&TrackInfo> = tracks
                .iter()
                .filter(|t| t.track_type == *track_type && matches_track(t, filters))
                .collect();
            if let Some(first) = matching.first() {
                let mut reason = format!("exists({track_type}) -> true (track[{}]", first.track_index);
                if let Some(codec) = &first.codec {
                    reason.push(' ');
                    reason.push_str(codec);
                }
                if let Some(language) = &first.language {
                    reason.push(' ');
                    reason.push_str(language);
                }
                reason.push(')');
                (true, reason)
            } else {
                (
                    false,
                    format!("exists({track_type}) -> false (no matching tracks)"),
                )
            }
        }

        Condition::Count {
            track_type,
            filters,
            operator,
            value,
        } => {
            let count = tracks
                .iter()
                .filter(|t| t.track_type == *track_type && matches_track(t, filters))
                .count() as i64;
            let result = operator.compare(count, *value);
            (
                result,
                format!(
                    "count({track_type}) {} {value} -> {result} (count={count})",
                    operator.as_str()
                ),
            )
        }

        Condition::AudioIsMultiLanguage {
            track_index,
            primary_language,
            threshold,
        } => evaluate_multi_language(tracks, ctx, *track_index, primary_language.as_deref(), *threshold),

        Condition::PluginMetadata {
            plugin,
            field,
            value,
            operator,
        } => {
            let found = lookup_case_insensitive(&ctx.plugin_metadata, plugin)
                .and_then(|fields| lookup_case_insensitive(fields, field));
            match found {
                Some(actual) => {
                    let result = metadata_compare(actual, value.as_ref(), *operator);
                    (
                        result,
                        format!(
                            "plugin_metadata({plugin}.{field}) {} -> {result}",
                            operator.as_str()
                        ),
                    )
                }
                None => (
                    false,
                    format!("plugin_metadata({plugin}.{field}) -> false (field not present)"),
                ),
            }
        }

        Condition::ContainerMetadata { field, value, operator } => {
            let found = lookup_case_insensitive(&ctx.container_tags, field);
            match found {
                Some(actual) => {
                    let actual = Value::String(actual.clone());
                    let result = metadata_compare(&actual, value.as_ref(), *operator);
                    (
                        result,
                        format!("container_metadata({field}) {} -> {result}", operator.as_str()),
                    )
                }
                None => (
                    false,
                    format!("container_metadata({field}) -> false (tag not present)"),
                ),
            }
        }

        Condition::IsOriginal {
            value,
            min_confidence,
            language,
        } => evaluate_classification(tracks, ctx, true, *value, *min_confidence, language.as_deref()),

        Condition::IsDubbed {
            value,
            min_confidence,
            language,
        } => evaluate_classification(tracks, ctx, false, *value, *min_confidence, language.as_deref()),

        Condition::And { conditions } => {
            let mut reasons = Vec::with_capacity(conditions.len());
            for sub in conditions {
                let (result, reason) = evaluate_condition(sub, tracks, ctx);
                if !result {
                    return (false, format!("and -> false ({reason})"));
                }
                reasons.push(reason);
            }
            (true, format!("and -> true ({})", reasons.join("; ")))
        }

        Condition::Or { conditions } => {
            for sub in conditions {
                let (result, reason) = evaluate_condition(sub, tracks, ctx);
                if result {
                    return (true, format!("or -> true ({reason})"));
                }
            }
            (
                false,
                format!("or -> false ({} conditions failed)", conditions.len()),
            )
        }

        Condition::Not { condition } => {
            let (result, reason) = evaluate_condition(condition, tracks, ctx);
            (!result, format!("not({reason}) -> {}", !result))
        }
    }
}

fn evaluate_multi_language(
    tracks: &[TrackInfo],
    ctx: &EvalContext,
    track_index: Option<i64>,
    primary_language: Option<&str>,
    threshold: f64,
) -> (bool, String) {
    if ctx.language_results.is_empty() {
        return (
            false,
            "audio_is_multi_language -> false (no language analysis available)".to_string(),
        );
    }

    let audio_tracks: Vec<&TrackInfo> = tracks
        .iter()
        .filter(|t| t.track_type == vpo_model::TrackType::Audio)
        .filter(|t| track_index.map_or(true, |idx| t.track_index == idx))
        .collect();

    if audio_tracks.is_empty() {
        let reason = match track_index {
            Some(idx) => format!("audio_is_multi_language -> false (track {idx} not found)"),
            None => "audio_is_multi_language -> false (no audio tracks)".to_string(),
        };
        return (false, reason);
    }

    for track in &audio_tracks {
        let Some(result) = ctx.language_results.get(&track.id) else {
            continue;
        };
        if result.classification != LanguageClassification::MultiLanguage {
            continue;
        }
        if let Some(expected) = primary_language {
            if !languages_match(&result.primary_language, expected) {
                continue;
            }
        }
        let significant = result
            .secondary_languages
            .iter()
            .any(|s| s.percentage >= threshold);
        if significant {
            return (
                true,
                format!(
                    "audio_is_multi_language -> true (track[{}] {} {:.0}%, secondary above {:.0}%)",
                    track.track_index,
                    result.primary_language,
                    result.primary_percentage * 100.0,
                    threshold * 100.0
                ),
            );
        }
    }

    let reason = match track_index {
        Some(idx) => format!("audio_is_multi_language -> false (track {idx} not multi-language)"),
        None => "audio_is_multi_language -> false (no multi-language audio tracks)".to_string(),
    };
    (false, reason)
}

fn evaluate_classification(
    tracks: &[TrackInfo],
    ctx: &EvalContext,
    original: bool,
    expected: bool,
    min_confidence: f64,
    language: Option<&str>,
) -> (bool, String) {
    let kind = if original { "is_original" } else { "is_dubbed" };

    for track in tracks
        .iter()
        .filter(|t| t.track_type == vpo_model::TrackType::Audio)
    {
        let Some(classification) = ctx.classifications.get(&track.id) else {
            continue;
        };
        if classification.confidence < min_confidence {
            continue;
        }
        if let Some(expected_lang) = language {
            let detected = classification
                .language
                .as_deref()
                .or(track.language.as_deref());
            match detected {
                Some(lang) if languages_match(lang, expected_lang) => {}
                _ => continue,
            }
        }
        let actual = if original {
            classification.is_original
        } else {
            classification.is_dubbed
        };
        if actual == expected {
            return (
                true,
                format!(
                    "{kind} -> true (track[{}] confidence {:.2})",
                    track.track_index, classification.confidence
                ),
            );
        }
    }

    (false, format!("{kind} -> false (no qualifying track)"))
}
