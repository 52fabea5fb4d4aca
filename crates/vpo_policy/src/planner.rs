//! Phase planning.
//!
//! Reduces one declarative phase to an ordered list of concrete operations
//! against the current track state. All decisions happen here, up front;
//! the executor only routes planned operations to tools. A plan comes out
//! empty exactly when the phase is a no-op for this file, which is what
//! makes planning idempotent: planning again after applying a plan yields
//! nothing.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use vpo_model::{languages_match, TrackInfo, TrackType};

use crate::actions::{
    execute_actions, ActionContext, FlagKind, TrackFlagChange, TrackLanguageChange,
};
use crate::codecs::codecs_equal;
use crate::conditions::{evaluate_condition, EvalContext};
use crate::error::PolicyError;
use crate::filtering::compute_track_dispositions;
use crate::synthesis::{plan_synthesis, SkippedSynthesis, SynthesisOperation};
use crate::types::{
    AudioTranscodeConfig, GlobalConfig, Phase, TrackOrderSlot, TranscriptionConfig,
};
use crate::video::{analyze_video, TranscodeDecision};

/// Whether a phase runs or why it does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseGate {
    Run,
    Skipped(String),
}

/// One resolved operation, in canonical execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlannedOperation {
    Container {
        target: String,
    },
    TrackFilter {
        outcome_removed: Vec<i64>,
        dispositions: Vec<crate::filtering::TrackDisposition>,
    },
    TrackOrder {
        /// Track indices in their new order.
        order: Vec<i64>,
    },
    DefaultFlags {
        changes: Vec<TrackFlagChange>,
    },
    Conditional {
        flag_changes: Vec<TrackFlagChange>,
        language_changes: Vec<TrackLanguageChange>,
    },
    AudioSynthesis {
        operations: Vec<SynthesisOperation>,
    },
    VideoTranscode {
        target_codec: String,
        decision: TranscodeDecision,
    },
    AudioTranscode {
        config: AudioTranscodeConfig,
        track_indices: Vec<i64>,
    },
    Transcription {
        config: TranscriptionConfig,
    },
    FileTimestamp {
        preserve_modification_time: bool,
    },
    AudioActions {
        changes: Vec<TrackFlagChange>,
    },
    SubtitleActions {
        changes: Vec<TrackFlagChange>,
    },
}

impl PlannedOperation {
    /// Stable operation name used in logs, stats and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Container { .. } => "container",
            Self::TrackFilter { .. } => "track_filter",
            Self::TrackOrder { .. } => "track_order",
            Self::DefaultFlags { .. } => "default_flags",
            Self::Conditional { .. } => "conditional",
            Self::AudioSynthesis { .. } => "audio_synthesis",
            Self::VideoTranscode { .. } => "video_transcode",
            Self::AudioTranscode { .. } => "audio_transcode",
            Self::Transcription { .. } => "transcription",
            Self::FileTimestamp { .. } => "file_timestamp",
            Self::AudioActions { .. } => "audio_actions",
            Self::SubtitleActions { .. } => "subtitle_actions",
        }
    }
}

/// The planner's output for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub phase_name: String,
    pub operations: Vec<PlannedOperation>,
    pub warnings: Vec<String>,
    pub synthesis_skipped: Vec<SkippedSynthesis>,
}

impl Plan {
    /// Empty iff the phase is a no-op for the current track state.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Everything the planner needs about the file's current state.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub tracks: &'a [TrackInfo],
    /// Current container format, when known.
    pub container: Option<&'a str>,
    pub ctx: &'a EvalContext,
    /// Encoders discovered at startup; `None` defers the availability check
    /// to execution time.
    pub available_encoders: Option<&'a [String]>,
}

/// Decide whether a phase runs. Evaluation order is fixed:
/// `run_if`, then `depends_on`, then `skip_when`.
pub fn evaluate_gating(
    phase: &Phase,
    modified_phases: &HashSet<String>,
    tracks: &[TrackInfo],
    ctx: &EvalContext,
) -> PhaseGate {
    if let Some(run_if) = &phase.run_if {
        if !modified_phases.contains(&run_if.phase_modified) {
            return PhaseGate::Skipped(format!(
                "run_if: phase '{}' did not modify the file",
                run_if.phase_modified
            ));
        }
    }

    if let Some(depends_on) = &phase.depends_on {
        for dependency in depends_on {
            if !modified_phases.contains(dependency) {
                return PhaseGate::Skipped(format!(
                    "depends_on: phase '{dependency}' did not modify the file"
                ));
            }
        }
    }

    if let Some(skip_when) = &phase.skip_when {
        for condition in skip_when {
            let (holds, reason) = evaluate_condition(condition, tracks, ctx);
            if holds {
                return PhaseGate::Skipped(format!("skip_when: {reason}"));
            }
        }
    }

    PhaseGate::Run
}

fn slot_for_track(
    track: &TrackInfo,
    preferred_language: Option<&str>,
    commentary: &crate::filtering::CommentaryMatcher,
) -> TrackOrderSlot {
    match track.track_type {
        TrackType::Video => TrackOrderSlot::Video,
        TrackType::Attachment => TrackOrderSlot::Attachment,
        TrackType::Audio => {
            if commentary.is_commentary(track.title.as_deref()) {
                TrackOrderSlot::AudioCommentary
            } else if preferred_language
                .map(|lang| {
                    track
                        .language
                        .as_deref()
                        .map(|actual| languages_match(actual, lang))
                        .unwrap_or(false)
                })
                .unwrap_or(true)
            {
                TrackOrderSlot::AudioMain
            } else {
                TrackOrderSlot::AudioAlternate
            }
        }
        TrackType::Subtitle => {
            if preferred_language
                .map(|lang| {
                    track
                        .language
                        .as_deref()
                        .map(|actual| languages_match(actual, lang))
                        .unwrap_or(false)
                })
                .unwrap_or(true)
            {
                TrackOrderSlot::SubtitleMain
            } else {
                TrackOrderSlot::SubtitleAlternate
            }
        }
    }
}

fn resolve_track_order(
    sequence: &[TrackOrderSlot],
    tracks: &[TrackInfo],
    global: &GlobalConfig,
) -> Vec<i64> {
    let matcher = crate::filtering::CommentaryMatcher::new(&global.commentary_patterns);
    let preferred = global.languages.first().map(|s| s.as_str());

    let mut ordered: Vec<i64> = Vec::with_capacity(tracks.len());
    let mut placed: HashSet<i64> = HashSet::new();

    for slot in sequence {
        for track in tracks {
            if placed.contains(&track.track_index) {
                continue;
            }
            if slot_for_track(track, preferred, &matcher) == *slot {
                ordered.push(track.track_index);
                placed.insert(track.track_index);
            }
        }
    }
    // Tracks whose slot the sequence does not mention keep their relative
    // order at the end.
    for track in tracks {
        if !placed.contains(&track.track_index) {
            ordered.push(track.track_index);
        }
    }
    ordered
}

fn default_flag_changes(
    tracks: &[TrackInfo],
    track_type: TrackType,
    language: &str,
    clear_others: bool,
) -> Vec<TrackFlagChange> {
    let mut changes = Vec::new();
    let chosen = tracks.iter().find(|t| {
        t.track_type == track_type
            && t.language
                .as_deref()
                .map(|actual| languages_match(actual, language))
                .unwrap_or(false)
    });

    if let Some(chosen) = chosen {
        if !chosen.is_default {
            changes.push(TrackFlagChange {
                track_index: chosen.track_index,
                flag: FlagKind::Default,
                value: true,
            });
        }
        if clear_others {
            for track in tracks {
                if track.track_type == track_type
                    && track.track_index != chosen.track_index
                    && track.is_default
                {
                    changes.push(TrackFlagChange {
                        track_index: track.track_index,
                        flag: FlagKind::Default,
                        value: false,
                    });
                }
            }
        }
    }
    changes
}

fn clear_flag_changes(
    tracks: &[TrackInfo],
    track_type: TrackType,
    clear_forced: bool,
    clear_default: bool,
) -> Vec<TrackFlagChange> {
    let mut changes = Vec::new();
    for track in tracks.iter().filter(|t| t.track_type == track_type) {
        if clear_forced && track.is_forced {
            changes.push(TrackFlagChange {
                track_index: track.track_index,
                flag: FlagKind::Forced,
                value: false,
            });
        }
        if clear_default && track.is_default {
            changes.push(TrackFlagChange {
                track_index: track.track_index,
                flag: FlagKind::Default,
                value: false,
            });
        }
    }
    changes
}

/// Reduce one phase to a [`Plan`] against the current track state.
///
/// Conditional rules are evaluated first so that their skip flags can
/// suppress other operations of this phase; the resulting flag and language
/// changes still execute in the canonical `conditional` position.
pub fn plan_phase(
    phase: &Phase,
    global: &GlobalConfig,
    file_path: &str,
    inputs: &PlanInputs<'_>,
) -> Result<Plan, PolicyError> {
    let tracks = inputs.tracks;
    let mut operations = Vec::new();
    let mut warnings = Vec::new();
    let mut synthesis_skipped = Vec::new();

    // Conditional rules first: their outcome gates everything below.
    let mut action_context = ActionContext::new(file_path, tracks.to_vec());
    action_context.plugin_metadata = inputs.ctx.plugin_metadata.clone();
    if let Some(rules) = &phase.conditional {
        for rule in rules {
            action_context.rule_name = rule.name.clone();
            let (holds, _reason) = evaluate_condition(&rule.when, tracks, inputs.ctx);
            let branch = if holds {
                &rule.then_actions
            } else {
                &rule.else_actions
            };
            execute_actions(branch, &mut action_context)?;
        }
    }
    warnings.append(&mut action_context.warnings);

    // container
    if let Some(container) = &phase.container {
        let changes = inputs
            .container
            .map(|current| !current.eq_ignore_ascii_case(&container.target))
            .unwrap_or(true);
        if changes {
            operations.push(PlannedOperation::Container {
                target: container.target.clone(),
            });
        }
    }

    // audio / subtitle / attachment filters
    let filters_requested = phase.audio_filter.is_some()
        || phase.subtitle_filter.is_some()
        || phase.attachment_filter.is_some();
    if filters_requested && !action_context.skip_track_filter {
        let forced_cleared = phase
            .subtitle_actions
            .as_ref()
            .map(|a| a.clear_forced)
            .unwrap_or(false);
        let mut outcome = compute_track_dispositions(
            tracks,
            phase.audio_filter.as_ref(),
            phase.subtitle_filter.as_ref(),
            phase.attachment_filter.as_ref(),
            &global.commentary_patterns,
            forced_cleared,
        )?;
        warnings.append(&mut outcome.warnings);

        let removed = outcome.removed_indices();
        if !removed.is_empty() {
            operations.push(PlannedOperation::TrackFilter {
                outcome_removed: removed,
                dispositions: outcome.dispositions,
            });
        }
    }

    // track_order
    if let Some(sequence) = &phase.track_order {
        let order = resolve_track_order(sequence, tracks, global);
        let current: Vec<i64> = tracks.iter().map(|t| t.track_index).collect();
        if order != current {
            operations.push(PlannedOperation::TrackOrder { order });
        }
    }

    // default_flags
    if let Some(config) = &phase.default_flags {
        let mut changes = Vec::new();
        if let Some(language) = &config.audio_language {
            changes.extend(default_flag_changes(
                tracks,
                TrackType::Audio,
                language,
                config.clear_others,
            ));
        }
        if let Some(language) = &config.subtitle_language {
            changes.extend(default_flag_changes(
                tracks,
                TrackType::Subtitle,
                language,
                config.clear_others,
            ));
        }
        if !changes.is_empty() {
            operations.push(PlannedOperation::DefaultFlags { changes });
        }
    }

    // conditional (flag/language effects execute in canonical position)
    if !action_context.flag_changes.is_empty() || !action_context.language_changes.is_empty() {
        operations.push(PlannedOperation::Conditional {
            flag_changes: action_context.flag_changes.clone(),
            language_changes: action_context.language_changes.clone(),
        });
    }

    // audio_synthesis
    if let Some(config) = &phase.audio_synthesis {
        let (synth_operations, mut skipped) = plan_synthesis(
            &config.tracks,
            tracks,
            inputs.ctx,
            &global.commentary_patterns,
            inputs.available_encoders,
        );
        synthesis_skipped.append(&mut skipped);
        if !synth_operations.is_empty() {
            operations.push(PlannedOperation::AudioSynthesis {
                operations: synth_operations,
            });
        }
    }

    // video_transcode
    if let Some(config) = &phase.video_transcode {
        if !action_context.skip_video_transcode {
            let decision = analyze_video(tracks, config);
            if decision.needs_transcode {
                operations.push(PlannedOperation::VideoTranscode {
                    target_codec: config.target_codec.clone(),
                    decision,
                });
            }
        }
    }

    // audio_transcode
    if let Some(config) = &phase.audio_transcode {
        if !action_context.skip_audio_transcode {
            let track_indices: Vec<i64> = tracks
                .iter()
                .filter(|t| t.track_type == TrackType::Audio)
                .filter(|t| {
                    let codec = t.codec.as_deref().unwrap_or("");
                    if codecs_equal(TrackType::Audio, codec, &config.target_codec) {
                        return false;
                    }
                    config.only_codecs.is_empty()
                        || config
                            .only_codecs
                            .iter()
                            .any(|only| codecs_equal(TrackType::Audio, codec, only))
                })
                .map(|t| t.track_index)
                .collect();
            if !track_indices.is_empty() {
                operations.push(PlannedOperation::AudioTranscode {
                    config: config.clone(),
                    track_indices,
                });
            }
        }
    }

    // transcription
    if let Some(config) = &phase.transcription {
        operations.push(PlannedOperation::Transcription {
            config: config.clone(),
        });
    }

    // file_timestamp
    if let Some(config) = &phase.file_timestamp {
        if config.preserve_modification_time {
            operations.push(PlannedOperation::FileTimestamp {
                preserve_modification_time: true,
            });
        }
    }

    // audio_actions / subtitle_actions
    if let Some(config) = &phase.audio_actions {
        if !config.is_noop() {
            let changes = clear_flag_changes(
                tracks,
                TrackType::Audio,
                config.clear_forced,
                config.clear_default,
            );
            if !changes.is_empty() {
                operations.push(PlannedOperation::AudioActions { changes });
            }
        }
    }
    if let Some(config) = &phase.subtitle_actions {
        if !config.is_noop() {
            let changes = clear_flag_changes(
                tracks,
                TrackType::Subtitle,
                config.clear_forced,
                config.clear_default,
            );
            if !changes.is_empty() {
                operations.push(PlannedOperation::SubtitleActions { changes });
            }
        }
    }

    Ok(Plan {
        phase_name: phase.name.clone(),
        operations,
        warnings,
        synthesis_skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AudioFilterConfig, Condition, ConditionalRule, DefaultFlagsConfig, FallbackMode,
        RunIfCondition, TrackFilters,
    };

    fn audio(index: i64, lang: &str, default: bool) -> TrackInfo {
        let mut t = TrackInfo::new(1, index, TrackType::Audio);
        t.language = Some(lang.to_string());
        t.codec = Some("aac".to_string());
        t.channels = Some(2);
        t.is_default = default;
        t
    }

    fn video(index: i64) -> TrackInfo {
        let mut t = TrackInfo::new(1, index, TrackType::Video);
        t.codec = Some("hevc".to_string());
        t
    }

    fn inputs<'a>(tracks: &'a [TrackInfo], ctx: &'a EvalContext) -> PlanInputs<'a> {
        PlanInputs {
            tracks,
            container: Some("matroska"),
            ctx,
            available_encoders: None,
        }
    }

    fn phase(name: &str) -> Phase {
        Phase {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_phase_plans_empty() {
        let tracks = vec![video(0), audio(1, "eng", true)];
        let ctx = EvalContext::default();
        let plan = plan_phase(
            &phase("noop"),
            &GlobalConfig::default(),
            "/m/f.mkv",
            &inputs(&tracks, &ctx),
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn default_flags_plan_is_idempotent() {
        let tracks = vec![video(0), audio(1, "eng", false), audio(2, "deu", true)];
        let mut p = phase("defaults");
        p.default_flags = Some(DefaultFlagsConfig {
            audio_language: Some("eng".to_string()),
            subtitle_language: None,
            clear_others: true,
        });
        let ctx = EvalContext::default();
        let plan = plan_phase(&p, &GlobalConfig::default(), "/m/f.mkv", &inputs(&tracks, &ctx))
            .unwrap();
        assert_eq!(plan.operations.len(), 1);
        match &plan.operations[0] {
            PlannedOperation::DefaultFlags { changes } => {
                assert_eq!(changes.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Apply the plan to the in-memory tracks and plan again: empty.
        let mut applied = tracks.clone();
        applied[1].is_default = true;
        applied[2].is_default = false;
        let second = plan_phase(&p, &GlobalConfig::default(), "/m/f.mkv", &inputs(&applied, &ctx))
            .unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn gating_order_run_if_before_skip_when() {
        let tracks = vec![video(0)];
        let ctx = EvalContext::default();
        let mut p = phase("gated");
        p.run_if = Some(RunIfCondition {
            phase_modified: "earlier".to_string(),
        });
        p.skip_when = Some(vec![Condition::Exists {
            track_type: TrackType::Video,
            filters: TrackFilters::default(),
        }]);

        // run_if loses first even though skip_when would also skip.
        let gate = evaluate_gating(&p, &HashSet::new(), &tracks, &ctx);
        match gate {
            PhaseGate::Skipped(reason) => assert!(reason.starts_with("run_if"), "{reason}"),
            PhaseGate::Run => panic!("expected skip"),
        }

        let mut modified = HashSet::new();
        modified.insert("earlier".to_string());
        let gate = evaluate_gating(&p, &modified, &tracks, &ctx);
        match gate {
            PhaseGate::Skipped(reason) => assert!(reason.starts_with("skip_when"), "{reason}"),
            PhaseGate::Run => panic!("expected skip"),
        }
    }

    #[test]
    fn depends_on_unmodified_phase_skips() {
        let tracks = vec![video(0)];
        let ctx = EvalContext::default();
        let mut p = phase("dependent");
        p.depends_on = Some(vec!["remux".to_string()]);
        let gate = evaluate_gating(&p, &HashSet::new(), &tracks, &ctx);
        assert!(matches!(gate, PhaseGate::Skipped(_)));
    }

    #[test]
    fn conditional_skip_suppresses_track_filter() {
        let tracks = vec![video(0), audio(1, "jpn", false)];
        let ctx = EvalContext::default();
        let mut p = phase("guarded");
        p.audio_filter = Some(AudioFilterConfig {
            languages: vec!["eng".to_string()],
            minimum: 0,
            fallback: Some(FallbackMode::KeepAll),
            ..Default::default()
        });
        p.conditional = Some(vec![ConditionalRule {
            name: "protect".to_string(),
            when: Condition::Exists {
                track_type: TrackType::Audio,
                filters: TrackFilters::default(),
            },
            then_actions: vec![crate::types::ConditionalAction::Skip {
                target: crate::types::SkipTarget::TrackFilter,
            }],
            else_actions: vec![],
        }]);

        let plan =
            plan_phase(&p, &GlobalConfig::default(), "/m/f.mkv", &inputs(&tracks, &ctx)).unwrap();
        assert!(
            plan.operations
                .iter()
                .all(|op| op.kind() != "track_filter"),
            "{plan:?}"
        );
    }

    #[test]
    fn container_change_only_when_target_differs() {
        let tracks = vec![video(0)];
        let ctx = EvalContext::default();
        let mut p = phase("contain");
        p.container = Some(crate::types::ContainerConfig {
            target: "matroska".to_string(),
        });
        let plan =
            plan_phase(&p, &GlobalConfig::default(), "/m/f.mkv", &inputs(&tracks, &ctx)).unwrap();
        assert!(plan.is_empty());

        p.container = Some(crate::types::ContainerConfig {
            target: "mp4".to_string(),
        });
        let plan =
            plan_phase(&p, &GlobalConfig::default(), "/m/f.mkv", &inputs(&tracks, &ctx)).unwrap();
        assert_eq!(plan.operations.len(), 1);
    }

    #[test]
    fn track_order_resolves_symbolic_slots() {
        // subtitle, audio-alt, audio-main, video; reorder to canonical.
        let mut sub = TrackInfo::new(1, 0, TrackType::Subtitle);
        sub.language = Some("eng".to_string());
        let alt = audio(1, "deu", false);
        let main = audio(2, "eng", false);
        let v = video(3);
        let tracks = vec![sub, alt, main, v];

        let global = GlobalConfig {
            languages: vec!["eng".to_string()],
            ..Default::default()
        };
        let mut p = phase("order");
        p.track_order = Some(vec![
            TrackOrderSlot::Video,
            TrackOrderSlot::AudioMain,
            TrackOrderSlot::AudioAlternate,
            TrackOrderSlot::SubtitleMain,
        ]);
        let ctx = EvalContext::default();
        let plan = plan_phase(&p, &global, "/m/f.mkv", &inputs(&tracks, &ctx)).unwrap();
        match &plan.operations[0] {
            PlannedOperation::TrackOrder { order } => {
                assert_eq!(order, &vec![3, 2, 1, 0]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn audio_transcode_targets_only_mismatched_codecs() {
        let mut dts = audio(1, "eng", false);
        dts.codec = Some("dts".to_string());
        let tracks = vec![video(0), dts, audio(2, "eng", false)];
        let mut p = phase("audio");
        p.audio_transcode = Some(AudioTranscodeConfig {
            target_codec: "aac".to_string(),
            bitrate: None,
            only_codecs: vec![],
        });
        let ctx = EvalContext::default();
        let plan =
            plan_phase(&p, &GlobalConfig::default(), "/m/f.mkv", &inputs(&tracks, &ctx)).unwrap();
        match &plan.operations[0] {
            PlannedOperation::AudioTranscode { track_indices, .. } => {
                assert_eq!(track_indices, &vec![1]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
