//! Conditional rule actions.
//!
//! Actions run at plan time against an [`ActionContext`]. They record flag
//! and language changes, raise warnings, set skip flags for later
//! operations of the phase, or fail the phase outright.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use vpo_model::{languages_match, TrackInfo};

use crate::error::PolicyError;
use crate::types::{ConditionalAction, PluginFieldRef, SkipTarget};

/// A pending flag change on one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackFlagChange {
    pub track_index: i64,
    /// `default` or `forced`.
    pub flag: FlagKind,
    pub value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    Default,
    Forced,
}

/// A pending language retag on one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackLanguageChange {
    pub track_index: i64,
    pub new_language: String,
}

/// Mutable accumulator threaded through a phase's conditional rules.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub file_path: String,
    pub rule_name: String,
    pub tracks: Vec<TrackInfo>,
    pub plugin_metadata: HashMap<String, HashMap<String, Value>>,
    pub skip_video_transcode: bool,
    pub skip_audio_transcode: bool,
    pub skip_track_filter: bool,
    pub warnings: Vec<String>,
    pub flag_changes: Vec<TrackFlagChange>,
    pub language_changes: Vec<TrackLanguageChange>,
}

impl ActionContext {
    pub fn new(file_path: impl Into<String>, tracks: Vec<TrackInfo>) -> Self {
        Self {
            file_path: file_path.into(),
            tracks,
            ..Default::default()
        }
    }

    fn filename(&self) -> String {
        Path::new(&self.file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_path.clone())
    }

    /// Substitute `{filename}`, `{path}` and `{rule_name}` in a template.
    pub fn substitute(&self, template: &str) -> String {
        template
            .replace("{filename}", &self.filename())
            .replace("{path}", &self.file_path)
            .replace("{rule_name}", &self.rule_name)
    }
}

fn matching_track_indices(
    context: &ActionContext,
    track_type: vpo_model::TrackType,
    language: Option<&str>,
) -> Vec<i64> {
    context
        .tracks
        .iter()
        .filter(|t| t.track_type == track_type)
        .filter(|t| match language {
            Some(expected) => t
                .language
                .as_deref()
                .map(|lang| languages_match(lang, expected))
                .unwrap_or(false),
            None => true,
        })
        .map(|t| t.track_index)
        .collect()
}

fn resolve_plugin_language(context: &ActionContext, reference: &PluginFieldRef) -> Option<String> {
    let plugin = context
        .plugin_metadata
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(&reference.plugin))
        .map(|(_, fields)| fields)?;
    let value = plugin
        .iter()
        .find(|(field, _)| field.eq_ignore_ascii_case(&reference.field))
        .map(|(_, value)| value)?;
    match value {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Execute one action against the context.
pub fn execute_action(
    action: &ConditionalAction,
    context: &mut ActionContext,
) -> Result<(), PolicyError> {
    match action {
        ConditionalAction::Skip { target } => {
            match target {
                SkipTarget::VideoTranscode => context.skip_video_transcode = true,
                SkipTarget::AudioTranscode => context.skip_audio_transcode = true,
                SkipTarget::TrackFilter => context.skip_track_filter = true,
            }
            debug!("rule '{}' set skip flag {:?}", context.rule_name, target);
            Ok(())
        }

        ConditionalAction::Warn { message } => {
            let rendered = context.substitute(message);
            warn!("policy warning: {rendered}");
            context.warnings.push(rendered);
            Ok(())
        }

        ConditionalAction::Fail { message } => Err(PolicyError::RuleFailed {
            rule: context.rule_name.clone(),
            message: context.substitute(message),
        }),

        ConditionalAction::SetForced {
            track_type,
            language,
            value,
        } => {
            let indices = matching_track_indices(context, *track_type, language.as_deref());
            if indices.is_empty() {
                warn!(
                    "set_forced: no matching {track_type} tracks in {}",
                    context.file_path
                );
                return Ok(());
            }
            for track_index in indices {
                context.flag_changes.push(TrackFlagChange {
                    track_index,
                    flag: FlagKind::Forced,
                    value: *value,
                });
            }
            Ok(())
        }

        ConditionalAction::SetDefault {
            track_type,
            language,
            value,
        } => {
            let indices = matching_track_indices(context, *track_type, language.as_deref());
            // There can be only one default per type; only the first match
            // gets the flag.
            match indices.first() {
                Some(track_index) => {
                    context.flag_changes.push(TrackFlagChange {
                        track_index: *track_index,
                        flag: FlagKind::Default,
                        value: *value,
                    });
                }
                None => warn!(
                    "set_default: no matching {track_type} tracks in {}",
                    context.file_path
                ),
            }
            Ok(())
        }

        ConditionalAction::SetLanguage {
            track_type,
            new_language,
            from_plugin_metadata,
            match_language,
        } => {
            let resolved = match (new_language, from_plugin_metadata) {
                (Some(language), _) => Some(language.clone()),
                (None, Some(reference)) => resolve_plugin_language(context, reference),
                (None, None) => None,
            };
            let Some(resolved) = resolved else {
                debug!("set_language: could not resolve a language, skipping");
                return Ok(());
            };

            let indices = matching_track_indices(context, *track_type, match_language.as_deref());
            if indices.is_empty() {
                warn!(
                    "set_language: no matching {track_type} tracks in {}",
                    context.file_path
                );
                return Ok(());
            }
            for track_index in indices {
                context.language_changes.push(TrackLanguageChange {
                    track_index,
                    new_language: resolved.clone(),
                });
            }
            Ok(())
        }
    }
}

/// Execute a sequence of actions in order, stopping at the first `fail`.
pub fn execute_actions(
    actions: &[ConditionalAction],
    context: &mut ActionContext,
) -> Result<(), PolicyError> {
    for action in actions {
        execute_action(action, context)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpo_model::TrackType;

    fn context_with_tracks() -> ActionContext {
        let mut eng = TrackInfo::new(1, 1, TrackType::Audio);
        eng.language = Some("eng".to_string());
        let mut ger = TrackInfo::new(1, 2, TrackType::Audio);
        ger.language = Some("ger".to_string());
        let mut sub = TrackInfo::new(1, 3, TrackType::Subtitle);
        sub.language = Some("eng".to_string());
        let mut ctx = ActionContext::new("/media/show/e01.mkv", vec![eng, ger, sub]);
        ctx.rule_name = "prefer-english".to_string();
        ctx
    }

    #[test]
    fn warn_substitutes_placeholders() {
        let mut ctx = context_with_tracks();
        execute_action(
            &ConditionalAction::Warn {
                message: "{rule_name}: check {filename}".to_string(),
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(ctx.warnings, vec!["prefer-english: check e01.mkv"]);
    }

    #[test]
    fn fail_raises_with_substitution() {
        let mut ctx = context_with_tracks();
        let err = execute_action(
            &ConditionalAction::Fail {
                message: "bad file {path}".to_string(),
            },
            &mut ctx,
        )
        .unwrap_err();
        match err {
            PolicyError::RuleFailed { rule, message } => {
                assert_eq!(rule, "prefer-english");
                assert!(message.contains("/media/show/e01.mkv"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn set_forced_applies_to_all_language_matches() {
        let mut ctx = context_with_tracks();
        execute_action(
            &ConditionalAction::SetForced {
                track_type: TrackType::Audio,
                language: Some("deu".to_string()),
                value: true,
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(
            ctx.flag_changes,
            vec![TrackFlagChange {
                track_index: 2,
                flag: FlagKind::Forced,
                value: true
            }]
        );
    }

    #[test]
    fn set_default_picks_only_first_match() {
        let mut ctx = context_with_tracks();
        execute_action(
            &ConditionalAction::SetDefault {
                track_type: TrackType::Audio,
                language: None,
                value: true,
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(ctx.flag_changes.len(), 1);
        assert_eq!(ctx.flag_changes[0].track_index, 1);
    }

    #[test]
    fn set_language_from_plugin_metadata() {
        let mut ctx = context_with_tracks();
        ctx.plugin_metadata.insert(
            "Radarr".to_string(),
            [(
                "Original_Language".to_string(),
                Value::String("jpn".to_string()),
            )]
            .into_iter()
            .collect(),
        );
        execute_action(
            &ConditionalAction::SetLanguage {
                track_type: TrackType::Audio,
                new_language: None,
                from_plugin_metadata: Some(PluginFieldRef {
                    plugin: "radarr".to_string(),
                    field: "original_language".to_string(),
                }),
                match_language: Some("eng".to_string()),
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(
            ctx.language_changes,
            vec![TrackLanguageChange {
                track_index: 1,
                new_language: "jpn".to_string()
            }]
        );
    }

    #[test]
    fn skip_flags_accumulate() {
        let mut ctx = context_with_tracks();
        execute_actions(
            &[
                ConditionalAction::Skip {
                    target: SkipTarget::VideoTranscode,
                },
                ConditionalAction::Skip {
                    target: SkipTarget::TrackFilter,
                },
            ],
            &mut ctx,
        )
        .unwrap();
        assert!(ctx.skip_video_transcode);
        assert!(ctx.skip_track_filter);
        assert!(!ctx.skip_audio_transcode);
    }
}
