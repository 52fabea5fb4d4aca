//! Structural validation of policy documents.
//!
//! Runs once at load time; the worker only ever sees documents that passed.
//! Every rejection carries a location string pointing at the offending
//! phase, rule or definition.

use std::collections::HashSet;

use regex::Regex;

use crate::error::PolicyError;
use crate::types::{
    Condition, ConditionalRule, MetadataOperator, Phase, PolicyDocument, TitleMatch,
    MIN_SCHEMA_VERSION, RESERVED_PHASE_NAMES,
};

/// Validate a whole document.
pub fn validate_policy(document: &PolicyDocument) -> Result<(), PolicyError> {
    if document.schema_version < MIN_SCHEMA_VERSION {
        return Err(PolicyError::validation(
            "schema_version",
            format!(
                "schema version {} is older than the minimum supported {MIN_SCHEMA_VERSION}",
                document.schema_version
            ),
        ));
    }

    for (index, pattern) in document.config.commentary_patterns.iter().enumerate() {
        Regex::new(pattern).map_err(|e| {
            PolicyError::validation(
                format!("config.commentary_patterns[{index}]"),
                format!("invalid regex: {e}"),
            )
        })?;
    }
    for (index, language) in document.config.languages.iter().enumerate() {
        validate_language_code(language, &format!("config.languages[{index}]"))?;
    }

    let mut seen_names: HashSet<String> = HashSet::new();
    for (position, phase) in document.phases.iter().enumerate() {
        let location = format!("phases[{position}] '{}'", phase.name);

        validate_phase_name(phase, &location)?;
        let lowered = phase.name.to_lowercase();
        if !seen_names.insert(lowered) {
            return Err(PolicyError::validation(
                location,
                format!("duplicate phase name '{}'", phase.name),
            ));
        }

        validate_phase_references(document, position, phase, &location)?;
        validate_phase_contents(phase, &location)?;
    }

    Ok(())
}

fn validate_phase_name(phase: &Phase, location: &str) -> Result<(), PolicyError> {
    if phase.name.trim().is_empty() {
        return Err(PolicyError::validation(location, "phase name is empty"));
    }
    let lowered = phase.name.to_lowercase();
    if RESERVED_PHASE_NAMES.contains(&lowered.as_str()) {
        return Err(PolicyError::validation(
            location,
            format!("phase name '{}' is reserved", phase.name),
        ));
    }
    Ok(())
}

/// `depends_on` and `run_if` may only reference phases that appear strictly
/// earlier in the list.
fn validate_phase_references(
    document: &PolicyDocument,
    position: usize,
    phase: &Phase,
    location: &str,
) -> Result<(), PolicyError> {
    let earlier: HashSet<&str> = document.phases[..position]
        .iter()
        .map(|p| p.name.as_str())
        .collect();

    if let Some(depends_on) = &phase.depends_on {
        for dependency in depends_on {
            if !earlier.contains(dependency.as_str()) {
                let known = document.phase_names().contains(&dependency.as_str());
                let message = if known {
                    format!("depends_on references '{dependency}', which appears later; dependencies must reference earlier phases")
                } else {
                    format!("depends_on references unknown phase '{dependency}'")
                };
                return Err(PolicyError::validation(location, message));
            }
        }
    }

    if let Some(run_if) = &phase.run_if {
        let reference = run_if.phase_modified.as_str();
        if !earlier.contains(reference) {
            let known = document.phase_names().contains(&reference);
            let message = if known {
                format!("run_if references '{reference}', which appears later; run_if must reference earlier phases")
            } else {
                format!("run_if references unknown phase '{reference}'")
            };
            return Err(PolicyError::validation(location, message));
        }
    }

    Ok(())
}

fn validate_phase_contents(phase: &Phase, location: &str) -> Result<(), PolicyError> {
    if let Some(conditions) = &phase.skip_when {
        if conditions.is_empty() {
            return Err(PolicyError::validation(
                format!("{location}.skip_when"),
                "skip_when must specify at least one condition",
            ));
        }
        for (index, condition) in conditions.iter().enumerate() {
            validate_condition(condition, &format!("{location}.skip_when[{index}]"))?;
        }
    }

    if let Some(rules) = &phase.conditional {
        for (index, rule) in rules.iter().enumerate() {
            validate_rule(rule, &format!("{location}.conditional[{index}]"))?;
        }
    }

    if let Some(audio) = &phase.audio_filter {
        for (index, language) in audio.languages.iter().enumerate() {
            validate_language_code(
                language,
                &format!("{location}.audio_filter.languages[{index}]"),
            )?;
        }
    }

    if let Some(synthesis) = &phase.audio_synthesis {
        for (index, definition) in synthesis.tracks.iter().enumerate() {
            let synth_location = format!("{location}.audio_synthesis.tracks[{index}]");
            validate_synthesis_name(&definition.name, &synth_location)?;
            if let Some(condition) = &definition.create_if {
                validate_condition(condition, &format!("{synth_location}.create_if"))?;
            }
        }
    }

    Ok(())
}

fn validate_rule(rule: &ConditionalRule, location: &str) -> Result<(), PolicyError> {
    if rule.name.trim().is_empty() {
        return Err(PolicyError::validation(location, "rule name is empty"));
    }
    if rule.then_actions.is_empty() && rule.else_actions.is_empty() {
        return Err(PolicyError::validation(
            location,
            "rule has no then_actions or else_actions",
        ));
    }
    validate_condition(&rule.when, &format!("{location}.when"))
}

/// Names become part of track titles and temp file names; path separators
/// and traversal sequences are rejected anywhere in the string, harmless or
/// not.
fn validate_synthesis_name(name: &str, location: &str) -> Result<(), PolicyError> {
    if name.trim().is_empty() {
        return Err(PolicyError::validation(location, "synthesis name is empty"));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(PolicyError::validation(
            location,
            format!("synthesis name '{name}' must not contain '/', '\\' or '..'"),
        ));
    }
    Ok(())
}

fn validate_language_code(code: &str, location: &str) -> Result<(), PolicyError> {
    let trimmed = code.trim();
    let valid = (2..=3).contains(&trimmed.len())
        && trimmed.chars().all(|c| c.is_ascii_alphabetic());
    if !valid {
        return Err(PolicyError::validation(
            location,
            format!("'{code}' is not a valid ISO 639 language code"),
        ));
    }
    Ok(())
}

fn validate_condition(condition: &Condition, location: &str) -> Result<(), PolicyError> {
    match condition {
        Condition::Exists { filters, .. } | Condition::Count { filters, .. } => {
            if let Some(TitleMatch::Spec {
                contains, regex, ..
            }) = &filters.title
            {
                if contains.is_none() && regex.is_none() {
                    return Err(PolicyError::validation(
                        location,
                        "title match must set 'contains' or 'regex'",
                    ));
                }
                if let Some(pattern) = regex {
                    Regex::new(pattern).map_err(|e| {
                        PolicyError::validation(location, format!("invalid title regex: {e}"))
                    })?;
                }
            }
            if let Some(languages) = &filters.language {
                for language in languages {
                    validate_language_code(language, location)?;
                }
            }
            Ok(())
        }

        Condition::AudioIsMultiLanguage { threshold, .. } => {
            if !(0.0..=1.0).contains(threshold) {
                return Err(PolicyError::validation(
                    location,
                    format!("threshold {threshold} must be within [0, 1]"),
                ));
            }
            Ok(())
        }

        Condition::PluginMetadata {
            plugin,
            field,
            value,
            operator,
        } => {
            if plugin.trim().is_empty() {
                return Err(PolicyError::validation(location, "plugin name is empty"));
            }
            if field.trim().is_empty() {
                return Err(PolicyError::validation(location, "field name is empty"));
            }
            validate_metadata_operator(*operator, value.as_ref(), location)
        }

        Condition::ContainerMetadata {
            field,
            value,
            operator,
        } => {
            if field.trim().is_empty() {
                return Err(PolicyError::validation(location, "field name is empty"));
            }
            validate_metadata_operator(*operator, value.as_ref(), location)
        }

        Condition::IsOriginal { min_confidence, .. }
        | Condition::IsDubbed { min_confidence, .. } => {
            if !(0.0..=1.0).contains(min_confidence) {
                return Err(PolicyError::validation(
                    location,
                    format!("min_confidence {min_confidence} must be within [0, 1]"),
                ));
            }
            Ok(())
        }

        Condition::And { conditions } | Condition::Or { conditions } => {
            if conditions.is_empty() {
                return Err(PolicyError::validation(
                    location,
                    "boolean operator needs at least one condition",
                ));
            }
            for (index, sub) in conditions.iter().enumerate() {
                validate_condition(sub, &format!("{location}[{index}]"))?;
            }
            Ok(())
        }

        Condition::Not { condition } => validate_condition(condition, location),
    }
}

fn validate_metadata_operator(
    operator: MetadataOperator,
    value: Option<&serde_json::Value>,
    location: &str,
) -> Result<(), PolicyError> {
    match operator {
        MetadataOperator::Exists => {
            if value.is_some() {
                return Err(PolicyError::validation(
                    location,
                    "operator 'exists' does not take a value",
                ));
            }
        }
        _ => {
            let Some(value) = value else {
                return Err(PolicyError::validation(
                    location,
                    format!(
                        "operator '{}' requires a value; use 'exists' to test presence",
                        operator.as_str()
                    ),
                ));
            };
            if operator.is_numeric() && !value.is_number() {
                return Err(PolicyError::validation(
                    location,
                    format!("operator '{}' requires a numeric value", operator.as_str()),
                ));
            }
        }
    }
    Ok(())
}
