//! Policy-layer errors.

use thiserror::Error;

/// Errors raised while loading, validating or planning a policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Structural problem in the document, caught at load time with enough
    /// location info to point the author at the offending phase or rule.
    #[error("policy validation failed at {location}: {message}")]
    Validation { location: String, message: String },

    /// Audio filtering would leave fewer tracks than the configured minimum
    /// and no fallback applies.
    #[error(
        "insufficient {track_type} tracks: need {required}, {available} would remain \
         (policy languages: {policy_languages:?}, file languages: {file_languages:?})"
    )]
    InsufficientTracks {
        track_type: &'static str,
        required: u32,
        available: u32,
        policy_languages: Vec<String>,
        file_languages: Vec<String>,
    },

    /// A conditional `fail` action fired.
    #[error("policy rule '{rule}' failed: {message}")]
    RuleFailed { rule: String, message: String },

    #[error("cannot deserialize policy document: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl PolicyError {
    pub fn validation(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            location: location.into(),
            message: message.into(),
        }
    }
}
