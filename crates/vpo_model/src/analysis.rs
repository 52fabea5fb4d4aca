//! Language analysis results produced by transcription plugins.

use serde::{Deserialize, Serialize};

/// Whether a track's speech is one language or several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguageClassification {
    #[serde(rename = "SINGLE_LANGUAGE")]
    SingleLanguage,
    #[serde(rename = "MULTI_LANGUAGE")]
    MultiLanguage,
}

/// A contiguous span of detected speech in one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSegment {
    pub language: String,
    pub start_time: f64,
    pub end_time: f64,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
}

/// A non-primary language and its share of the analysed speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryLanguage {
    pub language: String,
    /// Fraction of analysed speech in `[0, 1]`.
    pub percentage: f64,
}

/// Provenance of an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub plugin_name: String,
    pub plugin_version: Option<String>,
    pub model: Option<String>,
    /// Seconds into the file where samples were taken.
    pub sample_positions: Vec<f64>,
    /// Fraction of sampled audio that contained speech.
    pub speech_ratio: Option<f64>,
}

/// Cached per-track language analysis.
///
/// The cache is valid only while `file_hash` equals the file's current
/// partial hash; a re-encoded or replaced file invalidates every analysis
/// hanging off its old tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageAnalysisResult {
    pub id: i64,
    pub track_id: i64,
    /// Partial hash of the file at analysis time.
    pub file_hash: String,
    pub primary_language: String,
    /// Fraction of speech in the primary language, `[0, 1]`.
    pub primary_percentage: f64,
    pub classification: LanguageClassification,
    pub secondary_languages: Vec<SecondaryLanguage>,
    pub segments: Vec<LanguageSegment>,
    pub metadata: AnalysisMetadata,
}

impl LanguageAnalysisResult {
    /// Whether this cached result still describes the file.
    pub fn is_valid_for(&self, current_hash: &str) -> bool {
        self.file_hash == current_hash
    }
}
