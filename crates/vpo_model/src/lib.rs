//! Domain model for the Video Policy Orchestrator.
//!
//! Pure data types shared by every other crate: files and their tracks,
//! jobs, processing statistics, language analysis results, configuration,
//! and the data-directory layout. Nothing in here performs I/O beyond the
//! config loader reading environment variables.

pub mod analysis;
pub mod config;
pub mod file;
pub mod job;
pub mod language;
pub mod paths;
pub mod stats;
pub mod track;

pub use analysis::{
    AnalysisMetadata, LanguageAnalysisResult, LanguageClassification, LanguageSegment,
    SecondaryLanguage,
};
pub use config::{JobRetention, OnErrorMode, VpoConfig, WorkerLimits};
pub use file::{FileRecord, ScanStatus};
pub use job::{Job, JobStatus, JobType, StatusParseError};
pub use language::{canonical_language, display_language, languages_match, LanguageStandard};
pub use stats::{ActionResultRecord, EncoderType, PerformanceMetricsRecord, ProcessingStatsRecord};
pub use track::{TrackInfo, TrackType};
