//! Runtime configuration.
//!
//! Built-in defaults overlaid with `VPO_*` environment variables. Invalid
//! numeric values fall back to the default with a warning rather than
//! aborting, so a typo in a deployment never takes the worker down.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::job::StatusParseError;
use crate::language::LanguageStandard;
use crate::paths;

/// What a failed operation does to the rest of its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnErrorMode {
    /// Abort the phase and surface the error.
    #[default]
    Fail,
    /// Skip the remaining operations of the phase.
    Skip,
    /// Carry on with the next operation.
    Continue,
}

impl OnErrorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Continue => "continue",
        }
    }
}

impl fmt::Display for OnErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnErrorMode {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            "continue" => Ok(Self::Continue),
            other => Err(StatusParseError::new("on_error mode", other)),
        }
    }
}

/// Worker stop conditions and tuning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerLimits {
    /// Stop after this many files. `None` means unlimited.
    pub max_files: Option<u64>,
    /// Stop after this many wall seconds.
    pub max_duration_secs: Option<u64>,
    /// Stop at the next local `HH:MM`.
    pub end_by: Option<String>,
    /// Thread count handed to the transcoder.
    pub cpu_cores: Option<u32>,
}

/// Retention knobs for jobs and their logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRetention {
    pub retention_days: u32,
    pub log_compression_days: u32,
    pub log_deletion_days: u32,
    pub auto_purge: bool,
}

impl Default for JobRetention {
    fn default() -> Self {
        Self {
            retention_days: 30,
            log_compression_days: 7,
            log_deletion_days: 90,
            auto_purge: true,
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpoConfig {
    pub data_dir: PathBuf,
    /// Per-connection busy timeout, seconds.
    pub db_busy_timeout_secs: u64,
    pub worker: WorkerLimits,
    pub jobs: JobRetention,
    pub language_standard: LanguageStandard,
    pub on_error: OnErrorMode,
}

impl Default for VpoConfig {
    fn default() -> Self {
        Self {
            data_dir: paths::data_dir(),
            db_busy_timeout_secs: 10,
            worker: WorkerLimits::default(),
            jobs: JobRetention::default(),
            language_standard: LanguageStandard::default(),
            on_error: OnErrorMode::default(),
        }
    }
}

impl VpoConfig {
    /// Defaults overlaid with `VPO_*` environment variables.
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    /// Same as [`VpoConfig::from_env`] but reading from an explicit map,
    /// which keeps the parsing testable without touching process state.
    pub fn from_map(env: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = get_str(env, "VPO_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = get_parsed(env, "VPO_DB_BUSY_TIMEOUT") {
            config.db_busy_timeout_secs = v;
        }
        config.worker.max_files = get_parsed(env, "VPO_WORKER_MAX_FILES");
        config.worker.max_duration_secs = get_parsed(env, "VPO_WORKER_MAX_DURATION");
        config.worker.end_by = get_str(env, "VPO_WORKER_END_BY");
        config.worker.cpu_cores = get_parsed(env, "VPO_WORKER_CPU_CORES");
        if let Some(v) = get_parsed(env, "VPO_JOB_RETENTION_DAYS") {
            config.jobs.retention_days = v;
        }
        if let Some(v) = get_parsed(env, "VPO_LOG_COMPRESSION_DAYS") {
            config.jobs.log_compression_days = v;
        }
        if let Some(v) = get_parsed(env, "VPO_LOG_DELETION_DAYS") {
            config.jobs.log_deletion_days = v;
        }
        if let Some(raw) = get_str(env, "VPO_ON_ERROR") {
            match raw.parse() {
                Ok(mode) => config.on_error = mode,
                Err(e) => warn!("ignoring VPO_ON_ERROR: {e}"),
            }
        }
        if let Some(raw) = get_str(env, "VPO_LANGUAGE_STANDARD") {
            match raw.parse() {
                Ok(standard) => config.language_standard = standard,
                Err(e) => warn!("ignoring VPO_LANGUAGE_STANDARD: {e}"),
            }
        }

        config
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("library.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn get_str(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key).filter(|v| !v.is_empty()).cloned()
}

fn get_parsed<T: FromStr>(env: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = env.get(key).filter(|v| !v.is_empty())?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw}: not a valid value");
            None
        }
    }
}
