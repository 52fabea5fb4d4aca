//! Job records for the persistent work queue.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failed to parse a persisted enum value back into its typed form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value}")]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

impl StatusParseError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle state of a job.
///
/// Transitions are monotonic along two paths:
/// queued → running → {completed | failed}, and queued → cancelled.
/// Requeue re-enters queued from failed or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states carry a `completed_at` timestamp and never leave
    /// except via requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StatusParseError::new("job status", other)),
        }
    }
}

/// What kind of work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Scan,
    Apply,
    Transcode,
    Move,
    Process,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Apply => "apply",
            Self::Transcode => "transcode",
            Self::Move => "move",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan" => Ok(Self::Scan),
            "apply" => Ok(Self::Apply),
            "transcode" => Ok(Self::Transcode),
            "move" => Ok(Self::Move),
            "process" => Ok(Self::Process),
            other => Err(StatusParseError::new("job type", other)),
        }
    }
}

/// One row of the job queue.
///
/// `file_path` is denormalised from the file record so a job stays
/// meaningful even if the file row is deleted. `policy_json` is the opaque
/// serialized policy document the worker deserializes at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv4, assigned at insert.
    pub id: String,
    pub file_id: Option<i64>,
    pub file_path: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Lower value is claimed first.
    pub priority: i64,
    pub policy_name: Option<String>,
    pub policy_json: Option<String>,
    pub progress_percent: f64,
    pub progress_json: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub worker_pid: Option<i64>,
    pub worker_heartbeat: Option<String>,
    pub error_message: Option<String>,
    pub output_path: Option<String>,
    pub summary_json: Option<String>,
    pub log_path: Option<String>,
}

impl Job {
    /// A fresh queued job with a new UUID and default priority 100.
    pub fn new(job_type: JobType, file_path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_id: None,
            file_path: file_path.into(),
            job_type,
            status: JobStatus::Queued,
            priority: 100,
            policy_name: None,
            policy_json: None,
            progress_percent: 0.0,
            progress_json: None,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
            worker_pid: None,
            worker_heartbeat: None,
            error_message: None,
            output_path: None,
            summary_json: None,
            log_path: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_policy(mut self, name: impl Into<String>, json: impl Into<String>) -> Self {
        self.policy_name = Some(name.into());
        self.policy_json = Some(json.into());
        self
    }

    pub fn with_file_id(mut self, file_id: i64) -> Self {
        self.file_id = Some(file_id);
        self
    }

    /// First eight characters of the id, for compact log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}
