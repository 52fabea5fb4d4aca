//! Job-layer errors.

use thiserror::Error;

use vpo_db::DbError;
use vpo_policy::PolicyError;
use vpo_tools::ToolError;
use vpo_workflow::WorkflowError;

use crate::logs::LogError;

/// Errors surfaced by queue operations and the worker runtime.
#[derive(Debug, Error)]
pub enum JobsError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid job state: {0}")]
    InvalidState(String),
}
