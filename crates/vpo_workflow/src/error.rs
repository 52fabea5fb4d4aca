//! Workflow errors.

use thiserror::Error;

use vpo_db::DbError;
use vpo_policy::PolicyError;
use vpo_tools::ToolError;

/// Errors from executing phases and workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A phase failed hard (on-error `fail`, or an unexpected error after
    /// modification). Carries the phase, the operation when known, and the
    /// underlying message.
    #[error("phase '{phase}' failed (operation: {}): {message}", .operation.as_deref().unwrap_or("-"))]
    PhaseExecution {
        phase: String,
        operation: Option<String>,
        message: String,
    },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    pub fn phase(
        phase: impl Into<String>,
        operation: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PhaseExecution {
            phase: phase.into(),
            operation,
            message: message.into(),
        }
    }
}
