//! Tool invocation errors.

use thiserror::Error;

/// Errors from discovering or running external media tools.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The required tool is not installed. Names both the tool and what it
    /// was needed for, so the user knows what to install and why.
    #[error("required tool '{tool}' is not available ({purpose})")]
    NotAvailable { tool: String, purpose: String },

    #[error("{tool} exited with status {code}: {stderr}")]
    ExitFailure {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("cannot parse {tool} output: {message}")]
    Parse { tool: String, message: String },

    #[error("io error running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn not_available(tool: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self::NotAvailable {
            tool: tool.into(),
            purpose: purpose.into(),
        }
    }

    pub fn io(tool: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            tool: tool.into(),
            source,
        }
    }
}
