//! Shared subprocess invocation.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

/// Captured output of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a tool to completion, capturing output. Exit 0 is success; anything
/// else (or a timeout, after killing the child) is an error carrying the
/// captured stderr verbatim.
pub(crate) async fn run_tool(
    name: &str,
    path: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<ToolOutput, ToolError> {
    debug!("running {name} {}", args.join(" "));

    let output = tokio::time::timeout(timeout, Command::new(path).args(args).output())
        .await
        .map_err(|_| ToolError::Timeout {
            tool: name.to_string(),
            seconds: timeout.as_secs(),
        })?
        .map_err(|e| ToolError::io(name, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ToolError::ExitFailure {
            tool: name.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    Ok(ToolOutput { stdout, stderr })
}
