//! Per-job execution logs.
//!
//! One append-only text file per job at `logs/<uuid>.log`. Job ids are
//! validated against a strict UUID pattern before they touch a path, and
//! the resolved path is additionally checked to sit inside the logs
//! directory. Both checks stay even though the second cannot fire for a
//! valid UUID.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use flate2::read::GzDecoder;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use vpo_workflow::WorkflowLog;

/// Default page size for the tail reader.
pub const DEFAULT_LOG_LINES: usize = 500;

/// Files up to this size are read whole; larger ones stream line by line.
pub const MAX_IN_MEMORY_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Lines buffered before a flush.
const DEFAULT_BUFFER_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid job id format: {0}")]
    InvalidJobId(String),

    #[error("log path escapes the logs directory: {0}")]
    PathTraversal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
        )
        .expect("static pattern compiles")
    })
}

fn validate_job_id(job_id: &str) -> Result<(), LogError> {
    if uuid_pattern().is_match(job_id) {
        Ok(())
    } else {
        Err(LogError::InvalidJobId(job_id.to_string()))
    }
}

/// `<logs_dir>/<job_id>.log`, with both validation layers applied.
pub fn log_path(logs_dir: &Path, job_id: &str) -> Result<PathBuf, LogError> {
    validate_job_id(job_id)?;
    let path = logs_dir.join(format!("{job_id}.log"));
    if !path.starts_with(logs_dir) {
        return Err(LogError::PathTraversal(job_id.to_string()));
    }
    Ok(path)
}

fn gz_path(log_path: &Path) -> PathBuf {
    let mut name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".gz");
    log_path.with_file_name(name)
}

struct LogFileState {
    buffer: Vec<String>,
    file: Option<File>,
}

/// Buffered, thread-safe writer for one job's log.
///
/// Every line carries an ISO-8601 UTC timestamp. The buffer flushes every
/// `buffer_size` lines and on close; dropping the writer flushes too.
pub struct JobLogWriter {
    job_id: String,
    path: PathBuf,
    buffer_size: usize,
    state: Mutex<LogFileState>,
}

impl JobLogWriter {
    pub fn new(logs_dir: &Path, job_id: &str) -> Result<Self, LogError> {
        Self::with_buffer_size(logs_dir, job_id, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        logs_dir: &Path,
        job_id: &str,
        buffer_size: usize,
    ) -> Result<Self, LogError> {
        let path = log_path(logs_dir, job_id)?;
        std::fs::create_dir_all(logs_dir)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            job_id: job_id.to_string(),
            path,
            buffer_size: buffer_size.max(1),
            state: Mutex::new(LogFileState {
                buffer: Vec::new(),
                file: Some(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `logs/<job_id>.log`, as stored on the job row.
    pub fn relative_path(&self) -> String {
        format!("logs/{}.log", self.job_id)
    }

    fn flush_locked(state: &mut LogFileState) {
        if state.buffer.is_empty() {
            return;
        }
        if let Some(file) = state.file.as_mut() {
            let mut chunk = state.buffer.join("\n");
            chunk.push('\n');
            if let Err(e) = file.write_all(chunk.as_bytes()).and_then(|_| file.flush()) {
                warn!("job log write failed: {e}");
            }
        }
        state.buffer.clear();
    }

    pub fn write_line(&self, line: &str) {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.file.is_none() {
            return;
        }
        state.buffer.push(format!("[{timestamp}] {line}"));
        if state.buffer.len() >= self.buffer_size {
            Self::flush_locked(&mut state);
        }
    }

    pub fn flush(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::flush_locked(&mut state);
    }

    pub fn write_header(&self, job_type: &str, file_path: &str, metadata: &[(&str, &str)]) {
        self.write_line(&"=".repeat(60));
        self.write_line(&format!("JOB START: {}", self.job_id));
        self.write_line(&format!("Type: {job_type}"));
        self.write_line(&format!("File: {file_path}"));
        for (key, value) in metadata {
            self.write_line(&format!("{key}: {value}"));
        }
        self.write_line(&"=".repeat(60));
    }

    pub fn write_footer(&self, success: bool, duration_seconds: Option<f64>) {
        self.write_line(&"=".repeat(60));
        let status = if success { "SUCCESS" } else { "FAILED" };
        self.write_line(&format!("JOB END: {status}"));
        if let Some(duration) = duration_seconds {
            self.write_line(&format!("Duration: {duration:.2}s"));
        }
        self.write_line(&"=".repeat(60));
        self.flush();
    }

    pub fn write_section(&self, title: &str) {
        self.write_line(&"-".repeat(40));
        self.write_line(title);
        self.write_line(&"-".repeat(40));
    }

    pub fn write_subprocess(&self, name: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.write_section(&format!("Command: {name}"));
        self.write_line(&format!("Exit code: {exit_code}"));
        if !stdout.trim().is_empty() {
            self.write_line("STDOUT:");
            for line in stdout.trim().lines() {
                self.write_line(&format!("  {line}"));
            }
        }
        if !stderr.trim().is_empty() {
            self.write_line("STDERR:");
            for line in stderr.trim().lines() {
                self.write_line(&format!("  {line}"));
            }
        }
    }

    pub fn write_error(&self, message: &str, cause: Option<&dyn std::error::Error>) {
        self.write_line(&format!("ERROR: {message}"));
        if let Some(cause) = cause {
            self.write_line(&format!("Cause: {cause}"));
        }
    }

    /// Flush and close the underlying file. Further writes are dropped.
    pub fn close(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::flush_locked(&mut state);
        state.file = None;
    }
}

impl Drop for JobLogWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl WorkflowLog for JobLogWriter {
    fn write_line(&self, line: &str) {
        JobLogWriter::write_line(self, line);
    }

    fn write_section(&self, title: &str) {
        JobLogWriter::write_section(self, title);
    }
}

fn slice_lines(all_lines: Vec<String>, lines: usize, offset: usize) -> (Vec<String>, usize, bool) {
    let total = all_lines.len();
    let chunk: Vec<String> = all_lines.into_iter().skip(offset).take(lines).collect();
    let has_more = offset + lines < total;
    (chunk, total, has_more)
}

/// Read a slice of a job's log.
///
/// Returns `(lines, total_lines, has_more)`. Reads the `.log.gz` form
/// transparently when the uncompressed file is gone; an invalid job id or
/// missing file yields an empty result rather than an error, matching what
/// a UI pager wants.
pub fn read_log_tail(
    logs_dir: &Path,
    job_id: &str,
    lines: usize,
    offset: usize,
) -> (Vec<String>, usize, bool) {
    let Ok(path) = log_path(logs_dir, job_id) else {
        return (Vec::new(), 0, false);
    };

    let gz = gz_path(&path);
    if gz.exists() {
        let Ok(file) = File::open(&gz) else {
            return (Vec::new(), 0, false);
        };
        let mut content = String::new();
        if GzDecoder::new(file).read_to_string(&mut content).is_err() {
            return (Vec::new(), 0, false);
        }
        let all: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        return slice_lines(all, lines, offset);
    }

    if !path.exists() {
        return (Vec::new(), 0, false);
    }
    let Ok(metadata) = std::fs::metadata(&path) else {
        return (Vec::new(), 0, false);
    };

    if metadata.len() <= MAX_IN_MEMORY_LOG_BYTES {
        let Ok(content) = std::fs::read_to_string(&path) else {
            return (Vec::new(), 0, false);
        };
        let all: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        return slice_lines(all, lines, offset);
    }

    // Large file: stream, counting while slicing.
    let Ok(file) = File::open(&path) else {
        return (Vec::new(), 0, false);
    };
    let reader = BufReader::new(file);
    let mut total = 0usize;
    let mut chunk = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if total >= offset && chunk.len() < lines {
            chunk.push(line);
        }
        total += 1;
    }
    let has_more = offset + chunk.len() < total;
    (chunk, total, has_more)
}

/// Whether a log (compressed or not) exists for the job.
pub fn log_file_exists(logs_dir: &Path, job_id: &str) -> bool {
    match log_path(logs_dir, job_id) {
        Ok(path) => path.exists() || gz_path(&path).exists(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    const JOB_ID: &str = "2b7f3c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c";

    #[test]
    fn rejects_non_uuid_job_ids() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["../escape", "notauuid", "", "2b7f3c1a", "a/b"] {
            assert!(
                JobLogWriter::new(dir.path(), bad).is_err(),
                "'{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn writes_timestamped_lines_with_header_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JobLogWriter::with_buffer_size(dir.path(), JOB_ID, 2).unwrap();
        writer.write_header("process", "/m/f.mkv", &[("policy", "default")]);
        writer.write_line("doing things");
        writer.write_footer(true, Some(1.5));
        writer.close();

        let content = std::fs::read_to_string(writer.path()).unwrap();
        assert!(content.contains(&format!("JOB START: {JOB_ID}")));
        assert!(content.contains("policy: default"));
        assert!(content.contains("doing things"));
        let last_non_empty = content.lines().rev().find(|l| !l.is_empty()).unwrap();
        assert!(last_non_empty.contains("="));
        assert!(content.contains("JOB END: SUCCESS"));
        assert!(content.contains("Duration: 1.50s"));
        // Every line starts with a bracketed UTC timestamp.
        for line in content.lines().filter(|l| !l.is_empty()) {
            assert!(line.starts_with('['), "line missing timestamp: {line}");
        }
    }

    #[test]
    fn subprocess_output_is_indented() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JobLogWriter::new(dir.path(), JOB_ID).unwrap();
        writer.write_subprocess("mkvpropedit", "done\n", "warning: x\n", 0);
        writer.close();
        let content = std::fs::read_to_string(writer.path()).unwrap();
        assert!(content.contains("Command: mkvpropedit"));
        assert!(content.contains("Exit code: 0"));
        assert!(content.contains("  done"));
        assert!(content.contains("  warning: x"));
    }

    #[test]
    fn tail_reads_slices_with_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JobLogWriter::new(dir.path(), JOB_ID).unwrap();
        for i in 0..10 {
            writer.write_line(&format!("line {i}"));
        }
        writer.close();

        let (lines, total, has_more) = read_log_tail(dir.path(), JOB_ID, 4, 0);
        assert_eq!(lines.len(), 4);
        assert_eq!(total, 10);
        assert!(has_more);
        assert!(lines[0].contains("line 0"));

        let (lines, total, has_more) = read_log_tail(dir.path(), JOB_ID, 20, 8);
        assert_eq!(lines.len(), 2);
        assert_eq!(total, 10);
        assert!(!has_more);
    }

    #[test]
    fn tail_reads_compressed_logs_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join(format!("{JOB_ID}.log.gz"));
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b"alpha\nbeta\ngamma\n").unwrap();
        encoder.finish().unwrap();

        let (lines, total, has_more) = read_log_tail(dir.path(), JOB_ID, 2, 1);
        assert_eq!(lines, vec!["beta", "gamma"]);
        assert_eq!(total, 3);
        assert!(!has_more);
        assert!(log_file_exists(dir.path(), JOB_ID));
    }

    #[test]
    fn invalid_id_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (lines, total, has_more) = read_log_tail(dir.path(), "../../etc/passwd", 10, 0);
        assert!(lines.is_empty());
        assert_eq!(total, 0);
        assert!(!has_more);
        assert!(!log_file_exists(dir.path(), "../../etc/passwd"));
    }

    #[test]
    fn relative_path_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JobLogWriter::new(dir.path(), JOB_ID).unwrap();
        assert_eq!(writer.relative_path(), format!("logs/{JOB_ID}.log"));
    }
}
