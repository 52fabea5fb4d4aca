//! Shared tracing setup for VPO binaries.
//!
//! Two layers: a size-rotated file under `<data_dir>/logs/` and stderr.
//! `RUST_LOG` overrides the default filter. Per-job execution logs are a
//! different thing entirely and live in `vpo_jobs::logs`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "vpo=info,vpo_jobs=info,vpo_workflow=info,vpo_db=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for a VPO binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rotating file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let logs_dir = vpo_model::paths::logs_dir();
    fs::create_dir_all(&logs_dir).context("failed to create log directory")?;
    let file_writer = RotatingWriter::shared(logs_dir, config.app_name)
        .context("failed to initialize rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

struct RotatingState {
    dir: PathBuf,
    base_name: String,
    file: File,
    current_size: u64,
}

impl RotatingState {
    fn current_path(dir: &PathBuf, base_name: &str) -> PathBuf {
        dir.join(format!("{base_name}.log"))
    }

    fn open(dir: PathBuf, base_name: String) -> io::Result<Self> {
        let path = Self::current_path(&dir, &base_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            dir,
            base_name,
            file,
            current_size,
        })
    }

    /// Shift `name.log` -> `name.1.log` -> ... -> `name.{N}.log`, dropping
    /// the oldest.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let oldest = self
            .dir
            .join(format!("{}.{}.log", self.base_name, MAX_LOG_FILES - 1));
        let _ = fs::remove_file(oldest);
        for index in (1..MAX_LOG_FILES - 1).rev() {
            let from = self.dir.join(format!("{}.{index}.log", self.base_name));
            let to = self
                .dir
                .join(format!("{}.{}.log", self.base_name, index + 1));
            if from.exists() {
                let _ = fs::rename(from, to);
            }
        }
        let current = Self::current_path(&self.dir, &self.base_name);
        let first = self.dir.join(format!("{}.1.log", self.base_name));
        let _ = fs::rename(&current, first);

        self.file = OpenOptions::new().create(true).append(true).open(&current)?;
        self.current_size = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.current_size += written as u64;
        Ok(written)
    }
}

/// Clonable writer handle for `tracing_subscriber`.
#[derive(Clone)]
pub struct RotatingWriter {
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingWriter {
    fn shared(dir: PathBuf, app_name: &str) -> io::Result<Self> {
        let sanitized: String = app_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Ok(Self {
            state: Arc::new(Mutex::new(RotatingState::open(dir, sanitized)?)),
        })
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state.lock() {
            Ok(mut state) => state.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock() {
            Ok(mut state) => state.file.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
