//! Data-directory layout.
//!
//! Everything VPO persists lives under one data directory, `~/.vpo` by
//! default, overridable with `VPO_DATA_DIR`:
//!
//! - `library.db`   — the embedded relational store
//! - `logs/`        — per-job execution logs and the process log

use std::path::PathBuf;

pub const DATA_DIR_ENV: &str = "VPO_DATA_DIR";

/// The VPO data directory. Does not create it.
pub fn data_dir() -> PathBuf {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.is_empty() {
            return PathBuf::from(override_path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vpo")
}

/// Path of the embedded database: `<data_dir>/library.db`.
pub fn db_path() -> PathBuf {
    data_dir().join("library.db")
}

/// Directory holding per-job logs: `<data_dir>/logs`.
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create the data and logs directories if missing.
pub fn ensure_data_dirs() -> std::io::Result<PathBuf> {
    let dir = data_dir();
    std::fs::create_dir_all(&dir)?;
    std::fs::create_dir_all(dir.join("logs"))?;
    Ok(dir)
}
