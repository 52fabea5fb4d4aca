//! Background maintenance: log retention and temp file sweeps.
//!
//! Logs compress to `.log.gz` after `log_compression_days` and are deleted
//! after `log_deletion_days`. Orphaned `.vpo_temp_*` working files from
//! interrupted remuxes are swept wherever they are found.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};
use walkdir::WalkDir;

fn older_than(path: &Path, age: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|elapsed| elapsed > age)
        .unwrap_or(false)
}

fn compress_file(path: &Path) -> io::Result<()> {
    let mut input = File::open(path)?;
    let gz_path = {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".gz");
        path.with_file_name(name)
    };
    let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        encoder.write_all(&buffer[..read])?;
    }
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(())
}

/// Gzip `.log` files older than `compression_days`. Returns how many were
/// compressed.
pub fn compress_old_logs(logs_dir: &Path, compression_days: u32) -> u64 {
    let age = Duration::from_secs(compression_days as u64 * 24 * 3600);
    let mut compressed = 0;

    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path.extension().map(|e| e == "log").unwrap_or(false);
        if !is_log || !older_than(&path, age) {
            continue;
        }
        match compress_file(&path) {
            Ok(()) => compressed += 1,
            Err(e) => warn!("cannot compress {}: {e}", path.display()),
        }
    }
    if compressed > 0 {
        info!("compressed {compressed} old log file(s)");
    }
    compressed
}

/// Delete `.log` and `.log.gz` files older than `deletion_days`.
pub fn delete_old_logs(logs_dir: &Path, deletion_days: u32) -> u64 {
    let age = Duration::from_secs(deletion_days as u64 * 24 * 3600);
    let mut deleted = 0;

    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let is_log = name.ends_with(".log") || name.ends_with(".log.gz");
        if !is_log || !older_than(&path, age) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(e) => warn!("cannot delete {}: {e}", path.display()),
        }
    }
    if deleted > 0 {
        info!("deleted {deleted} expired log file(s)");
    }
    deleted
}

/// Remove `.vpo_temp_*` files under `root` that have gone stale (older
/// than an hour, so an in-flight remux is never swept).
pub fn sweep_temp_files(root: &Path) -> u64 {
    let mut swept = 0;
    for entry in WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.starts_with(".vpo_temp_") {
            continue;
        }
        if !older_than(entry.path(), Duration::from_secs(3600)) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("swept orphaned temp file {}", entry.path().display());
                swept += 1;
            }
            Err(e) => warn!("cannot sweep {}: {e}", entry.path().display()),
        }
    }
    swept
}
