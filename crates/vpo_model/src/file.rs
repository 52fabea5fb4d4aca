//! File records as maintained by the scan pipeline.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::StatusParseError;

/// Outcome of the most recent scan of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Ok,
    Error,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            other => Err(StatusParseError::new("scan status", other)),
        }
    }
}

/// A library file and its container-level metadata.
///
/// The path is absolute and unique; `filename`, `directory` and `extension`
/// are denormalised from it so queries can filter without path parsing.
/// Tracks belong to the file by cascade and are replaced wholesale on
/// re-scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub extension: Option<String>,
    pub size_bytes: i64,
    pub container_format: Option<String>,
    /// SHA-256 of the first 16 KiB, hex-encoded. Cheap change fingerprint.
    pub content_hash: Option<String>,
    pub modified_at: Option<String>,
    pub scanned_at: Option<String>,
    pub scan_status: ScanStatus,
    pub scan_error: Option<String>,
}

impl FileRecord {
    /// Build an unsaved record from a filesystem path, splitting out the
    /// denormalised name components.
    pub fn from_path(path: &Path, size_bytes: i64) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());

        Self {
            id: 0,
            path: path.to_string_lossy().into_owned(),
            filename,
            directory,
            extension,
            size_bytes,
            container_format: None,
            content_hash: None,
            modified_at: None,
            scanned_at: None,
            scan_status: ScanStatus::Ok,
            scan_error: None,
        }
    }
}
