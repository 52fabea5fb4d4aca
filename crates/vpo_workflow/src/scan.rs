//! The introspection pipeline.
//!
//! A (re)scan probes the file and replaces its database rows: upsert the
//! file, then swap the track set atomically. A failed probe marks the file
//! row `error` and leaves the previous tracks intact.

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use vpo_db::{files, DbPool};
use vpo_model::{FileRecord, ScanStatus};
use vpo_tools::{probe_file, ProbeResult, ToolRegistry};

use crate::error::WorkflowError;
use crate::stats::compute_partial_hash;

/// Probe `path` and refresh its file and track rows. Returns the stored
/// file record and the probe result.
pub async fn scan_file(
    pool: &DbPool,
    registry: &ToolRegistry,
    path: &Path,
) -> Result<(FileRecord, ProbeResult), WorkflowError> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| WorkflowError::FileNotFound(path.display().to_string()))?;

    let mut record = FileRecord::from_path(path, metadata.len() as i64);
    record.modified_at = metadata
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<Utc>::from(t).to_rfc3339());
    record.scanned_at = Some(Utc::now().to_rfc3339());
    record.content_hash = compute_partial_hash(path).ok();

    let probe = match probe_file(registry, path).await {
        Ok(probe) => probe,
        Err(e) => {
            // Keep the old track set; record the failure on the file row.
            record.scan_status = ScanStatus::Error;
            record.scan_error = Some(e.to_string());
            let file_id = files::upsert_file(pool, &record).await?;
            record.id = file_id;
            warn!("scan of {} failed: {e}", path.display());
            return Err(e.into());
        }
    };

    record.container_format = probe.container.clone();
    record.scan_status = ScanStatus::Ok;
    record.scan_error = None;

    let file_id = files::upsert_file(pool, &record).await?;
    record.id = file_id;

    let mut tracks = probe.tracks.clone();
    for track in &mut tracks {
        track.file_id = file_id;
    }
    files::replace_tracks(pool, file_id, &tracks).await?;

    for warning in &probe.warnings {
        warn!("{}: {warning}", path.display());
    }
    info!(
        "scanned {} ({} tracks, container {:?})",
        path.display(),
        tracks.len(),
        probe.container
    );

    Ok((record, probe))
}
