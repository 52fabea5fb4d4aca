//! Schema creation and versioning.

use tracing::info;

use crate::error::DbError;
use crate::pool::DbPool;

/// Current schema version, recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Statements that build the schema from scratch. Order matters: parents
/// before children so the foreign keys resolve.
const CREATE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL,
        applied_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        filename TEXT NOT NULL,
        directory TEXT NOT NULL,
        extension TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        container_format TEXT,
        content_hash TEXT,
        modified_at TEXT,
        scanned_at TEXT,
        scan_status TEXT NOT NULL DEFAULT 'ok',
        scan_error TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tracks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        track_index INTEGER NOT NULL,
        track_type TEXT NOT NULL,
        codec TEXT,
        language TEXT,
        title TEXT,
        is_default INTEGER NOT NULL DEFAULT 0,
        is_forced INTEGER NOT NULL DEFAULT 0,
        channels INTEGER,
        channel_layout TEXT,
        width INTEGER,
        height INTEGER,
        frame_rate TEXT,
        color_transfer TEXT,
        color_primaries TEXT,
        color_space TEXT,
        color_range TEXT,
        duration_seconds REAL,
        UNIQUE(file_id, track_index)
    )",
    "CREATE TABLE IF NOT EXISTS language_analysis (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        track_id INTEGER NOT NULL UNIQUE REFERENCES tracks(id) ON DELETE CASCADE,
        file_hash TEXT NOT NULL,
        primary_language TEXT NOT NULL,
        primary_percentage REAL NOT NULL,
        classification TEXT NOT NULL,
        secondary_languages TEXT NOT NULL DEFAULT '[]',
        plugin_name TEXT NOT NULL,
        plugin_version TEXT,
        model TEXT,
        sample_positions TEXT,
        speech_ratio REAL
    )",
    "CREATE TABLE IF NOT EXISTS language_segments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        analysis_id INTEGER NOT NULL REFERENCES language_analysis(id) ON DELETE CASCADE,
        language TEXT NOT NULL,
        start_time REAL NOT NULL,
        end_time REAL NOT NULL,
        confidence REAL NOT NULL
    )",
    // file_id is intentionally not a foreign key: jobs must survive file
    // deletion (file_path is denormalised for the same reason).
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        file_id INTEGER,
        file_path TEXT NOT NULL,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        priority INTEGER NOT NULL DEFAULT 100,
        policy_name TEXT,
        policy_json TEXT,
        progress_percent REAL NOT NULL DEFAULT 0,
        progress_json TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        worker_pid INTEGER,
        worker_heartbeat TEXT,
        error_message TEXT,
        output_path TEXT,
        summary_json TEXT,
        log_path TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority, created_at)",
    // job_id is not a foreign key either: purging old jobs must leave the
    // stats behind for reporting.
    "CREATE TABLE IF NOT EXISTS processing_stats (
        id TEXT PRIMARY KEY,
        job_id TEXT,
        file_id INTEGER NOT NULL,
        processed_at TEXT NOT NULL,
        policy_name TEXT,
        size_before INTEGER NOT NULL,
        size_after INTEGER NOT NULL,
        size_change INTEGER NOT NULL,
        audio_tracks_before INTEGER NOT NULL,
        subtitle_tracks_before INTEGER NOT NULL,
        attachments_before INTEGER NOT NULL,
        audio_tracks_after INTEGER NOT NULL,
        subtitle_tracks_after INTEGER NOT NULL,
        attachments_after INTEGER NOT NULL,
        audio_tracks_removed INTEGER NOT NULL,
        subtitle_tracks_removed INTEGER NOT NULL,
        attachments_removed INTEGER NOT NULL,
        duration_seconds REAL NOT NULL,
        phases_completed INTEGER NOT NULL,
        phases_total INTEGER NOT NULL,
        total_changes INTEGER NOT NULL,
        video_source_codec TEXT,
        video_target_codec TEXT,
        audio_tracks_transcoded INTEGER NOT NULL DEFAULT 0,
        audio_tracks_preserved INTEGER NOT NULL DEFAULT 0,
        hash_before TEXT,
        hash_after TEXT,
        success INTEGER NOT NULL,
        error_message TEXT,
        encoder_type TEXT
    )",
    "CREATE TABLE IF NOT EXISTS action_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stats_id TEXT NOT NULL REFERENCES processing_stats(id) ON DELETE CASCADE,
        action_type TEXT NOT NULL,
        track_type TEXT,
        track_index INTEGER,
        before_state TEXT,
        after_state TEXT,
        success INTEGER NOT NULL,
        duration_ms INTEGER,
        rule_reference TEXT,
        message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS performance_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stats_id TEXT NOT NULL REFERENCES processing_stats(id) ON DELETE CASCADE,
        phase_name TEXT NOT NULL,
        wall_time_seconds REAL NOT NULL,
        bytes_read INTEGER,
        bytes_written INTEGER,
        encoding_fps REAL,
        encoding_bitrate TEXT
    )",
];

/// Create all tables if absent and record the schema version.
///
/// A database with a newer recorded version than this build understands is
/// fatal: refusing to run beats corrupting it.
pub async fn initialize(pool: &DbPool) -> Result<(), DbError> {
    let mut tx = pool.transaction().await?;

    for statement in CREATE_STATEMENTS {
        sqlx::query(statement).execute(tx.conn()).await?;
    }

    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(tx.conn())
            .await?;

    match existing {
        Some((version,)) if version > SCHEMA_VERSION => {
            tx.rollback().await?;
            return Err(DbError::Schema(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        Some((version,)) if version == SCHEMA_VERSION => {}
        _ => {
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(SCHEMA_VERSION)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(tx.conn())
                .await?;
            info!("initialized database schema version {SCHEMA_VERSION}");
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(&dir.path().join("test.db"), Duration::from_secs(10))
            .await
            .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (_dir, pool) = open_pool().await;
        initialize(&pool).await.unwrap();
        initialize(&pool).await.unwrap();

        let mut conn = pool.read_connection().await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let (_dir, pool) = open_pool().await;
        initialize(&pool).await.unwrap();
        pool.execute_write(
            "INSERT INTO schema_version (version, applied_at) VALUES (999, '2026-01-01')",
        )
        .await
        .unwrap();

        let err = initialize(&pool).await.unwrap_err();
        assert!(matches!(err, DbError::Schema(_)));
        pool.close().await;
    }

    #[tokio::test]
    async fn deleting_a_file_cascades_to_tracks() {
        let (_dir, pool) = open_pool().await;
        initialize(&pool).await.unwrap();

        pool.execute_write(
            "INSERT INTO files (path, filename, directory, size_bytes) \
             VALUES ('/a/b.mkv', 'b.mkv', '/a', 10)",
        )
        .await
        .unwrap();
        pool.execute_write(
            "INSERT INTO tracks (file_id, track_index, track_type) VALUES (1, 0, 'video')",
        )
        .await
        .unwrap();
        pool.execute_write("DELETE FROM files WHERE id = 1")
            .await
            .unwrap();

        let mut conn = pool.read_connection().await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tracks")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        pool.close().await;
    }
}
