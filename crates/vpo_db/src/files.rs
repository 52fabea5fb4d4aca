//! File and track queries.
//!
//! Re-scans replace a file's tracks wholesale inside one transaction so a
//! failed scan can never leave a half-written track set behind.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use vpo_model::{FileRecord, ScanStatus, TrackInfo};

use crate::error::DbError;
use crate::pool::DbPool;

fn file_from_row(row: &SqliteRow) -> Result<FileRecord, DbError> {
    let scan_status: String = row.try_get("scan_status")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        filename: row.try_get("filename")?,
        directory: row.try_get("directory")?,
        extension: row.try_get("extension")?,
        size_bytes: row.try_get("size_bytes")?,
        container_format: row.try_get("container_format")?,
        content_hash: row.try_get("content_hash")?,
        modified_at: row.try_get("modified_at")?,
        scanned_at: row.try_get("scanned_at")?,
        scan_status: scan_status.parse::<ScanStatus>()?,
        scan_error: row.try_get("scan_error")?,
    })
}

fn track_from_row(row: &SqliteRow) -> Result<TrackInfo, DbError> {
    let track_type: String = row.try_get("track_type")?;
    Ok(TrackInfo {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        track_index: row.try_get("track_index")?,
        track_type: track_type.parse()?,
        codec: row.try_get("codec")?,
        language: row.try_get("language")?,
        title: row.try_get("title")?,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        is_forced: row.try_get::<i64, _>("is_forced")? != 0,
        channels: row.try_get("channels")?,
        channel_layout: row.try_get("channel_layout")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        frame_rate: row.try_get("frame_rate")?,
        color_transfer: row.try_get("color_transfer")?,
        color_primaries: row.try_get("color_primaries")?,
        color_space: row.try_get("color_space")?,
        color_range: row.try_get("color_range")?,
        duration_seconds: row.try_get("duration_seconds")?,
    })
}

/// Insert or update a file row keyed by path. Returns the file id.
pub async fn upsert_file(pool: &DbPool, file: &FileRecord) -> Result<i64, DbError> {
    let mut guard = pool.writer().await?;
    sqlx::query(
        "INSERT INTO files (path, filename, directory, extension, size_bytes, \
         container_format, content_hash, modified_at, scanned_at, scan_status, scan_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(path) DO UPDATE SET \
             filename = excluded.filename, \
             directory = excluded.directory, \
             extension = excluded.extension, \
             size_bytes = excluded.size_bytes, \
             container_format = excluded.container_format, \
             content_hash = excluded.content_hash, \
             modified_at = excluded.modified_at, \
             scanned_at = excluded.scanned_at, \
             scan_status = excluded.scan_status, \
             scan_error = excluded.scan_error",
    )
    .bind(&file.path)
    .bind(&file.filename)
    .bind(&file.directory)
    .bind(&file.extension)
    .bind(file.size_bytes)
    .bind(&file.container_format)
    .bind(&file.content_hash)
    .bind(&file.modified_at)
    .bind(&file.scanned_at)
    .bind(file.scan_status.as_str())
    .bind(&file.scan_error)
    .execute(guard.conn())
    .await?;

    let row: (i64,) = sqlx::query_as("SELECT id FROM files WHERE path = ?")
        .bind(&file.path)
        .fetch_one(guard.conn())
        .await?;
    Ok(row.0)
}

pub async fn get_file_by_path(pool: &DbPool, path: &str) -> Result<Option<FileRecord>, DbError> {
    let mut conn = pool.read_connection().await?;
    let row = sqlx::query("SELECT * FROM files WHERE path = ?")
        .bind(path)
        .fetch_optional(&mut conn)
        .await?;
    row.as_ref().map(file_from_row).transpose()
}

pub async fn get_file_by_id(pool: &DbPool, id: i64) -> Result<Option<FileRecord>, DbError> {
    let mut conn = pool.read_connection().await?;
    let row = sqlx::query("SELECT * FROM files WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut conn)
        .await?;
    row.as_ref().map(file_from_row).transpose()
}

/// Tracks of a file, ordered by container index.
pub async fn get_tracks_for_file(pool: &DbPool, file_id: i64) -> Result<Vec<TrackInfo>, DbError> {
    let mut conn = pool.read_connection().await?;
    let rows = sqlx::query("SELECT * FROM tracks WHERE file_id = ? ORDER BY track_index")
        .bind(file_id)
        .fetch_all(&mut conn)
        .await?;
    rows.iter().map(track_from_row).collect()
}

/// Replace a file's tracks atomically: delete the old set, insert the new
/// one in order, commit. On any failure the previous set remains intact.
pub async fn replace_tracks(
    pool: &DbPool,
    file_id: i64,
    tracks: &[TrackInfo],
) -> Result<(), DbError> {
    let mut tx = pool.transaction().await?;

    sqlx::query("DELETE FROM tracks WHERE file_id = ?")
        .bind(file_id)
        .execute(tx.conn())
        .await?;

    for track in tracks {
        sqlx::query(
            "INSERT INTO tracks (file_id, track_index, track_type, codec, language, title, \
             is_default, is_forced, channels, channel_layout, width, height, frame_rate, \
             color_transfer, color_primaries, color_space, color_range, duration_seconds) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file_id)
        .bind(track.track_index)
        .bind(track.track_type.as_str())
        .bind(&track.codec)
        .bind(&track.language)
        .bind(&track.title)
        .bind(track.is_default as i64)
        .bind(track.is_forced as i64)
        .bind(track.channels)
        .bind(&track.channel_layout)
        .bind(track.width)
        .bind(track.height)
        .bind(&track.frame_rate)
        .bind(&track.color_transfer)
        .bind(&track.color_primaries)
        .bind(&track.color_space)
        .bind(&track.color_range)
        .bind(track.duration_seconds)
        .execute(tx.conn())
        .await?;
    }

    tx.commit().await
}

/// Record a failed scan without touching the existing track set.
pub async fn mark_scan_error(pool: &DbPool, path: &str, message: &str) -> Result<(), DbError> {
    let mut guard = pool.writer().await?;
    sqlx::query("UPDATE files SET scan_status = 'error', scan_error = ? WHERE path = ?")
        .bind(message)
        .bind(path)
        .execute(guard.conn())
        .await?;
    Ok(())
}

/// Delete a file row; tracks and analyses go with it by cascade.
pub async fn delete_file(pool: &DbPool, path: &str) -> Result<bool, DbError> {
    let mut guard = pool.writer().await?;
    let result = sqlx::query("DELETE FROM files WHERE path = ?")
        .bind(path)
        .execute(guard.conn())
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use std::path::PathBuf;
    use std::time::Duration;
    use vpo_model::TrackType;

    async fn open_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(&dir.path().join("test.db"), Duration::from_secs(10))
            .await
            .unwrap();
        schema::initialize(&pool).await.unwrap();
        (dir, pool)
    }

    fn sample_file() -> FileRecord {
        let mut record = FileRecord::from_path(&PathBuf::from("/media/show/e01.mkv"), 1000);
        record.container_format = Some("matroska".to_string());
        record
    }

    fn audio_track(index: i64, lang: &str) -> TrackInfo {
        let mut track = TrackInfo::new(0, index, TrackType::Audio);
        track.codec = Some("aac".to_string());
        track.language = Some(lang.to_string());
        track.channels = Some(2);
        track
    }

    #[tokio::test]
    async fn upsert_is_stable_on_path() {
        let (_dir, pool) = open_pool().await;
        let mut file = sample_file();
        let id1 = upsert_file(&pool, &file).await.unwrap();
        file.size_bytes = 2000;
        let id2 = upsert_file(&pool, &file).await.unwrap();
        assert_eq!(id1, id2);

        let stored = get_file_by_path(&pool, &file.path).await.unwrap().unwrap();
        assert_eq!(stored.size_bytes, 2000);
        pool.close().await;
    }

    #[tokio::test]
    async fn replace_tracks_swaps_the_whole_set() {
        let (_dir, pool) = open_pool().await;
        let file_id = upsert_file(&pool, &sample_file()).await.unwrap();

        replace_tracks(
            &pool,
            file_id,
            &[audio_track(0, "eng"), audio_track(1, "deu")],
        )
        .await
        .unwrap();
        replace_tracks(&pool, file_id, &[audio_track(0, "jpn")])
            .await
            .unwrap();

        let tracks = get_tracks_for_file(&pool, file_id).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].language.as_deref(), Some("jpn"));
        pool.close().await;
    }

    #[tokio::test]
    async fn scan_error_preserves_tracks() {
        let (_dir, pool) = open_pool().await;
        let file = sample_file();
        let file_id = upsert_file(&pool, &file).await.unwrap();
        replace_tracks(&pool, file_id, &[audio_track(0, "eng")])
            .await
            .unwrap();

        mark_scan_error(&pool, &file.path, "probe failed").await.unwrap();

        let stored = get_file_by_path(&pool, &file.path).await.unwrap().unwrap();
        assert_eq!(stored.scan_status, ScanStatus::Error);
        assert_eq!(stored.scan_error.as_deref(), Some("probe failed"));
        assert_eq!(get_tracks_for_file(&pool, file_id).await.unwrap().len(), 1);
        pool.close().await;
    }
}
