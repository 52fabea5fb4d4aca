//! Persistence of processing statistics.
//!
//! The stats record and its owned action results and performance metrics
//! land in one transaction: either all three tables gain their rows or none
//! does.

use vpo_model::{ActionResultRecord, PerformanceMetricsRecord, ProcessingStatsRecord};

use crate::error::DbError;
use crate::pool::DbPool;

/// Insert a stats record with its actions and metrics atomically.
pub async fn persist_stats(
    pool: &DbPool,
    stats: &ProcessingStatsRecord,
    actions: &[ActionResultRecord],
    metrics: &[PerformanceMetricsRecord],
) -> Result<(), DbError> {
    let mut tx = pool.transaction().await?;

    let insert = sqlx::query(
        "INSERT INTO processing_stats (id, job_id, file_id, processed_at, policy_name, \
         size_before, size_after, size_change, \
         audio_tracks_before, subtitle_tracks_before, attachments_before, \
         audio_tracks_after, subtitle_tracks_after, attachments_after, \
         audio_tracks_removed, subtitle_tracks_removed, attachments_removed, \
         duration_seconds, phases_completed, phases_total, total_changes, \
         video_source_codec, video_target_codec, \
         audio_tracks_transcoded, audio_tracks_preserved, \
         hash_before, hash_after, success, error_message, encoder_type) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&stats.id)
    .bind(&stats.job_id)
    .bind(stats.file_id)
    .bind(&stats.processed_at)
    .bind(&stats.policy_name)
    .bind(stats.size_before)
    .bind(stats.size_after)
    .bind(stats.size_change)
    .bind(stats.audio_tracks_before)
    .bind(stats.subtitle_tracks_before)
    .bind(stats.attachments_before)
    .bind(stats.audio_tracks_after)
    .bind(stats.subtitle_tracks_after)
    .bind(stats.attachments_after)
    .bind(stats.audio_tracks_removed)
    .bind(stats.subtitle_tracks_removed)
    .bind(stats.attachments_removed)
    .bind(stats.duration_seconds)
    .bind(stats.phases_completed)
    .bind(stats.phases_total)
    .bind(stats.total_changes)
    .bind(&stats.video_source_codec)
    .bind(&stats.video_target_codec)
    .bind(stats.audio_tracks_transcoded)
    .bind(stats.audio_tracks_preserved)
    .bind(&stats.hash_before)
    .bind(&stats.hash_after)
    .bind(stats.success as i64)
    .bind(&stats.error_message)
    .bind(stats.encoder_type.map(|e| e.as_str()))
    .execute(tx.conn())
    .await;

    if let Err(e) = insert {
        tx.rollback().await?;
        return Err(e.into());
    }

    for action in actions {
        let result = sqlx::query(
            "INSERT INTO action_results (stats_id, action_type, track_type, track_index, \
             before_state, after_state, success, duration_ms, rule_reference, message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&action.stats_id)
        .bind(&action.action_type)
        .bind(&action.track_type)
        .bind(action.track_index)
        .bind(&action.before_state)
        .bind(&action.after_state)
        .bind(action.success as i64)
        .bind(action.duration_ms)
        .bind(&action.rule_reference)
        .bind(&action.message)
        .execute(tx.conn())
        .await;

        if let Err(e) = result {
            tx.rollback().await?;
            return Err(e.into());
        }
    }

    for metric in metrics {
        let result = sqlx::query(
            "INSERT INTO performance_metrics (stats_id, phase_name, wall_time_seconds, \
             bytes_read, bytes_written, encoding_fps, encoding_bitrate) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metric.stats_id)
        .bind(&metric.phase_name)
        .bind(metric.wall_time_seconds)
        .bind(metric.bytes_read)
        .bind(metric.bytes_written)
        .bind(metric.encoding_fps)
        .bind(&metric.encoding_bitrate)
        .execute(tx.conn())
        .await;

        if let Err(e) = result {
            tx.rollback().await?;
            return Err(e.into());
        }
    }

    tx.commit().await
}

/// Count of stats rows referencing a job, used by reporting and tests.
pub async fn stats_count_for_job(pool: &DbPool, job_id: &str) -> Result<i64, DbError> {
    let mut conn = pool.read_connection().await?;
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processing_stats WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(&mut conn)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use std::time::Duration;

    async fn open_pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(&dir.path().join("test.db"), Duration::from_secs(10))
            .await
            .unwrap();
        schema::initialize(&pool).await.unwrap();
        (dir, pool)
    }

    fn sample_stats(id: &str) -> ProcessingStatsRecord {
        ProcessingStatsRecord {
            id: id.to_string(),
            job_id: Some("11111111-2222-3333-4444-555555555555".to_string()),
            file_id: 1,
            processed_at: "2026-01-01T00:00:00Z".to_string(),
            policy_name: Some("default".to_string()),
            size_before: 1000,
            size_after: 900,
            size_change: 100,
            audio_tracks_before: 3,
            subtitle_tracks_before: 2,
            attachments_before: 0,
            audio_tracks_after: 2,
            subtitle_tracks_after: 2,
            attachments_after: 0,
            audio_tracks_removed: 1,
            subtitle_tracks_removed: 0,
            attachments_removed: 0,
            duration_seconds: 12.5,
            phases_completed: 2,
            phases_total: 2,
            total_changes: 3,
            video_source_codec: Some("h264".to_string()),
            video_target_codec: None,
            audio_tracks_transcoded: 0,
            audio_tracks_preserved: 2,
            hash_before: Some("aa".repeat(32)),
            hash_after: Some("bb".repeat(32)),
            success: true,
            error_message: None,
            encoder_type: None,
        }
    }

    #[tokio::test]
    async fn persists_all_three_tables() {
        let (_dir, pool) = open_pool().await;
        let stats = sample_stats("stats-1");
        let actions = vec![ActionResultRecord {
            id: None,
            stats_id: stats.id.clone(),
            action_type: "default_flags".to_string(),
            track_type: Some("audio".to_string()),
            track_index: Some(1),
            before_state: Some("{\"default\":false}".to_string()),
            after_state: Some("{\"default\":true}".to_string()),
            success: true,
            duration_ms: Some(4),
            rule_reference: None,
            message: None,
        }];
        let metrics = vec![PerformanceMetricsRecord {
            id: None,
            stats_id: stats.id.clone(),
            phase_name: "cleanup".to_string(),
            wall_time_seconds: 1.25,
            bytes_read: Some(1000),
            bytes_written: Some(900),
            encoding_fps: None,
            encoding_bitrate: None,
        }];

        persist_stats(&pool, &stats, &actions, &metrics).await.unwrap();

        let mut conn = pool.read_connection().await.unwrap();
        for (table, expected) in [
            ("processing_stats", 1i64),
            ("action_results", 1),
            ("performance_metrics", 1),
        ] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&mut conn)
                .await
                .unwrap();
            assert_eq!(count.0, expected, "{table}");
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_stats_id_rolls_back_everything() {
        let (_dir, pool) = open_pool().await;
        let stats = sample_stats("stats-dup");
        persist_stats(&pool, &stats, &[], &[]).await.unwrap();

        // Second insert with the same id fails on the primary key; the
        // attached metric must not survive.
        let metrics = vec![PerformanceMetricsRecord {
            id: None,
            stats_id: stats.id.clone(),
            phase_name: "again".to_string(),
            wall_time_seconds: 0.5,
            bytes_read: None,
            bytes_written: None,
            encoding_fps: None,
            encoding_bitrate: None,
        }];
        assert!(persist_stats(&pool, &stats, &[], &metrics).await.is_err());

        let mut conn = pool.read_connection().await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM performance_metrics")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        pool.close().await;
    }
}
