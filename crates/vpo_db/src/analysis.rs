//! Language analysis persistence.
//!
//! One analysis row per track, owned by the track via cascade. The cache
//! key is the file's partial hash at analysis time; staleness is the
//! caller's check ([`vpo_model::LanguageAnalysisResult::is_valid_for`]).

use std::collections::HashMap;

use sqlx::Row;

use vpo_model::{
    AnalysisMetadata, LanguageAnalysisResult, LanguageClassification, LanguageSegment,
    SecondaryLanguage,
};

use crate::error::DbError;
use crate::pool::DbPool;

fn classification_from_str(raw: &str) -> Result<LanguageClassification, DbError> {
    match raw {
        "SINGLE_LANGUAGE" => Ok(LanguageClassification::SingleLanguage),
        "MULTI_LANGUAGE" => Ok(LanguageClassification::MultiLanguage),
        other => Err(DbError::Schema(format!(
            "unknown language classification '{other}'"
        ))),
    }
}

fn classification_to_str(classification: LanguageClassification) -> &'static str {
    match classification {
        LanguageClassification::SingleLanguage => "SINGLE_LANGUAGE",
        LanguageClassification::MultiLanguage => "MULTI_LANGUAGE",
    }
}

/// Insert or replace the analysis for a track, segments included, in one
/// transaction.
pub async fn upsert_analysis(
    pool: &DbPool,
    analysis: &LanguageAnalysisResult,
) -> Result<i64, DbError> {
    let mut tx = pool.transaction().await?;

    sqlx::query("DELETE FROM language_analysis WHERE track_id = ?")
        .bind(analysis.track_id)
        .execute(tx.conn())
        .await?;

    sqlx::query(
        "INSERT INTO language_analysis (track_id, file_hash, primary_language, \
         primary_percentage, classification, secondary_languages, plugin_name, \
         plugin_version, model, sample_positions, speech_ratio) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(analysis.track_id)
    .bind(&analysis.file_hash)
    .bind(&analysis.primary_language)
    .bind(analysis.primary_percentage)
    .bind(classification_to_str(analysis.classification))
    .bind(serde_json::to_string(&analysis.secondary_languages).unwrap_or_else(|_| "[]".to_string()))
    .bind(&analysis.metadata.plugin_name)
    .bind(&analysis.metadata.plugin_version)
    .bind(&analysis.metadata.model)
    .bind(serde_json::to_string(&analysis.metadata.sample_positions).ok())
    .bind(analysis.metadata.speech_ratio)
    .execute(tx.conn())
    .await?;

    let row: (i64,) = sqlx::query_as("SELECT id FROM language_analysis WHERE track_id = ?")
        .bind(analysis.track_id)
        .fetch_one(tx.conn())
        .await?;
    let analysis_id = row.0;

    for segment in &analysis.segments {
        sqlx::query(
            "INSERT INTO language_segments (analysis_id, language, start_time, end_time, \
             confidence) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(analysis_id)
        .bind(&segment.language)
        .bind(segment.start_time)
        .bind(segment.end_time)
        .bind(segment.confidence)
        .execute(tx.conn())
        .await?;
    }

    tx.commit().await?;
    Ok(analysis_id)
}

/// Analyses for all tracks of a file, keyed by track id. Segments are
/// loaded alongside.
pub async fn get_analyses_for_file(
    pool: &DbPool,
    file_id: i64,
) -> Result<HashMap<i64, LanguageAnalysisResult>, DbError> {
    let mut conn = pool.read_connection().await?;
    let rows = sqlx::query(
        "SELECT a.* FROM language_analysis a \
         JOIN tracks t ON t.id = a.track_id WHERE t.file_id = ?",
    )
    .bind(file_id)
    .fetch_all(&mut conn)
    .await?;

    let mut results = HashMap::new();
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let classification: String = row.try_get("classification")?;
        let secondary_raw: String = row.try_get("secondary_languages")?;
        let secondary: Vec<SecondaryLanguage> =
            serde_json::from_str(&secondary_raw).unwrap_or_default();
        let positions_raw: Option<String> = row.try_get("sample_positions")?;
        let sample_positions: Vec<f64> = positions_raw
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        let segment_rows =
            sqlx::query("SELECT * FROM language_segments WHERE analysis_id = ? ORDER BY start_time")
                .bind(id)
                .fetch_all(&mut conn)
                .await?;
        let segments = segment_rows
            .iter()
            .map(|segment| {
                Ok(LanguageSegment {
                    language: segment.try_get("language")?,
                    start_time: segment.try_get("start_time")?,
                    end_time: segment.try_get("end_time")?,
                    confidence: segment.try_get("confidence")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let track_id: i64 = row.try_get("track_id")?;
        results.insert(
            track_id,
            LanguageAnalysisResult {
                id,
                track_id,
                file_hash: row.try_get("file_hash")?,
                primary_language: row.try_get("primary_language")?,
                primary_percentage: row.try_get("primary_percentage")?,
                classification: classification_from_str(&classification)?,
                secondary_languages: secondary,
                segments,
                metadata: AnalysisMetadata {
                    plugin_name: row.try_get("plugin_name")?,
                    plugin_version: row.try_get("plugin_version")?,
                    model: row.try_get("model")?,
                    sample_positions,
                    speech_ratio: row.try_get("speech_ratio")?,
                },
            },
        );
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{files, schema};
    use std::path::PathBuf;
    use std::time::Duration;
    use vpo_model::{FileRecord, TrackInfo, TrackType};

    #[tokio::test]
    async fn analysis_round_trips_with_segments() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(&dir.path().join("t.db"), Duration::from_secs(10))
            .await
            .unwrap();
        schema::initialize(&pool).await.unwrap();

        let file = FileRecord::from_path(&PathBuf::from("/m/a.mkv"), 10);
        let file_id = files::upsert_file(&pool, &file).await.unwrap();
        files::replace_tracks(&pool, file_id, &[TrackInfo::new(0, 0, TrackType::Audio)])
            .await
            .unwrap();
        let track = &files::get_tracks_for_file(&pool, file_id).await.unwrap()[0];

        let analysis = LanguageAnalysisResult {
            id: 0,
            track_id: track.id,
            file_hash: "ab".repeat(32),
            primary_language: "jpn".to_string(),
            primary_percentage: 0.8,
            classification: LanguageClassification::MultiLanguage,
            secondary_languages: vec![SecondaryLanguage {
                language: "eng".to_string(),
                percentage: 0.2,
            }],
            segments: vec![LanguageSegment {
                language: "eng".to_string(),
                start_time: 10.0,
                end_time: 20.0,
                confidence: 0.9,
            }],
            metadata: AnalysisMetadata {
                plugin_name: "whisper".to_string(),
                plugin_version: Some("1.2".to_string()),
                model: Some("base".to_string()),
                sample_positions: vec![10.0, 300.0],
                speech_ratio: Some(0.7),
            },
        };
        upsert_analysis(&pool, &analysis).await.unwrap();

        let loaded = get_analyses_for_file(&pool, file_id).await.unwrap();
        let stored = &loaded[&track.id];
        assert_eq!(stored.primary_language, "jpn");
        assert_eq!(stored.secondary_languages.len(), 1);
        assert_eq!(stored.segments.len(), 1);
        assert_eq!(stored.metadata.sample_positions, vec![10.0, 300.0]);

        // Deleting the file cascades through tracks to the analysis.
        files::delete_file(&pool, &file.path).await.unwrap();
        let mut conn = pool.read_connection().await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM language_segments")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        pool.close().await;
    }
}
