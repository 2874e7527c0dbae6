//! Learning tables: sample log, model versions, retraining log

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::path::PathBuf;

use super::{fmt_ts, parse_ts, Database};
use crate::error::Result;
use crate::learning::{LearningSample, ModelVersion, RetrainLogEntry, SampleKind};

const VERSION_COLUMNS: &str = "version_id, model_type, accuracy, created_date, file_path, is_active";

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<ModelVersion> {
    let created: String = row.get(3)?;
    let path: String = row.get(4)?;
    Ok(ModelVersion {
        version_id: row.get(0)?,
        model_kind: row.get(1)?,
        accuracy: row.get(2)?,
        created_at: parse_ts(&created, 3)?,
        artifact_path: PathBuf::from(path),
        is_active: row.get::<_, i64>(5)? != 0,
    })
}

impl Database {
    /// Append a sample to the unbounded log
    pub async fn insert_sample(&self, sample: &LearningSample) -> Result<i64> {
        let conn = self.conn.lock().await;
        let features = serde_json::to_string(&sample.features)?;

        conn.execute(
            r#"INSERT INTO learning_data
               (user_id, features, target_value, prediction, confidence, timestamp, data_type)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                sample.user_id,
                features,
                sample.target,
                sample.prediction,
                sample.confidence,
                fmt_ts(&sample.timestamp),
                sample.kind.to_string(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Most recent `limit` samples, returned oldest first
    pub async fn recent_samples(&self, limit: usize) -> Result<Vec<LearningSample>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT user_id, features, target_value, prediction, confidence, timestamp, data_type
               FROM learning_data
               ORDER BY timestamp DESC, id DESC
               LIMIT ?1"#,
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut samples = Vec::with_capacity(rows.len());
        for (user_id, features, target, prediction, confidence, timestamp, kind) in rows.into_iter().rev() {
            samples.push(LearningSample {
                user_id,
                features: serde_json::from_str(&features)?,
                target,
                prediction,
                confidence,
                timestamp: parse_ts(&timestamp, 5)?,
                kind: kind.parse().unwrap_or(SampleKind::MoodEntry),
            });
        }

        Ok(samples)
    }

    /// Most recent (target, prediction) pairs where a prediction was logged
    pub async fn recent_prediction_pairs(&self, limit: usize) -> Result<Vec<(f64, f64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT target_value, prediction FROM learning_data
               WHERE prediction IS NOT NULL
               ORDER BY timestamp DESC, id DESC
               LIMIT ?1"#,
        )?;
        let pairs = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    pub async fn sample_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM learning_data", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Row id of the newest sample, 0 when the log is empty
    pub async fn latest_sample_id(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let id: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM learning_data", [], |row| row.get(0))?;
        Ok(id)
    }

    /// Samples logged after the given row id
    pub async fn sample_count_after(&self, id: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM learning_data WHERE id > ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Sample checkpoint persisted by the last retrain launch for `model_kind`
    pub async fn sample_checkpoint(&self, model_kind: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let checkpoint = conn
            .query_row(
                "SELECT sample_checkpoint FROM scheduler_state WHERE model_type = ?1",
                params![model_kind],
                |row| row.get(0),
            )
            .optional()?;
        Ok(checkpoint)
    }

    pub async fn save_sample_checkpoint(&self, model_kind: &str, checkpoint: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO scheduler_state (model_type, sample_checkpoint) VALUES (?1, ?2)
               ON CONFLICT(model_type) DO UPDATE SET sample_checkpoint = excluded.sample_checkpoint"#,
            params![model_kind, checkpoint],
        )?;
        Ok(())
    }

    pub async fn sample_count_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM learning_data WHERE timestamp >= ?1",
            params![fmt_ts(&since)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Insert `version` as the active version of its kind.
    ///
    /// Deactivation of the previous version and the insert commit together,
    /// so readers never observe zero or two active rows.
    pub async fn promote_version(&self, version: &ModelVersion) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE model_versions SET is_active = 0 WHERE model_type = ?1 AND is_active = 1",
            params![version.model_kind],
        )?;
        tx.execute(
            r#"INSERT INTO model_versions
               (version_id, model_type, accuracy, created_date, file_path, is_active)
               VALUES (?1, ?2, ?3, ?4, ?5, 1)"#,
            params![
                version.version_id,
                version.model_kind,
                version.accuracy,
                fmt_ts(&version.created_at),
                version.artifact_path.to_string_lossy().to_string(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub async fn active_version(&self, model_kind: &str) -> Result<Option<ModelVersion>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM model_versions WHERE model_type = ?1 AND is_active = 1",
            VERSION_COLUMNS
        );
        let version = conn
            .query_row(&sql, params![model_kind], row_to_version)
            .optional()?;
        Ok(version)
    }

    pub async fn get_version(&self, version_id: &str) -> Result<Option<ModelVersion>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM model_versions WHERE version_id = ?1", VERSION_COLUMNS);
        let version = conn
            .query_row(&sql, params![version_id], row_to_version)
            .optional()?;
        Ok(version)
    }

    /// Newest versions first
    pub async fn recent_versions(&self, limit: usize) -> Result<Vec<ModelVersion>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM model_versions ORDER BY created_date DESC LIMIT ?1",
            VERSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params![limit as i64], row_to_version)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    pub async fn insert_retrain_log(&self, entry: &RetrainLogEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO retraining_log
               (version_id, accuracy_improvement, samples_used, retrain_date, success, error_message)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                entry.version_id,
                entry.accuracy_improvement,
                entry.samples_used as i64,
                fmt_ts(&entry.timestamp),
                entry.success,
                entry.error,
            ],
        )?;
        Ok(())
    }

    /// Newest entries first
    pub async fn recent_retrain_log(&self, limit: usize) -> Result<Vec<RetrainLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT version_id, accuracy_improvement, samples_used, retrain_date, success, error_message
               FROM retraining_log
               ORDER BY retrain_date DESC, id DESC
               LIMIT ?1"#,
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                let ts: String = row.get(3)?;
                Ok(RetrainLogEntry {
                    version_id: row.get(0)?,
                    accuracy_improvement: row.get(1)?,
                    samples_used: row.get::<_, i64>(2)? as usize,
                    timestamp: parse_ts(&ts, 3)?,
                    success: row.get(4)?,
                    error: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn sample(target: f64, prediction: Option<f64>, at: DateTime<Utc>) -> LearningSample {
        let mut features = BTreeMap::new();
        features.insert("hour".to_string(), serde_json::json!(9));
        LearningSample {
            user_id: "u1".to_string(),
            features,
            target,
            prediction,
            confidence: prediction.map(|_| 0.7),
            timestamp: at,
            kind: SampleKind::MoodEntry,
        }
    }

    fn version(id: &str, at: DateTime<Utc>) -> ModelVersion {
        ModelVersion {
            version_id: id.to_string(),
            model_kind: "mood_predictor".to_string(),
            accuracy: 0.8,
            created_at: at,
            artifact_path: PathBuf::from(format!("/tmp/{}.json", id)),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_recent_samples_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let base = Utc::now();
        for i in 0..5 {
            db.insert_sample(&sample(i as f64, None, base + Duration::seconds(i))).await.unwrap();
        }

        let recent = db.recent_samples(3).await.unwrap();
        let targets: Vec<f64> = recent.iter().map(|s| s.target).collect();
        assert_eq!(targets, vec![2.0, 3.0, 4.0]);
        assert_eq!(db.sample_count().await.unwrap(), 5);
        assert_eq!(db.sample_count_since(base + Duration::seconds(3)).await.unwrap(), 2);
        assert_eq!(db.latest_sample_id().await.unwrap(), 5);
        assert_eq!(db.sample_count_after(3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_prediction_pairs_skip_unpredicted() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert_sample(&sample(7.0, Some(6.0), now)).await.unwrap();
        db.insert_sample(&sample(5.0, None, now)).await.unwrap();

        let pairs = db.recent_prediction_pairs(100).await.unwrap();
        assert_eq!(pairs, vec![(7.0, 6.0)]);
    }

    #[tokio::test]
    async fn test_promotion_keeps_single_active_version() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.promote_version(&version("v1", now)).await.unwrap();
        db.promote_version(&version("v2", now + Duration::seconds(1))).await.unwrap();

        let active = db.active_version("mood_predictor").await.unwrap().unwrap();
        assert_eq!(active.version_id, "v2");
        assert!(!db.get_version("v1").await.unwrap().unwrap().is_active);

        let versions = db.recent_versions(5).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version_id, "v2");
    }

    #[tokio::test]
    async fn test_sample_checkpoint_upserts() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.sample_checkpoint("mood_predictor").await.unwrap(), None);

        db.save_sample_checkpoint("mood_predictor", 50).await.unwrap();
        db.save_sample_checkpoint("mood_predictor", 120).await.unwrap();
        assert_eq!(db.sample_checkpoint("mood_predictor").await.unwrap(), Some(120));
        assert_eq!(db.sample_checkpoint("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_version_date_is_reported() {
        let db = Database::open_in_memory().unwrap();
        db.promote_version(&version("v1", Utc::now())).await.unwrap();
        {
            let conn = db.conn.lock().await;
            conn.execute("UPDATE model_versions SET created_date = 'not a date'", []).unwrap();
        }

        let err = db.active_version("mood_predictor").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::LabError::Persistence(rusqlite::Error::FromSqlConversionFailure(3, _, _))
        ));
    }

    #[tokio::test]
    async fn test_retrain_log_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        db.insert_retrain_log(&RetrainLogEntry {
            version_id: None,
            accuracy_improvement: 0.01,
            samples_used: 100,
            timestamp: Utc::now(),
            success: true,
            error: None,
        })
        .await
        .unwrap();

        let log = db.recent_retrain_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].success);
        assert_eq!(log[0].samples_used, 100);
    }
}
