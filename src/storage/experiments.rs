//! Experiment tables: experiments, assignments, events, results

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

use super::{fmt_ts, parse_ts, Database};
use crate::error::Result;
use crate::experiment::{
    Assignment, Experiment, ExperimentEvent, ExperimentResult, ExperimentStatus, Variant,
};

/// Per-variant event aggregate for one metric
#[derive(Debug, Clone)]
pub struct EventAggregate {
    pub variant: String,
    pub count: usize,
    pub avg_value: f64,
}

impl Database {
    /// Insert a new experiment row. Ids are never reused, so a conflict is an error.
    pub async fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        let conn = self.conn.lock().await;
        let variants_json = serde_json::to_string(&experiment.variants)?;

        conn.execute(
            r#"INSERT INTO experiments
               (experiment_id, name, description, variants, start_date, end_date,
                status, success_metric, minimum_sample_size, confidence_level)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                experiment.id,
                experiment.name,
                experiment.description,
                variants_json,
                fmt_ts(&experiment.start_date),
                experiment.end_date.as_ref().map(fmt_ts),
                experiment.status.to_string(),
                experiment.success_metric,
                experiment.min_sample_size,
                experiment.confidence_level,
            ],
        )?;

        Ok(())
    }

    /// Set an experiment's status; returns false when the id is unknown
    pub async fn update_experiment_status(&self, experiment_id: &str, status: ExperimentStatus) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE experiments SET status = ?1 WHERE experiment_id = ?2",
            params![status.to_string(), experiment_id],
        )?;
        Ok(changed > 0)
    }

    /// Load every experiment (historical ones included)
    pub async fn load_experiments(&self) -> Result<Vec<Experiment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT experiment_id, name, description, variants, start_date, end_date,
                      status, success_metric, minimum_sample_size, confidence_level
               FROM experiments
               ORDER BY start_date"#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, u32>(8)?,
                    row.get::<_, f64>(9)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut experiments = Vec::with_capacity(rows.len());
        for (id, name, description, variants, start, end, status, metric, min_sample_size, confidence) in rows {
            let variants: Vec<Variant> = serde_json::from_str(&variants)?;
            experiments.push(Experiment {
                id,
                name,
                description,
                variants,
                start_date: parse_ts(&start, 4)?,
                end_date: end.as_deref().map(|raw| parse_ts(raw, 5)).transpose()?,
                // Unknown status strings are treated as completed (read-only)
                status: status.parse().unwrap_or(ExperimentStatus::Completed),
                success_metric: metric,
                min_sample_size,
                confidence_level: confidence,
            });
        }

        Ok(experiments)
    }

    /// Stored assignment for a user, if any
    pub async fn get_assignment(&self, experiment_id: &str, user_id: &str) -> Result<Option<Assignment>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT variant, assigned_date FROM experiment_assignments WHERE experiment_id = ?1 AND user_id = ?2",
                params![experiment_id, user_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((variant, assigned)) = row else {
            return Ok(None);
        };
        Ok(Some(Assignment {
            experiment_id: experiment_id.to_string(),
            user_id: user_id.to_string(),
            variant,
            assigned_at: parse_ts(&assigned, 1)?,
        }))
    }

    /// Persist an assignment unless one already exists and return the stored variant.
    ///
    /// The first write wins; a concurrent writer computing the same variant is a
    /// harmless no-op, and an existing row is never overwritten.
    pub async fn insert_assignment_if_absent(
        &self,
        experiment_id: &str,
        user_id: &str,
        variant: &str,
        assigned_at: DateTime<Utc>,
    ) -> Result<String> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR IGNORE INTO experiment_assignments
               (experiment_id, user_id, variant, assigned_date)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![experiment_id, user_id, variant, fmt_ts(&assigned_at)],
        )?;

        let stored: String = conn.query_row(
            "SELECT variant FROM experiment_assignments WHERE experiment_id = ?1 AND user_id = ?2",
            params![experiment_id, user_id],
            |row| row.get(0),
        )?;
        Ok(stored)
    }

    /// Number of assigned users per variant
    pub async fn assignment_counts(&self, experiment_id: &str) -> Result<HashMap<String, usize>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT variant, COUNT(*) FROM experiment_assignments WHERE experiment_id = ?1 GROUP BY variant",
        )?;
        let counts = stmt
            .query_map(params![experiment_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    }

    /// Append an event to the ledger
    pub async fn insert_event(&self, event: &ExperimentEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        let context_json = event
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            r#"INSERT INTO experiment_events
               (experiment_id, user_id, variant, event_type, event_value, timestamp, context)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                event.experiment_id,
                event.user_id,
                event.variant,
                event.metric,
                event.value,
                fmt_ts(&event.timestamp),
                context_json,
            ],
        )?;
        Ok(())
    }

    /// (variant, value) pairs for one metric in insertion order
    pub async fn metric_values(&self, experiment_id: &str, metric: &str) -> Result<Vec<(String, f64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT variant, event_value FROM experiment_events
               WHERE experiment_id = ?1 AND event_type = ?2
               ORDER BY id"#,
        )?;
        let values = stmt
            .query_map(params![experiment_id, metric], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }

    /// Count and mean of one metric per variant
    pub async fn event_aggregates(&self, experiment_id: &str, metric: &str) -> Result<Vec<EventAggregate>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT variant, COUNT(*), AVG(event_value) FROM experiment_events
               WHERE experiment_id = ?1 AND event_type = ?2
               GROUP BY variant"#,
        )?;
        let aggregates = stmt
            .query_map(params![experiment_id, metric], |row| {
                Ok(EventAggregate {
                    variant: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                    avg_value: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(aggregates)
    }

    /// Store (overwrite) the latest result for an experiment
    pub async fn save_result(&self, result: &ExperimentResult) -> Result<()> {
        let conn = self.conn.lock().await;
        let json = serde_json::to_string(result)?;
        conn.execute(
            r#"INSERT OR REPLACE INTO experiment_results
               (experiment_id, results, calculated_date)
               VALUES (?1, ?2, ?3)"#,
            params![result.experiment_id, json, fmt_ts(&result.computed_at)],
        )?;
        Ok(())
    }

    pub async fn has_result(&self, experiment_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM experiment_results WHERE experiment_id = ?1",
            params![experiment_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Latest stored result, if one was ever computed
    pub async fn load_result(&self, experiment_id: &str) -> Result<Option<ExperimentResult>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT results FROM experiment_results WHERE experiment_id = ?1",
                params![experiment_id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_experiment(id: &str) -> Experiment {
        Experiment {
            id: id.to_string(),
            name: "Recommendation Strategy Test".to_string(),
            description: "control vs enhanced".to_string(),
            variants: vec![Variant::named("control"), Variant::named("enhanced")],
            start_date: Utc::now(),
            end_date: Some(Utc::now() + chrono::Duration::days(7)),
            status: ExperimentStatus::Active,
            success_metric: "recommendation_helpful".to_string(),
            min_sample_size: 100,
            confidence_level: 0.95,
        }
    }

    #[tokio::test]
    async fn test_experiment_roundtrip_and_status() {
        let db = Database::open_in_memory().unwrap();
        db.insert_experiment(&sample_experiment("exp1")).await.unwrap();

        assert!(db.update_experiment_status("exp1", ExperimentStatus::Paused).await.unwrap());
        assert!(!db.update_experiment_status("missing", ExperimentStatus::Paused).await.unwrap());

        let loaded = db.load_experiments().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, ExperimentStatus::Paused);
        assert_eq!(loaded[0].variant_names(), vec!["control", "enhanced"]);
    }

    #[tokio::test]
    async fn test_duplicate_experiment_id_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_experiment(&sample_experiment("exp1")).await.unwrap();
        assert!(db.insert_experiment(&sample_experiment("exp1")).await.is_err());
    }

    #[tokio::test]
    async fn test_assignment_first_write_wins() {
        let db = Database::open_in_memory().unwrap();
        db.insert_experiment(&sample_experiment("exp1")).await.unwrap();

        let first = db.insert_assignment_if_absent("exp1", "u1", "control", Utc::now()).await.unwrap();
        let second = db.insert_assignment_if_absent("exp1", "u1", "enhanced", Utc::now()).await.unwrap();
        assert_eq!(first, "control");
        assert_eq!(second, "control");

        let counts = db.assignment_counts("exp1").await.unwrap();
        assert_eq!(counts.get("control"), Some(&1));
        assert_eq!(counts.get("enhanced"), None);
    }

    #[tokio::test]
    async fn test_event_aggregates_filter_by_metric() {
        let db = Database::open_in_memory().unwrap();
        db.insert_experiment(&sample_experiment("exp1")).await.unwrap();

        for (variant, metric, value) in [
            ("control", "recommendation_helpful", 1.0),
            ("control", "recommendation_helpful", 0.0),
            ("enhanced", "recommendation_helpful", 1.0),
            ("enhanced", "page_view", 5.0),
        ] {
            db.insert_event(&ExperimentEvent {
                experiment_id: "exp1".to_string(),
                user_id: "u".to_string(),
                variant: variant.to_string(),
                metric: metric.to_string(),
                value,
                timestamp: Utc::now(),
                context: None,
            })
            .await
            .unwrap();
        }

        let values = db.metric_values("exp1", "recommendation_helpful").await.unwrap();
        assert_eq!(values.len(), 3);

        let aggregates = db.event_aggregates("exp1", "recommendation_helpful").await.unwrap();
        let control = aggregates.iter().find(|a| a.variant == "control").unwrap();
        assert_eq!(control.count, 2);
        assert!((control.avg_value - 0.5).abs() < 1e-12);
    }
}
