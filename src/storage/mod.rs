//! SQLite persistence for experiments and continuous learning
//!
//! One connection guarded by an async mutex. Each repository method runs a
//! single statement (or one transaction), which is the only synchronization
//! the request paths rely on.

pub mod experiments;
pub mod learning;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// SQLite-backed store shared by both subsystems
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;

        // WAL lets readers proceed while the retrain worker writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;

        Self::init_schema(&conn)?;
        debug!("Opened database at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(r#"
            -- Experiment side
            CREATE TABLE IF NOT EXISTS experiments (
                experiment_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                variants TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT,
                status TEXT NOT NULL,
                success_metric TEXT NOT NULL,
                minimum_sample_size INTEGER NOT NULL,
                confidence_level REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS experiment_assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                variant TEXT NOT NULL,
                assigned_date TEXT NOT NULL,
                UNIQUE (experiment_id, user_id),
                FOREIGN KEY (experiment_id) REFERENCES experiments(experiment_id)
            );

            CREATE TABLE IF NOT EXISTS experiment_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                variant TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_value REAL NOT NULL,
                timestamp TEXT NOT NULL,
                context TEXT,
                FOREIGN KEY (experiment_id) REFERENCES experiments(experiment_id)
            );

            CREATE TABLE IF NOT EXISTS experiment_results (
                experiment_id TEXT PRIMARY KEY,
                results TEXT NOT NULL,
                calculated_date TEXT NOT NULL,
                FOREIGN KEY (experiment_id) REFERENCES experiments(experiment_id)
            );

            -- Learning side
            CREATE TABLE IF NOT EXISTS learning_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                features TEXT NOT NULL,
                target_value REAL NOT NULL,
                prediction REAL,
                confidence REAL,
                timestamp TEXT NOT NULL,
                data_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS model_versions (
                version_id TEXT PRIMARY KEY,
                model_type TEXT NOT NULL,
                accuracy REAL NOT NULL,
                created_date TEXT NOT NULL,
                file_path TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0
            );

            -- Newest sample id seen by the last retrain launch, per model kind
            CREATE TABLE IF NOT EXISTS scheduler_state (
                model_type TEXT PRIMARY KEY,
                sample_checkpoint INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS retraining_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version_id TEXT,
                accuracy_improvement REAL NOT NULL,
                samples_used INTEGER NOT NULL,
                retrain_date TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_metric ON experiment_events(experiment_id, event_type);
            CREATE INDEX IF NOT EXISTS idx_learning_timestamp ON learning_data(timestamp DESC);
            -- At most one active version per model kind
            CREATE UNIQUE INDEX IF NOT EXISTS idx_model_versions_active
                ON model_versions(model_type) WHERE is_active = 1;
        "#)?;

        Ok(())
    }
}

/// Fixed-width UTC timestamp so string order matches time order
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp; `column` is reported when the text is corrupt
pub(crate) fn parse_ts(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_all_tables_created() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("nested").join("test.db")).await.unwrap();
        let conn = db.conn.lock().await;

        for table in [
            "experiments",
            "experiment_assignments",
            "experiment_events",
            "experiment_results",
            "learning_data",
            "model_versions",
            "retraining_log",
            "scheduler_state",
        ] {
            let exists: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "table {} should exist", table);
        }
    }

    #[test]
    fn test_timestamp_format_sorts_lexically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T00:00:01Z").unwrap().with_timezone(&Utc);
        assert!(fmt_ts(&early) < fmt_ts(&late));
        assert_eq!(parse_ts(&fmt_ts(&early), 0).unwrap(), early);
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let err = parse_ts("yesterday-ish", 3).unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(3, _, _)));
    }
}
