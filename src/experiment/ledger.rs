//! Append-only ledger of experiment outcome events

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::{ExperimentEvent, ExperimentRegistry};
use crate::error::Result;
use crate::storage::Database;

pub struct EventLedger {
    db: Arc<Database>,
    registry: Arc<ExperimentRegistry>,
}

impl EventLedger {
    pub fn new(db: Arc<Database>, registry: Arc<ExperimentRegistry>) -> Self {
        Self { db, registry }
    }

    /// Record an outcome for an assigned user.
    ///
    /// Late or out-of-band telemetry is tolerated: an unknown or inactive
    /// experiment, or a user without an assignment, is a no-op returning
    /// `Ok(None)`. The variant is always taken from the stored assignment.
    pub async fn record_event(
        &self,
        experiment_id: &str,
        user_id: &str,
        metric: &str,
        value: f64,
        context: Option<serde_json::Value>,
    ) -> Result<Option<ExperimentEvent>> {
        let experiment = match self.registry.get(experiment_id).await {
            Ok(experiment) if experiment.is_active() => experiment,
            Ok(experiment) => {
                debug!("Dropping event for {} experiment {}", experiment.status, experiment_id);
                return Ok(None);
            }
            Err(_) => {
                debug!("Dropping event for unknown experiment {}", experiment_id);
                return Ok(None);
            }
        };

        let Some(assignment) = self.db.get_assignment(&experiment.id, user_id).await? else {
            debug!("Dropping event for unassigned user {} in {}", user_id, experiment_id);
            return Ok(None);
        };

        let event = ExperimentEvent {
            experiment_id: experiment.id,
            user_id: user_id.to_string(),
            variant: assignment.variant,
            metric: metric.to_string(),
            value,
            timestamp: Utc::now(),
            context,
        };
        self.db.insert_event(&event).await?;

        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::experiment::{NewExperiment, VariantAssigner};

    #[tokio::test]
    async fn test_event_uses_stored_variant() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(
            ExperimentRegistry::load(db.clone(), ExperimentConfig::default())
                .await
                .unwrap(),
        );
        let id = registry
            .create(NewExperiment::new("x", &["control", "enhanced"], "helpful"))
            .await
            .unwrap();
        let assigner = VariantAssigner::new(db.clone(), registry.clone());
        let ledger = EventLedger::new(db.clone(), registry);

        let variant = assigner.assign(&id, "u1").await.unwrap();
        let event = ledger
            .record_event(&id, "u1", "helpful", 1.0, Some(serde_json::json!({"screen": "home"})))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.variant, variant);
        assert_eq!(db.metric_values(&id, "helpful").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_untracked_events_are_noops() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(
            ExperimentRegistry::load(db.clone(), ExperimentConfig::default())
                .await
                .unwrap(),
        );
        let id = registry
            .create(NewExperiment::new("x", &["control", "enhanced"], "helpful"))
            .await
            .unwrap();
        let ledger = EventLedger::new(db.clone(), registry);

        assert!(ledger.record_event("nope", "u1", "helpful", 1.0, None).await.unwrap().is_none());
        assert!(ledger.record_event(&id, "stranger", "helpful", 1.0, None).await.unwrap().is_none());

        // No assignment is created as a side effect
        assert!(db.get_assignment(&id, "stranger").await.unwrap().is_none());
        assert!(db.metric_values(&id, "helpful").await.unwrap().is_empty());
    }
}
