//! Experiment Registry - lifecycle and metadata of controlled experiments
//!
//! Experiments are created once and kept forever as a historical record.
//! The registry mirrors the `experiments` table in memory; the table is the
//! source of truth and is loaded once when the registry is opened.

use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Experiment, ExperimentStatus, ExperimentStatusReport, Variant, VariantSummary};
use crate::config::ExperimentConfig;
use crate::error::{LabError, Result};
use crate::storage::Database;

/// Request to create an experiment
#[derive(Debug, Clone)]
pub struct NewExperiment {
    /// Caller-chosen id; a random one is generated when absent
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    pub variants: Vec<Variant>,
    pub success_metric: String,
    pub duration_days: Option<i64>,
}

impl NewExperiment {
    pub fn new(name: impl Into<String>, variants: &[&str], success_metric: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            variants: variants.iter().map(|v| Variant::named(*v)).collect(),
            success_metric: success_metric.into(),
            duration_days: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_duration_days(mut self, days: i64) -> Self {
        self.duration_days = Some(days);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LabError::InvalidExperiment("name must not be empty".into()));
        }
        if self.success_metric.trim().is_empty() {
            return Err(LabError::InvalidExperiment("success metric must not be empty".into()));
        }
        if self.variants.len() < 2 {
            return Err(LabError::InvalidExperiment(format!(
                "at least 2 variants required, got {}",
                self.variants.len()
            )));
        }

        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return Err(LabError::InvalidExperiment("variant names must not be empty".into()));
            }
            if !seen.insert(variant.name.as_str()) {
                return Err(LabError::InvalidExperiment(format!(
                    "duplicate variant '{}'",
                    variant.name
                )));
            }
        }

        if let Some(days) = self.duration_days {
            if days <= 0 {
                return Err(LabError::InvalidExperiment("duration must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Lifecycle and metadata of all experiments
pub struct ExperimentRegistry {
    db: Arc<Database>,
    experiments: RwLock<HashMap<String, Experiment>>,
    config: ExperimentConfig,
}

impl ExperimentRegistry {
    /// Load every stored experiment into memory
    pub async fn load(db: Arc<Database>, config: ExperimentConfig) -> Result<Self> {
        let experiments: HashMap<String, Experiment> = db
            .load_experiments()
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        debug!("Loaded {} experiments", experiments.len());

        Ok(Self {
            db,
            experiments: RwLock::new(experiments),
            config,
        })
    }

    /// Create an active experiment and return its id
    pub async fn create(&self, request: NewExperiment) -> Result<String> {
        request.validate()?;

        let id = match request.id {
            Some(id) if id.trim().is_empty() => {
                return Err(LabError::InvalidExperiment("id must not be empty".into()));
            }
            Some(id) => id,
            None => Uuid::new_v4().simple().to_string(),
        };

        if self.experiments.read().await.contains_key(&id) {
            return Err(LabError::InvalidExperiment(format!("experiment {} already exists", id)));
        }

        let start_date = Utc::now();
        let duration = request.duration_days.unwrap_or(self.config.default_duration_days);
        let experiment = Experiment {
            id: id.clone(),
            name: request.name,
            description: request.description,
            variants: request.variants,
            start_date,
            end_date: Some(start_date + Duration::days(duration)),
            status: ExperimentStatus::Active,
            success_metric: request.success_metric,
            min_sample_size: self.config.min_sample_size,
            confidence_level: self.config.confidence_level,
        };

        self.db.insert_experiment(&experiment).await?;

        info!(
            "Created experiment {} ({}) with variants {:?}",
            experiment.name,
            id,
            experiment.variant_names()
        );
        self.experiments.write().await.insert(id.clone(), experiment);

        Ok(id)
    }

    /// Look up an experiment regardless of status
    pub async fn get(&self, experiment_id: &str) -> Result<Experiment> {
        self.experiments
            .read()
            .await
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| LabError::ExperimentNotFound(experiment_id.to_string()))
    }

    /// Active experiments, oldest first
    pub async fn list_active(&self) -> Vec<Experiment> {
        let mut active: Vec<Experiment> = self
            .experiments
            .read()
            .await
            .values()
            .filter(|e| e.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|e| e.start_date);
        active
    }

    pub async fn list_all(&self) -> Vec<Experiment> {
        let mut all: Vec<Experiment> = self.experiments.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.start_date);
        all
    }

    /// Stop accepting new assignments and events
    pub async fn pause(&self, experiment_id: &str) -> Result<Experiment> {
        self.transition(experiment_id, ExperimentStatus::Paused).await
    }

    pub async fn resume(&self, experiment_id: &str) -> Result<Experiment> {
        self.transition(experiment_id, ExperimentStatus::Active).await
    }

    /// Terminal; a completed experiment stays readable and evaluable
    pub async fn complete(&self, experiment_id: &str) -> Result<Experiment> {
        self.transition(experiment_id, ExperimentStatus::Completed).await
    }

    async fn transition(&self, experiment_id: &str, target: ExperimentStatus) -> Result<Experiment> {
        let mut experiments = self.experiments.write().await;
        let experiment = experiments
            .get_mut(experiment_id)
            .ok_or_else(|| LabError::ExperimentNotFound(experiment_id.to_string()))?;

        if experiment.status == target {
            return Ok(experiment.clone());
        }
        if experiment.status == ExperimentStatus::Completed {
            return Err(LabError::InvalidExperiment(format!(
                "experiment {} is completed and cannot become {}",
                experiment_id, target
            )));
        }

        self.db.update_experiment_status(experiment_id, target).await?;
        info!("Experiment {}: {} -> {}", experiment_id, experiment.status, target);
        experiment.status = target;

        Ok(experiment.clone())
    }

    /// Assignment and event counts per variant for the success metric
    pub async fn status(&self, experiment_id: &str) -> Result<ExperimentStatusReport> {
        let experiment = self.get(experiment_id).await?;

        let assignments = self.db.assignment_counts(experiment_id).await?;
        let aggregates = self
            .db
            .event_aggregates(experiment_id, &experiment.success_metric)
            .await?;
        let has_results = self.db.has_result(experiment_id).await?;

        let mut variants: HashMap<String, VariantSummary> = experiment
            .variants
            .iter()
            .map(|v| {
                let summary = VariantSummary {
                    assignments: assignments.get(&v.name).copied().unwrap_or(0),
                    ..Default::default()
                };
                (v.name.clone(), summary)
            })
            .collect();

        for aggregate in &aggregates {
            let summary = variants.entry(aggregate.variant.clone()).or_default();
            summary.events = aggregate.count;
            summary.avg_value = Some(aggregate.avg_value);
        }

        let min = experiment.min_sample_size as usize;
        let ready = aggregates.len() >= 2 && aggregates.iter().all(|a| a.count >= min);

        Ok(ExperimentStatusReport {
            experiment_id: experiment.id,
            name: experiment.name,
            status: experiment.status,
            start_date: experiment.start_date,
            end_date: experiment.end_date,
            success_metric: experiment.success_metric,
            variants,
            has_results,
            ready,
        })
    }
}
