//! Process-wide context
//!
//! Owns one handle to each component, all sharing a single database. Built
//! explicitly and passed around instead of living in globals, so tests can
//! open as many isolated contexts as they need.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::experiment::{EventLedger, ExperimentRegistry, SignificanceEvaluator, VariantAssigner};
use crate::learning::{ModelRegistry, RetrainScheduler};
use crate::storage::Database;

pub struct LabContext {
    pub config: Config,
    pub db: Arc<Database>,
    pub experiments: Arc<ExperimentRegistry>,
    pub assigner: VariantAssigner,
    pub ledger: EventLedger,
    pub evaluator: SignificanceEvaluator,
    pub models: Arc<ModelRegistry>,
    pub scheduler: RetrainScheduler,
}

impl LabContext {
    /// Open the database and model directory named by `config`
    pub async fn open(config: Config) -> Result<Self> {
        let db = Database::open(&config.storage.database_path)
            .await
            .with_context(|| format!("Failed to open database {}", config.storage.database_path.display()))?;
        let ctx = Self::with_database(config, Arc::new(db)).await?;

        info!("Opened moodlab store at {}", ctx.config.storage.database_path.display());
        Ok(ctx)
    }

    /// Wire every component over an already-open database
    pub async fn with_database(config: Config, db: Arc<Database>) -> Result<Self> {
        let experiments = Arc::new(
            ExperimentRegistry::load(db.clone(), config.experiments.clone())
                .await
                .context("Failed to load experiments")?,
        );
        let assigner = VariantAssigner::new(db.clone(), experiments.clone());
        let ledger = EventLedger::new(db.clone(), experiments.clone());
        let evaluator = SignificanceEvaluator::new(
            db.clone(),
            experiments.clone(),
            config.experiments.significance_threshold,
        );

        let models = Arc::new(
            ModelRegistry::load(db.clone(), config.storage.models_dir.clone())
                .await
                .with_context(|| format!("Failed to open models directory {}", config.storage.models_dir.display()))?,
        );
        let scheduler = RetrainScheduler::with_defaults(db.clone(), models.clone(), config.learning.clone())
            .await
            .context("Failed to start retrain scheduler")?;

        Ok(Self {
            config,
            db,
            experiments,
            assigner,
            ledger,
            evaluator,
            models,
            scheduler,
        })
    }
}
