//! Retrain Scheduler - gates, launches and supervises model retraining
//!
//! A retrain is launched only when all of these hold:
//! - the cooldown since the last promotion has elapsed
//! - at least `retrain_threshold` samples were logged since the last launch
//! - no retrain is in flight in this process
//!
//! `add_sample` never waits for the retrain it triggers; fitting runs on the
//! blocking pool inside a spawned worker. Every attempt that gets as far as
//! training leaves a row in the retraining log, and failures never touch the
//! active model.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::features;
use super::trainer::{BaselineAccuracy, ExactMatchEvaluator, ForestTrainer, ModelEvaluator, ModelTrainer, ToleranceWindow};
use super::{
    LearningBuffer, LearningInsights, LearningSample, ModelRegistry, MoodModel, RetrainLogEntry, RetrainOutcome,
    SchedulerState, MOOD_MODEL_KIND,
};
use crate::config::LearningConfig;
use crate::error::{LabError, Result};
use crate::storage::Database;

/// How long `stop_continuous_learning` waits for the loop to exit
const STOP_TIMEOUT_SECS: u64 = 5;

struct BackgroundLoop {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Clears the in-flight flag when a retrain ends, panics included
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct RetrainScheduler {
    db: Arc<Database>,
    models: Arc<ModelRegistry>,
    trainer: Arc<dyn ModelTrainer>,
    evaluator: Arc<dyn ModelEvaluator>,
    baseline: Arc<dyn BaselineAccuracy>,
    config: Arc<LearningConfig>,
    buffer: Arc<Mutex<LearningBuffer>>,
    /// Newest sample id at the last launch, mirrored in the store;
    /// pending = samples after it
    checkpoint: Arc<RwLock<i64>>,
    last_retrain: Arc<RwLock<Option<DateTime<Utc>>>>,
    in_flight: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<RetrainOutcome>>>>,
    background: Arc<Mutex<Option<BackgroundLoop>>>,
}

impl RetrainScheduler {
    pub async fn new(
        db: Arc<Database>,
        models: Arc<ModelRegistry>,
        config: LearningConfig,
        trainer: Arc<dyn ModelTrainer>,
        evaluator: Arc<dyn ModelEvaluator>,
        baseline: Arc<dyn BaselineAccuracy>,
    ) -> Result<Self> {
        // Samples logged by earlier processes count toward the threshold
        let checkpoint = db.sample_checkpoint(MOOD_MODEL_KIND).await?.unwrap_or(0);
        let last_retrain = models.last_promotion().await;

        Ok(Self {
            db,
            models,
            trainer,
            evaluator,
            baseline,
            buffer: Arc::new(Mutex::new(LearningBuffer::new(config.buffer_capacity))),
            config: Arc::new(config),
            checkpoint: Arc::new(RwLock::new(checkpoint)),
            last_retrain: Arc::new(RwLock::new(last_retrain)),
            in_flight: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(None)),
            background: Arc::new(Mutex::new(None)),
        })
    }

    /// Scheduler with the forest trainer, exact-match evaluator and the
    /// tolerance-window baseline
    pub async fn with_defaults(db: Arc<Database>, models: Arc<ModelRegistry>, config: LearningConfig) -> Result<Self> {
        let trainer = Arc::new(ForestTrainer::new((&config).into()));
        let baseline = Arc::new(ToleranceWindow::new(
            db.clone(),
            config.accuracy_window,
            config.accuracy_tolerance,
        ));
        Self::new(db, models, config, trainer, Arc::new(ExactMatchEvaluator), baseline).await
    }

    /// Buffer and log a sample, then launch a retrain if the policy allows.
    ///
    /// Returns whether a retrain was launched. Logging the sample is best
    /// effort: a failed insert is reported and the sample stays buffered.
    pub async fn add_sample(&self, sample: LearningSample) -> Result<bool> {
        if let Err(e) = self.db.insert_sample(&sample).await {
            warn!("Failed to log learning sample for {}: {}", sample.user_id, e);
        }

        let evicted = self.buffer.lock().await.push(sample);
        if evicted.is_some() {
            debug!("Learning buffer full; evicted oldest sample");
        }

        self.maybe_schedule().await
    }

    /// Apply the retrain policy; launches a background worker when it passes
    pub async fn maybe_schedule(&self) -> Result<bool> {
        if !self.cooldown_elapsed().await {
            return Ok(false);
        }

        let pending = self.pending_samples().await?;
        if pending < self.config.retrain_threshold {
            return Ok(false);
        }

        let Some(guard) = self.try_begin() else {
            debug!("Retrain already in flight; not scheduling another");
            return Ok(false);
        };
        self.advance_checkpoint().await?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.run_pipeline().await
        });
        *self.worker.lock().await = Some(handle);

        info!("Scheduled background retrain ({} new samples)", pending);
        Ok(true)
    }

    /// Run the pipeline on the caller's task, unless one is already running
    pub async fn retrain_now(&self) -> RetrainOutcome {
        let Some(_guard) = self.try_begin() else {
            return RetrainOutcome::Busy;
        };
        if let Err(e) = self.advance_checkpoint().await {
            warn!("Could not advance sample checkpoint: {}", e);
        }
        self.run_pipeline().await
    }

    /// Wait for the background worker, if any, and return its outcome
    pub async fn wait_idle(&self) -> Option<RetrainOutcome> {
        let handle = self.worker.lock().await.take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Retrain worker aborted: {}", e);
                Some(RetrainOutcome::Failed { error: e.to_string() })
            }
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.in_flight.load(Ordering::SeqCst) {
            SchedulerState::Retraining
        } else {
            SchedulerState::Idle
        }
    }

    pub async fn last_retrain(&self) -> Option<DateTime<Utc>> {
        *self.last_retrain.read().await
    }

    pub async fn pending_samples(&self) -> Result<usize> {
        let checkpoint = *self.checkpoint.read().await;
        self.db.sample_count_after(checkpoint).await
    }

    pub async fn buffer_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn insights(&self) -> Result<LearningInsights> {
        Ok(LearningInsights {
            total_samples: self.db.sample_count().await?,
            recent_samples: self.db.sample_count_since(Utc::now() - Duration::days(7)).await?,
            model_versions: self.db.recent_versions(5).await?,
            retraining_history: self.db.recent_retrain_log(10).await?,
            last_retrain: self.last_retrain().await,
            buffer_size: self.buffer_len().await,
            pending_samples: self.pending_samples().await?,
            state: self.state(),
            active_version: self.models.active_version().await.map(|v| v.version_id),
        })
    }

    /// Start the periodic policy check; false if it is already running
    pub async fn start_continuous_learning(&self) -> bool {
        let mut background = self.background.lock().await;
        if background.as_ref().is_some_and(|b| !b.handle.is_finished()) {
            warn!("Continuous learning already running");
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let poll = std::time::Duration::from_secs(self.config.poll_interval_secs);
        let backoff = std::time::Duration::from_secs(self.config.error_backoff_secs);
        let this = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                let delay = match this.tick().await {
                    Ok(()) => poll,
                    Err(e) => {
                        error!("Continuous learning iteration failed: {:#}; retrying in {:?}", e, backoff);
                        backoff
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!("Continuous learning loop exited");
        });

        *background = Some(BackgroundLoop { shutdown_tx, handle });
        info!(
            "Continuous learning started (poll every {}s)",
            self.config.poll_interval_secs
        );
        true
    }

    /// Signal the loop and wait briefly for it to exit.
    ///
    /// An in-flight retrain is not cancelled; it finishes on its own.
    pub async fn stop_continuous_learning(&self) {
        let Some(background) = self.background.lock().await.take() else {
            return;
        };
        let _ = background.shutdown_tx.send(());

        let wait = std::time::Duration::from_secs(STOP_TIMEOUT_SECS);
        if tokio::time::timeout(wait, background.handle).await.is_err() {
            warn!("Continuous learning loop did not stop within {}s", STOP_TIMEOUT_SECS);
        }
        info!("Continuous learning stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.background
            .lock()
            .await
            .as_ref()
            .is_some_and(|b| !b.handle.is_finished())
    }

    /// One loop iteration: collect a finished worker, then apply the policy
    async fn tick(&self) -> anyhow::Result<()> {
        let finished = {
            let mut worker = self.worker.lock().await;
            match worker.as_ref() {
                Some(handle) if handle.is_finished() => worker.take(),
                _ => None,
            }
        };
        if let Some(handle) = finished {
            let outcome = handle.await?;
            debug!("Background retrain finished: {:?}", outcome);
        }

        if self.maybe_schedule().await? {
            debug!("Continuous learning launched a retrain");
        }
        Ok(())
    }

    fn try_begin(&self) -> Option<InFlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard(self.in_flight.clone()))
    }

    async fn advance_checkpoint(&self) -> Result<()> {
        let latest = self.db.latest_sample_id().await?;
        self.db.save_sample_checkpoint(MOOD_MODEL_KIND, latest).await?;
        *self.checkpoint.write().await = latest;
        Ok(())
    }

    async fn cooldown_elapsed(&self) -> bool {
        match *self.last_retrain.read().await {
            Some(last) => Utc::now() - last >= Duration::hours(self.config.cooldown_hours),
            None => true,
        }
    }

    async fn run_pipeline(&self) -> RetrainOutcome {
        info!("Starting model retraining");
        let required = self.config.retrain_threshold;

        let samples = match self.db.recent_samples(required * 2).await {
            Ok(samples) => samples,
            Err(e) => return self.record_failure(0, e).await,
        };
        if samples.len() < required {
            warn!("Not enough samples for retraining ({} < {})", samples.len(), required);
            return RetrainOutcome::InsufficientData {
                available: samples.len(),
                required,
            };
        }

        let used = samples.len();
        match self.train_and_gate(&samples).await {
            Ok(outcome) => outcome,
            Err(e) => self.record_failure(used, e).await,
        }
    }

    async fn train_and_gate(&self, samples: &[LearningSample]) -> Result<RetrainOutcome> {
        let used = samples.len();
        let data = features::training_set(samples);
        let (train, eval) = data.holdout_split(self.config.holdout_fraction, self.config.seed);

        let trainer = self.trainer.clone();
        let evaluator = self.evaluator.clone();
        let (model, accuracy) = tokio::task::spawn_blocking(move || -> Result<(MoodModel, f64)> {
            let model = trainer.fit(&train)?;
            let accuracy = evaluator.accuracy(&model, &eval)?;
            Ok((model, accuracy))
        })
        .await
        .map_err(|e| LabError::Training(format!("training task failed: {}", e)))??;

        let current = self.baseline.current_accuracy().await?;
        let improvement = accuracy - current;

        if improvement < self.config.min_accuracy_improvement {
            info!(
                "New model not significantly better (accuracy {:.3} vs {:.3}, improvement {:.3})",
                accuracy, current, improvement
            );
            self.log_attempt(None, improvement, used, None).await;
            return Ok(RetrainOutcome::NotPromoted {
                accuracy,
                improvement,
                samples_used: used,
            });
        }

        let version = self.models.promote(model, accuracy).await?;
        *self.last_retrain.write().await = Some(version.created_at);
        self.log_attempt(Some(version.version_id.clone()), improvement, used, None).await;

        info!("Model retrained; accuracy improved by {:.3}", improvement);
        Ok(RetrainOutcome::Promoted {
            version_id: version.version_id,
            accuracy,
            improvement,
            samples_used: used,
        })
    }

    async fn record_failure(&self, used: usize, e: LabError) -> RetrainOutcome {
        error!("Model retraining failed: {}", e);
        let message = e.to_string();
        self.log_attempt(None, 0.0, used, Some(message.clone())).await;
        RetrainOutcome::Failed { error: message }
    }

    async fn log_attempt(&self, version_id: Option<String>, improvement: f64, used: usize, error: Option<String>) {
        let entry = RetrainLogEntry {
            version_id,
            accuracy_improvement: improvement,
            samples_used: used,
            timestamp: Utc::now(),
            success: error.is_none(),
            error,
        };
        if let Err(e) = self.db.insert_retrain_log(&entry).await {
            warn!("Failed to write retraining log: {}", e);
        }
    }
}
