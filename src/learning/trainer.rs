//! Trainer, evaluator and baseline seams of the retrain pipeline
//!
//! The scheduler only talks to these traits, so the promotion state machine
//! can be driven with mocks and a stricter baseline can replace the default
//! tolerance window without touching it.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

use super::model::{ForestParams, MoodModel};
use crate::error::Result;
use crate::storage::Database;

/// Canonical-order feature vectors with their mood classes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSet {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<i64>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn subset(&self, indices: &[usize]) -> Self {
        Self {
            features: indices.iter().map(|&i| self.features[i].clone()).collect(),
            targets: indices.iter().map(|&i| self.targets[i]).collect(),
        }
    }

    /// Seeded (train, evaluation) split.
    ///
    /// A fraction of 0.0 (or a set too small to split) evaluates in-sample:
    /// both halves are the full set.
    pub fn holdout_split(&self, fraction: f64, seed: u64) -> (TrainingSet, TrainingSet) {
        let n = self.len();
        let held = (n as f64 * fraction.clamp(0.0, 1.0)).round() as usize;
        if held == 0 || n < 2 {
            return (self.clone(), self.clone());
        }
        let held = held.min(n - 1);

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let (eval, train) = order.split_at(held);
        (self.subset(train), self.subset(eval))
    }
}

/// Fits a candidate model
#[cfg_attr(test, mockall::automock)]
pub trait ModelTrainer: Send + Sync {
    fn fit(&self, data: &TrainingSet) -> Result<MoodModel>;
}

/// Scores a candidate on evaluation data
#[cfg_attr(test, mockall::automock)]
pub trait ModelEvaluator: Send + Sync {
    fn accuracy(&self, model: &MoodModel, data: &TrainingSet) -> Result<f64>;
}

/// Accuracy of the model currently serving predictions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BaselineAccuracy: Send + Sync {
    async fn current_accuracy(&self) -> Result<f64>;
}

/// Default trainer: standardizer + random forest
pub struct ForestTrainer {
    params: ForestParams,
}

impl ForestTrainer {
    pub fn new(params: ForestParams) -> Self {
        Self { params }
    }
}

impl ModelTrainer for ForestTrainer {
    fn fit(&self, data: &TrainingSet) -> Result<MoodModel> {
        MoodModel::fit(data, self.params)
    }
}

/// Exact class match accuracy
pub struct ExactMatchEvaluator;

impl ModelEvaluator for ExactMatchEvaluator {
    fn accuracy(&self, model: &MoodModel, data: &TrainingSet) -> Result<f64> {
        Ok(model.accuracy(data))
    }
}

/// Accuracy of logged production predictions over a rolling window.
///
/// A prediction counts as correct when it lands within `tolerance` of the
/// observed mood. With no logged predictions the baseline is `default`.
pub struct ToleranceWindow {
    db: Arc<Database>,
    window: usize,
    tolerance: f64,
    default: f64,
}

impl ToleranceWindow {
    pub fn new(db: Arc<Database>, window: usize, tolerance: f64) -> Self {
        Self {
            db,
            window,
            tolerance,
            default: 0.5,
        }
    }
}

#[async_trait]
impl BaselineAccuracy for ToleranceWindow {
    async fn current_accuracy(&self) -> Result<f64> {
        let pairs = self.db.recent_prediction_pairs(self.window).await?;
        if pairs.is_empty() {
            return Ok(self.default);
        }
        let correct = pairs
            .iter()
            .filter(|(target, prediction)| (target - prediction).abs() <= self.tolerance)
            .count();
        Ok(correct as f64 / pairs.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::{FeatureMap, LearningSample};

    #[test]
    fn test_holdout_split_sizes() {
        let set = TrainingSet {
            features: (0..10).map(|i| vec![i as f64]).collect(),
            targets: (0..10).collect(),
        };
        let (train, eval) = set.holdout_split(0.2, 42);
        assert_eq!(train.len(), 8);
        assert_eq!(eval.len(), 2);

        let mut all: Vec<i64> = train.targets.iter().chain(&eval.targets).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        // Same seed, same split
        assert_eq!(set.holdout_split(0.2, 42), (train, eval));
    }

    #[test]
    fn test_zero_fraction_is_in_sample() {
        let set = TrainingSet {
            features: vec![vec![1.0], vec![2.0]],
            targets: vec![1, 2],
        };
        let (train, eval) = set.holdout_split(0.0, 1);
        assert_eq!(train, set);
        assert_eq!(eval, set);
    }

    #[tokio::test]
    async fn test_tolerance_window_counts_off_by_one() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let baseline = ToleranceWindow::new(db.clone(), 100, 1.0);
        assert_eq!(baseline.current_accuracy().await.unwrap(), 0.5);

        for (target, prediction) in [(7.0, 6.0), (7.0, 8.0), (7.0, 4.0), (2.0, 2.0)] {
            let sample = LearningSample::new("u", FeatureMap::new(), target).with_prediction(prediction, 0.6);
            db.insert_sample(&sample).await.unwrap();
        }
        // Unpredicted samples are ignored
        db.insert_sample(&LearningSample::new("u", FeatureMap::new(), 1.0)).await.unwrap();

        assert!((baseline.current_accuracy().await.unwrap() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_forest_trainer_and_exact_evaluator() {
        let data = crate::learning::model::separable_set(40, 9);
        let trainer = ForestTrainer::new(ForestParams {
            n_trees: 10,
            ..ForestParams::default()
        });
        let model = trainer.fit(&data).unwrap();
        let accuracy = ExactMatchEvaluator.accuracy(&model, &data).unwrap();
        assert!(accuracy > 0.9);
    }
}
