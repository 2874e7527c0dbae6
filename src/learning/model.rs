//! Mood predictor: standardizer plus a bagged decision-tree classifier
//!
//! The forest follows the usual random-forest recipe: each tree is grown on a
//! bootstrap sample, every split considers a random subset of sqrt(n)
//! features, and splits minimize weighted Gini impurity. Leaves store class
//! distributions; the forest averages them. All randomness derives from one
//! seed so a fit is reproducible.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::features::{self, FeatureMap, FEATURE_SCHEMA_VERSION};
use super::trainer::TrainingSet;
use crate::config::LearningConfig;
use crate::error::{LabError, Result};

/// Forest hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            seed: 42,
        }
    }
}

impl From<&LearningConfig> for ForestParams {
    fn from(config: &LearningConfig) -> Self {
        Self {
            n_trees: config.forest_trees.max(1),
            max_depth: config.forest_max_depth,
            min_samples_split: config.min_samples_split,
            min_samples_leaf: config.min_samples_leaf,
            seed: config.seed,
        }
    }
}

/// Zero-mean, unit-variance scaling per column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self> {
        let width = rows
            .first()
            .map(|r| r.len())
            .ok_or_else(|| LabError::InsufficientData("cannot fit scaler on zero rows".into()))?;
        if rows.iter().any(|r| r.len() != width) {
            return Err(LabError::Training("feature rows have inconsistent width".into()));
        }
        let n = rows.len() as f64;

        let mut mean = vec![0.0; width];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }

        let mut scale = vec![0.0; width];
        for row in rows {
            for ((s, v), m) in scale.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        // Constant columns pass through unscaled
        for s in scale.iter_mut() {
            *s = if *s > f64::EPSILON { s.sqrt() } else { 1.0 };
        }

        Ok(Self { mean, scale })
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|r| self.transform_row(r)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn leaf(counts: &[usize], total: usize) -> Self {
        let total = total.max(1) as f64;
        Node::Leaf {
            distribution: counts.iter().map(|&c| c as f64 / total).collect(),
        }
    }
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / total).powi(2)).sum::<f64>()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionTree {
    root: Node,
}

impl DecisionTree {
    fn distribution(&self, row: &[f64]) -> &[f64] {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { distribution } => return distribution,
                Node::Split { feature, threshold, left, right } => {
                    let value = row.get(*feature).copied().unwrap_or(0.0);
                    node = if value <= *threshold { left } else { right };
                }
            }
        }
    }
}

struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [usize],
    n_classes: usize,
    n_features: usize,
    max_features: usize,
    params: ForestParams,
    rng: StdRng,
}

impl TreeBuilder<'_> {
    fn class_counts(&self, indices: &[usize]) -> Vec<usize> {
        let mut counts = vec![0; self.n_classes];
        for &i in indices {
            counts[self.y[i]] += 1;
        }
        counts
    }

    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> Node {
        let n = indices.len();
        let counts = self.class_counts(&indices);
        let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
        let min_leaf = self.params.min_samples_leaf.max(1);

        if pure || depth >= self.params.max_depth || n < self.params.min_samples_split || n < 2 * min_leaf {
            return Node::leaf(&counts, n);
        }

        match self.best_split(&indices, &counts) {
            Some((feature, threshold)) => {
                let (left, right): (Vec<usize>, Vec<usize>) = indices
                    .into_iter()
                    .partition(|&i| self.x[i][feature] <= threshold);
                Node::Split {
                    feature,
                    threshold,
                    left: Box::new(self.grow(left, depth + 1)),
                    right: Box::new(self.grow(right, depth + 1)),
                }
            }
            None => Node::leaf(&counts, n),
        }
    }

    fn best_split(&mut self, indices: &[usize], parent: &[usize]) -> Option<(usize, f64)> {
        let n = indices.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        // Random feature order; constant features do not count toward max_features
        let shuffled = index::sample(&mut self.rng, self.n_features, self.n_features).into_vec();

        let mut best: Option<(usize, f64, f64)> = None;
        let mut order = indices.to_vec();
        let mut visited = 0;
        let x = self.x;

        for feature in shuffled {
            if visited == self.max_features {
                break;
            }
            order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));
            if x[order[0]][feature] >= x[order[n - 1]][feature] {
                continue;
            }
            visited += 1;

            let mut left = vec![0usize; self.n_classes];
            let mut right = parent.to_vec();

            for pos in 0..n - 1 {
                let class = self.y[order[pos]];
                left[class] += 1;
                right[class] -= 1;

                let here = x[order[pos]][feature];
                let next = x[order[pos + 1]][feature];
                let (left_n, right_n) = (pos + 1, n - pos - 1);
                if here >= next || left_n < min_leaf || right_n < min_leaf {
                    continue;
                }

                let impurity =
                    (left_n as f64 * gini(&left, left_n) + right_n as f64 * gini(&right, right_n)) / n as f64;
                if best.map_or(true, |(_, _, b)| impurity < b) {
                    let mut threshold = (here + next) / 2.0;
                    if threshold >= next {
                        threshold = here;
                    }
                    best = Some((feature, threshold, impurity));
                }
            }
        }

        best.map(|(feature, threshold, _)| (feature, threshold))
    }
}

/// Bagged decision trees over scaled features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    classes: Vec<i64>,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    pub fn fit(x: &[Vec<f64>], y: &[i64], params: ForestParams) -> Result<Self> {
        if x.is_empty() || x.len() != y.len() {
            return Err(LabError::InsufficientData(format!(
                "{} rows with {} labels",
                x.len(),
                y.len()
            )));
        }
        let n_features = x[0].len();
        if n_features == 0 || x.iter().any(|r| r.len() != n_features) {
            return Err(LabError::Training("feature rows have inconsistent width".into()));
        }

        let mut classes: Vec<i64> = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let encoded: Vec<usize> = y
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();

        let max_features = ((n_features as f64).sqrt().floor() as usize).clamp(1, n_features);
        let mut master = StdRng::seed_from_u64(params.seed);
        let n = x.len();

        let trees = (0..params.n_trees.max(1))
            .map(|_| {
                let mut builder = TreeBuilder {
                    x,
                    y: &encoded,
                    n_classes: classes.len(),
                    n_features,
                    max_features,
                    params,
                    rng: StdRng::seed_from_u64(master.random()),
                };
                let bootstrap: Vec<usize> = (0..n).map(|_| builder.rng.random_range(0..n)).collect();
                DecisionTree {
                    root: builder.grow(bootstrap, 0),
                }
            })
            .collect();

        Ok(Self {
            classes,
            n_features,
            trees,
        })
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    /// Mean of the tree leaf distributions, indexed like `classes()`
    pub fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let mut total = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            for (t, p) in total.iter_mut().zip(tree.distribution(row)) {
                *t += p;
            }
        }
        let count = self.trees.len().max(1) as f64;
        total.iter_mut().for_each(|t| *t /= count);
        total
    }

    pub fn predict(&self, row: &[f64]) -> i64 {
        let proba = self.predict_proba(row);
        let mut best = 0;
        for (i, p) in proba.iter().enumerate() {
            if *p > proba[best] {
                best = i;
            }
        }
        self.classes.get(best).copied().unwrap_or_default()
    }
}

/// Class, its probability, and the full distribution for one input
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub class: i64,
    pub confidence: f64,
    pub probabilities: BTreeMap<i64, f64>,
}

/// Serialized artifact: scaler and forest fitted together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodModel {
    schema_version: u32,
    scaler: StandardScaler,
    forest: RandomForest,
}

impl MoodModel {
    pub fn fit(data: &TrainingSet, params: ForestParams) -> Result<Self> {
        let scaler = StandardScaler::fit(&data.features)?;
        let scaled = scaler.transform(&data.features);
        let forest = RandomForest::fit(&scaled, &data.targets, params)?;
        Ok(Self {
            schema_version: FEATURE_SCHEMA_VERSION,
            scaler,
            forest,
        })
    }

    pub fn predict_vector(&self, vector: &[f64]) -> ModelOutput {
        let scaled = self.scaler.transform_row(vector);
        let proba = self.forest.predict_proba(&scaled);
        let class = self.forest.predict(&scaled);
        let probabilities: BTreeMap<i64, f64> = self
            .forest
            .classes()
            .iter()
            .copied()
            .zip(proba.iter().copied())
            .collect();
        let confidence = probabilities.get(&class).copied().unwrap_or(0.0);

        ModelOutput {
            class,
            confidence,
            probabilities,
        }
    }

    pub fn predict(&self, features: &FeatureMap) -> ModelOutput {
        self.predict_vector(&features::to_vector(features))
    }

    /// Share of rows whose predicted class equals the label
    pub fn accuracy(&self, data: &TrainingSet) -> f64 {
        if data.targets.is_empty() {
            return 0.0;
        }
        let correct = data
            .features
            .iter()
            .zip(&data.targets)
            .filter(|(row, label)| self.predict_vector(row).class == **label)
            .count();
        correct as f64 / data.targets.len() as f64
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let model: MoodModel = serde_json::from_str(raw)?;
        if model.schema_version != FEATURE_SCHEMA_VERSION || model.forest.n_features != features::feature_count() {
            return Err(LabError::Training(format!(
                "artifact uses feature schema v{} with {} features, expected v{} with {}",
                model.schema_version,
                model.forest.n_features,
                FEATURE_SCHEMA_VERSION,
                features::feature_count()
            )));
        }
        Ok(model)
    }
}

/// Two well separated mood classes driven by `polarity`
#[cfg(test)]
pub(crate) fn separable_set(n: usize, seed: u64) -> TrainingSet {
    use rand_distr::{Distribution, Normal};

    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let mut features = Vec::with_capacity(n);
    let mut targets = Vec::with_capacity(n);
    for i in 0..n {
        let positive = i % 2 == 0;
        let mut row = vec![0.0; features::feature_count()];
        row[20] = if positive { 0.8 } else { -0.8 } + noise.sample(&mut rng);
        row[2] = rng.random_range(0.0..24.0);
        features.push(row);
        targets.push(if positive { 8 } else { 3 });
    }
    TrainingSet { features, targets }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ForestParams {
        ForestParams {
            n_trees: 15,
            ..ForestParams::default()
        }
    }

    #[test]
    fn test_scaler_centers_and_scales() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = StandardScaler::fit(&rows).unwrap();
        assert_eq!(scaler.transform_row(&[1.0, 5.0]), vec![-1.0, 0.0]);
        assert_eq!(scaler.transform_row(&[3.0, 7.0]), vec![1.0, 2.0]);
        assert!(StandardScaler::fit(&[]).is_err());
    }

    #[test]
    fn test_gini_bounds() {
        assert_eq!(gini(&[4, 0], 4), 0.0);
        assert!((gini(&[2, 2], 4) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_forest_learns_separable_classes() {
        let data = separable_set(80, 1);
        let model = MoodModel::fit(&data, small_params()).unwrap();
        assert!(model.accuracy(&data) > 0.95);

        let holdout = separable_set(40, 2);
        assert!(model.accuracy(&holdout) > 0.9);

        let output = model.predict_vector(&holdout.features[0]);
        assert_eq!(output.class, 8);
        let total: f64 = output.probabilities.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(output.confidence, output.probabilities[&8]);
    }

    #[test]
    fn test_fit_is_reproducible_for_a_seed() {
        let data = separable_set(40, 3);
        let a = MoodModel::fit(&data, small_params()).unwrap();
        let b = MoodModel::fit(&data, small_params()).unwrap();
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn test_single_class_predicts_that_class() {
        let data = TrainingSet {
            features: vec![vec![0.0; features::feature_count()]; 10],
            targets: vec![5; 10],
        };
        let model = MoodModel::fit(&data, small_params()).unwrap();
        let output = model.predict_vector(&data.features[0]);
        assert_eq!(output.class, 5);
        assert_eq!(output.confidence, 1.0);
    }

    #[test]
    fn test_artifact_roundtrip_and_schema_check() {
        let data = separable_set(20, 4);
        let model = MoodModel::fit(&data, small_params()).unwrap();
        let restored = MoodModel::from_json(&model.to_json().unwrap()).unwrap();
        for row in &data.features {
            let (a, b) = (restored.predict_vector(row), model.predict_vector(row));
            assert_eq!(a.class, b.class);
            assert!((a.confidence - b.confidence).abs() < 1e-9);
        }

        let narrow = TrainingSet {
            features: vec![vec![1.0, 2.0], vec![2.0, 1.0]],
            targets: vec![1, 2],
        };
        let wrong = MoodModel::fit(&narrow, small_params()).unwrap();
        assert!(MoodModel::from_json(&wrong.to_json().unwrap()).is_err());
    }

    #[test]
    fn test_mismatched_rows_rejected() {
        let bad = TrainingSet {
            features: vec![vec![1.0], vec![1.0, 2.0]],
            targets: vec![1, 2],
        };
        assert!(MoodModel::fit(&bad, small_params()).is_err());
    }
}
