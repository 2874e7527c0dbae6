//! Significance Evaluator - turns ledger events into an experiment result
//!
//! Results are a materialized view: recomputed from the events on every
//! `evaluate`, then persisted (overwriting the previous row) and cached for
//! the life of the process.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::stats::{self, TestOutcome};
use super::{Experiment, ExperimentRegistry, ExperimentResult, VariantStats};
use crate::error::Result;
use crate::storage::Database;

pub struct SignificanceEvaluator {
    db: Arc<Database>,
    registry: Arc<ExperimentRegistry>,
    significance_threshold: f64,
    cache: RwLock<HashMap<String, ExperimentResult>>,
}

impl SignificanceEvaluator {
    pub fn new(db: Arc<Database>, registry: Arc<ExperimentRegistry>, significance_threshold: f64) -> Self {
        Self {
            db,
            registry,
            significance_threshold,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Aggregate the success metric per variant and test the first two
    /// variants (declared order) that have data.
    pub async fn evaluate(&self, experiment_id: &str) -> Result<ExperimentResult> {
        let experiment = self.registry.get(experiment_id).await?;
        let values = self
            .db
            .metric_values(experiment_id, &experiment.success_metric)
            .await?;

        let grouped = group_by_variant(&experiment, values);
        let summaries: Vec<VariantStats> = grouped
            .iter()
            .map(|(variant, vals)| stats::summarize(variant, vals))
            .collect();

        if grouped.len() < 2 {
            debug!(
                "Experiment {} has data for {} variant(s); skipping test",
                experiment_id,
                grouped.len()
            );
            return Ok(ExperimentResult::insufficient(
                experiment_id,
                summaries,
                &format!("need at least 2 variants with data, found {}", grouped.len()),
            ));
        }

        let outcome = stats::compare(&grouped[0].1, &grouped[1].1);
        let result = self.build_result(experiment_id, summaries, outcome);

        self.db.save_result(&result).await?;
        self.cache
            .write()
            .await
            .insert(experiment_id.to_string(), result.clone());

        info!(
            "Evaluated {}: p={:.4} significant={} winner={:?}",
            experiment_id, result.p_value, result.significant, result.winner
        );
        Ok(result)
    }

    /// Last computed result, from the process cache or the store
    pub async fn latest_result(&self, experiment_id: &str) -> Result<Option<ExperimentResult>> {
        if let Some(cached) = self.cache.read().await.get(experiment_id) {
            return Ok(Some(cached.clone()));
        }
        // Unknown ids are an error rather than "no result"
        self.registry.get(experiment_id).await?;
        self.db.load_result(experiment_id).await
    }

    fn build_result(&self, experiment_id: &str, summaries: Vec<VariantStats>, outcome: TestOutcome) -> ExperimentResult {
        let a = &summaries[0];
        let b = &summaries[1];
        let significant = outcome.p_value < self.significance_threshold;

        let winner = if !significant || a.mean == b.mean {
            None
        } else if a.mean > b.mean {
            Some(a.variant.clone())
        } else {
            Some(b.variant.clone())
        };

        let recommendation = recommend(significant, outcome.p_value, a.mean, b.mean, winner.as_deref());

        ExperimentResult {
            experiment_id: experiment_id.to_string(),
            test: outcome.kind,
            significant,
            p_value: outcome.p_value,
            confidence_interval: outcome.confidence_interval,
            winner,
            recommendation,
            computed_at: Utc::now(),
            variants: summaries,
        }
    }
}

/// Values per variant, declared variants first, variants with data only
fn group_by_variant(experiment: &Experiment, values: Vec<(String, f64)>) -> Vec<(String, Vec<f64>)> {
    let mut by_variant: HashMap<String, Vec<f64>> = HashMap::new();
    let mut first_seen: Vec<String> = Vec::new();
    for (variant, value) in values {
        by_variant
            .entry(variant.clone())
            .or_insert_with(|| {
                first_seen.push(variant);
                Vec::new()
            })
            .push(value);
    }

    let declared = experiment.variant_names();
    let mut ordered: Vec<String> = declared
        .iter()
        .filter(|name| by_variant.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    ordered.extend(first_seen.into_iter().filter(|name| !declared.contains(&name.as_str())));

    ordered
        .into_iter()
        .filter_map(|name| by_variant.remove(&name).map(|vals| (name, vals)))
        .collect()
}

/// Relative gap between two means; 0 when both are zero
pub fn relative_improvement(mean_a: f64, mean_b: f64) -> f64 {
    let base = mean_a.max(mean_b);
    let base = if base > 0.0 { base } else { mean_a.abs().max(mean_b.abs()) };
    if base <= f64::EPSILON {
        return 0.0;
    }
    (mean_a - mean_b).abs() / base
}

fn recommend(significant: bool, p_value: f64, mean_a: f64, mean_b: f64, winner: Option<&str>) -> String {
    if !significant {
        return format!(
            "No significant difference found (p={:.3}). Continue testing or increase sample size.",
            p_value
        );
    }

    match winner {
        Some(winner) => format!(
            "Variant {} is significantly better (p={:.3}, {:.1}% improvement). Consider implementing this variant.",
            winner,
            p_value,
            relative_improvement(mean_a, mean_b) * 100.0
        ),
        None => format!(
            "Significant difference found (p={:.3}) but no clear winner. Review variant implementations.",
            p_value
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::experiment::{ExperimentEvent, NewExperiment, TestKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    struct Fixture {
        db: Arc<Database>,
        evaluator: SignificanceEvaluator,
        id: String,
    }

    async fn fixture(variants: &[&str]) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(
            ExperimentRegistry::load(db.clone(), ExperimentConfig::default())
                .await
                .unwrap(),
        );
        let id = registry
            .create(NewExperiment::new("x", variants, "score"))
            .await
            .unwrap();
        let evaluator = SignificanceEvaluator::new(db.clone(), registry, 0.05);
        Fixture { db, evaluator, id }
    }

    async fn insert(db: &Database, id: &str, variant: &str, values: &[f64]) {
        for value in values {
            db.insert_event(&ExperimentEvent {
                experiment_id: id.to_string(),
                user_id: "u".to_string(),
                variant: variant.to_string(),
                metric: "score".to_string(),
                value: *value,
                timestamp: Utc::now(),
                context: None,
            })
            .await
            .unwrap();
        }
    }

    #[test]
    fn test_relative_improvement_guards() {
        assert!((relative_improvement(0.8, 0.4) - 0.5).abs() < 1e-12);
        assert_eq!(relative_improvement(0.0, 0.0), 0.0);
        assert!(relative_improvement(-1.0, -2.0).is_finite());
    }

    #[tokio::test]
    async fn test_insufficient_data_keeps_partial_stats() {
        let f = fixture(&["control", "enhanced"]).await;
        insert(&f.db, &f.id, "control", &[1.0, 0.0, 1.0]).await;

        let result = f.evaluator.evaluate(&f.id).await.unwrap();
        assert_eq!(result.test, TestKind::None);
        assert!(!result.significant);
        assert!(result.winner.is_none());
        assert_eq!(result.variants.len(), 1);
        assert!(result.recommendation.starts_with("Insufficient data"));
        assert!(f.evaluator.latest_result(&f.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_separated_means_pick_higher_winner() {
        let f = fixture(&["control", "enhanced"]).await;
        let mut rng = StdRng::seed_from_u64(11);
        let low = Normal::new(5.0, 1.0).unwrap();
        let high = Normal::new(7.0, 1.0).unwrap();
        let control: Vec<f64> = (0..40).map(|_| low.sample(&mut rng)).collect();
        let enhanced: Vec<f64> = (0..40).map(|_| high.sample(&mut rng)).collect();
        insert(&f.db, &f.id, "control", &control).await;
        insert(&f.db, &f.id, "enhanced", &enhanced).await;

        let result = f.evaluator.evaluate(&f.id).await.unwrap();
        assert!(result.significant);
        assert!(result.p_value < 0.05);
        assert_eq!(result.winner.as_deref(), Some("enhanced"));
        assert!(result.recommendation.starts_with("Variant enhanced is significantly better"));
        assert!(f.db.has_result(&f.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_not_significant_recommendation() {
        let f = fixture(&["control", "enhanced"]).await;
        insert(&f.db, &f.id, "control", &[1.0, 0.0, 1.0, 0.0]).await;
        insert(&f.db, &f.id, "enhanced", &[0.0, 1.0, 1.0, 0.0]).await;

        let result = f.evaluator.evaluate(&f.id).await.unwrap();
        assert!(!result.significant);
        assert!(result.winner.is_none());
        assert!(result.recommendation.starts_with("No significant difference found"));
    }

    #[tokio::test]
    async fn test_first_two_declared_variants_compared() {
        let f = fixture(&["a", "b", "c"]).await;
        // Insert "c" first; declared order still decides
        insert(&f.db, &f.id, "c", &[9.0, 9.0, 9.0]).await;
        insert(&f.db, &f.id, "a", &[1.0, 1.0, 1.0]).await;

        let result = f.evaluator.evaluate(&f.id).await.unwrap();
        let names: Vec<&str> = result.variants.iter().map(|s| s.variant.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(result.winner.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_latest_result_survives_cache_loss() {
        let f = fixture(&["control", "enhanced"]).await;
        insert(&f.db, &f.id, "control", &[1.0, 2.0]).await;
        insert(&f.db, &f.id, "enhanced", &[2.0, 3.0]).await;
        let computed = f.evaluator.evaluate(&f.id).await.unwrap();

        f.evaluator.cache.write().await.clear();
        let stored = f.evaluator.latest_result(&f.id).await.unwrap().unwrap();
        assert!((stored.p_value - computed.p_value).abs() < 1e-12);
        assert!(f.evaluator.latest_result("missing").await.is_err());
    }
}
