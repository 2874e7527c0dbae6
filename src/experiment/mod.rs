//! Controlled experiments over recommendation strategies
//!
//! Provides:
//! - Experiment lifecycle (create, pause, resume, complete)
//! - Deterministic hash-based user to variant assignment
//! - An append-only ledger of outcome events
//! - On-demand significance testing of the success metric

pub mod registry;
pub mod assigner;
pub mod ledger;
pub mod evaluator;
pub mod stats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use registry::{ExperimentRegistry, NewExperiment};
pub use assigner::{VariantAssigner, bucket_for};
pub use ledger::EventLedger;
pub use evaluator::SignificanceEvaluator;

/// Experiment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Active,
    Paused,
    Completed,
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentStatus::Active => write!(f, "active"),
            ExperimentStatus::Paused => write!(f, "paused"),
            ExperimentStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ExperimentStatus::Active),
            "paused" => Ok(ExperimentStatus::Paused),
            "completed" => Ok(ExperimentStatus::Completed),
            other => Err(format!("unknown experiment status: {}", other)),
        }
    }
}

/// One arm of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Variant {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// A controlled experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Variants in declared order; assignment indexes into this list
    pub variants: Vec<Variant>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: ExperimentStatus,
    /// Event type aggregated to judge the experiment
    pub success_metric: String,
    pub min_sample_size: u32,
    pub confidence_level: f64,
}

impl Experiment {
    pub fn is_active(&self) -> bool {
        self.status == ExperimentStatus::Active
    }

    pub fn variant_names(&self) -> Vec<&str> {
        self.variants.iter().map(|v| v.name.as_str()).collect()
    }
}

/// Sticky (experiment, user) -> variant mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub experiment_id: String,
    pub user_id: String,
    pub variant: String,
    pub assigned_at: DateTime<Utc>,
}

/// A single outcome event, the source of truth for aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_id: String,
    pub user_id: String,
    pub variant: String,
    /// Metric name (event type)
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Summary statistics of one variant's metric values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant: String,
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub count: usize,
}

/// Which hypothesis test produced the p-value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Fewer than two variants with data; nothing was tested
    None,
    /// Two-sample Student t-test (small samples)
    TTest,
    /// z-test on the difference of means (large samples)
    ZTest,
}

/// Materialized view of an experiment's outcome, recomputed on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub experiment_id: String,
    /// Per-variant statistics in declared variant order (variants with data only)
    pub variants: Vec<VariantStats>,
    pub test: TestKind,
    pub significant: bool,
    pub p_value: f64,
    /// 95% interval on mean(first) - mean(second) of the compared pair
    pub confidence_interval: (f64, f64),
    pub winner: Option<String>,
    pub recommendation: String,
    pub computed_at: DateTime<Utc>,
}

impl ExperimentResult {
    /// Result returned when fewer than two variants have data
    pub fn insufficient(experiment_id: &str, variants: Vec<VariantStats>, reason: &str) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            variants,
            test: TestKind::None,
            significant: false,
            p_value: 1.0,
            confidence_interval: (0.0, 0.0),
            winner: None,
            recommendation: format!("Insufficient data: {}", reason),
            computed_at: Utc::now(),
        }
    }

    pub fn stats_for(&self, variant: &str) -> Option<&VariantStats> {
        self.variants.iter().find(|s| s.variant == variant)
    }
}

/// Per-variant counters in a status report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantSummary {
    pub assignments: usize,
    pub events: usize,
    pub avg_value: Option<f64>,
}

/// Read-only projection of an experiment joined with assignment and event counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentStatusReport {
    pub experiment_id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub success_metric: String,
    pub variants: HashMap<String, VariantSummary>,
    pub has_results: bool,
    /// Every variant with data has at least `min_sample_size` events
    pub ready: bool,
}
