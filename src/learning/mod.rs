//! Continuous learning for the mood predictor
//!
//! Labeled samples flow into a rolling buffer and an unbounded log. The
//! retrain scheduler watches the log and, when its policy allows, fits a
//! candidate model off the request path and promotes it if it beats the
//! active model by a margin.

pub mod features;
pub mod buffer;
pub mod model;
pub mod trainer;
pub mod registry;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use buffer::LearningBuffer;
pub use features::FeatureMap;
pub use model::MoodModel;
pub use registry::ModelRegistry;
pub use scheduler::RetrainScheduler;
pub use trainer::{BaselineAccuracy, ExactMatchEvaluator, ForestTrainer, ModelEvaluator, ModelTrainer, ToleranceWindow};

/// Model kind managed by the registry
pub const MOOD_MODEL_KIND: &str = "mood_predictor";

/// Where a sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    MoodEntry,
    Feedback,
    Prediction,
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleKind::MoodEntry => write!(f, "mood_entry"),
            SampleKind::Feedback => write!(f, "feedback"),
            SampleKind::Prediction => write!(f, "prediction"),
        }
    }
}

impl std::str::FromStr for SampleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mood_entry" => Ok(SampleKind::MoodEntry),
            "feedback" => Ok(SampleKind::Feedback),
            "prediction" => Ok(SampleKind::Prediction),
            other => Err(format!("unknown sample kind: {}", other)),
        }
    }
}

/// One labeled training sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSample {
    pub user_id: String,
    pub features: FeatureMap,
    /// Observed mood (ordinal 1-10)
    pub target: f64,
    /// What the serving model predicted for this entry, if anything
    pub prediction: Option<f64>,
    pub confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub kind: SampleKind,
}

impl LearningSample {
    pub fn new(user_id: impl Into<String>, features: FeatureMap, target: f64) -> Self {
        Self {
            user_id: user_id.into(),
            features,
            target,
            prediction: None,
            confidence: None,
            timestamp: Utc::now(),
            kind: SampleKind::MoodEntry,
        }
    }

    pub fn with_prediction(mut self, prediction: f64, confidence: f64) -> Self {
        self.prediction = Some(prediction);
        self.confidence = Some(confidence);
        self
    }

    pub fn with_kind(mut self, kind: SampleKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A persisted, promotable model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version_id: String,
    pub model_kind: String,
    /// Candidate accuracy measured when the version was trained
    pub accuracy: f64,
    pub created_at: DateTime<Utc>,
    pub artifact_path: PathBuf,
    pub is_active: bool,
}

/// One retrain attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainLogEntry {
    /// Set only when the attempt promoted a version
    pub version_id: Option<String>,
    pub accuracy_improvement: f64,
    pub samples_used: usize,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// What a retrain attempt did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetrainOutcome {
    Promoted {
        version_id: String,
        accuracy: f64,
        improvement: f64,
        samples_used: usize,
    },
    /// Candidate trained fine but did not clear the improvement margin
    NotPromoted {
        accuracy: f64,
        improvement: f64,
        samples_used: usize,
    },
    InsufficientData {
        available: usize,
        required: usize,
    },
    /// Another retrain was already in flight
    Busy,
    Failed {
        error: String,
    },
}

impl RetrainOutcome {
    pub fn is_promoted(&self) -> bool {
        matches!(self, RetrainOutcome::Promoted { .. })
    }
}

/// Retrain scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Retraining,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Retraining => write!(f, "retraining"),
        }
    }
}

/// Output of the active model for one feature mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub mood: f64,
    /// Probability of the predicted class
    pub confidence: f64,
    /// Probability per mood class
    pub probabilities: BTreeMap<i64, f64>,
    pub model_version: String,
}

/// Snapshot of the learning subsystem for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningInsights {
    pub total_samples: usize,
    /// Samples logged in the last 7 days
    pub recent_samples: usize,
    pub model_versions: Vec<ModelVersion>,
    pub retraining_history: Vec<RetrainLogEntry>,
    pub last_retrain: Option<DateTime<Utc>>,
    pub buffer_size: usize,
    pub pending_samples: usize,
    pub state: SchedulerState,
    pub active_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_kind_roundtrip() {
        for kind in [SampleKind::MoodEntry, SampleKind::Feedback, SampleKind::Prediction] {
            assert_eq!(kind.to_string().parse::<SampleKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<SampleKind>().is_err());
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(RetrainOutcome::Busy).unwrap();
        assert_eq!(json["outcome"], "busy");
    }
}
