//! Canonical feature order shared by training and prediction
//!
//! Feature extraction happens upstream; this module only turns a named
//! mapping into a fixed-order vector. Missing or non-numeric values become
//! 0.0 and booleans become 1.0/0.0. Any change to [`FEATURE_ORDER`] must
//! bump [`FEATURE_SCHEMA_VERSION`] so stale artifacts are rejected.

use serde_json::Value;
use std::collections::BTreeMap;

use super::LearningSample;
use super::trainer::TrainingSet;

/// Named features as supplied by the feature-engineering collaborator
pub type FeatureMap = BTreeMap<String, Value>;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_ORDER: [&str; 22] = [
    "emotion_count",
    "has_note",
    "hour",
    "day_of_week",
    "is_weekend",
    "emotion_happy",
    "emotion_sad",
    "emotion_anxious",
    "emotion_calm",
    "emotion_excited",
    "emotion_frustrated",
    "emotion_grateful",
    "emotion_lonely",
    "emotion_confident",
    "emotion_overwhelmed",
    "emotion_peaceful",
    "emotion_angry",
    "sentiment_positive",
    "sentiment_negative",
    "sentiment_neutral",
    "polarity",
    "subjectivity",
];

pub fn feature_count() -> usize {
    FEATURE_ORDER.len()
}

fn numeric(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}

/// Reorder a mapping into the canonical vector
pub fn to_vector(features: &FeatureMap) -> Vec<f64> {
    FEATURE_ORDER
        .iter()
        .map(|name| features.get(*name).map(numeric).unwrap_or(0.0))
        .collect()
}

/// Mood labels are ordinal; fractional targets round to the nearest class
pub fn target_class(target: f64) -> i64 {
    target.round() as i64
}

/// Vectors and class labels for a batch of samples
pub fn training_set(samples: &[LearningSample]) -> TrainingSet {
    TrainingSet {
        features: samples.iter().map(|s| to_vector(&s.features)).collect(),
        targets: samples.iter().map(|s| target_class(s.target)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vector_follows_canonical_order() {
        let mut features = FeatureMap::new();
        features.insert("subjectivity".into(), json!(0.25));
        features.insert("emotion_count".into(), json!(3));
        features.insert("unrelated".into(), json!(99));

        let vector = to_vector(&features);
        assert_eq!(vector.len(), feature_count());
        assert_eq!(vector[0], 3.0);
        assert_eq!(vector[21], 0.25);
        assert_eq!(vector.iter().sum::<f64>(), 3.25);
    }

    #[test]
    fn test_non_numeric_values_default_to_zero() {
        let mut features = FeatureMap::new();
        features.insert("has_note".into(), json!(true));
        features.insert("is_weekend".into(), json!(false));
        features.insert("hour".into(), json!("nine"));
        features.insert("polarity".into(), json!(null));

        let vector = to_vector(&features);
        assert_eq!(vector[1], 1.0);
        assert_eq!(vector[2], 0.0);
        assert_eq!(vector[4], 0.0);
        assert_eq!(vector[20], 0.0);
    }

    #[test]
    fn test_target_class_rounds() {
        assert_eq!(target_class(6.6), 7);
        assert_eq!(target_class(3.0), 3);
    }
}
