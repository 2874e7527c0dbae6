//! Configuration management
//!
//! Storage locations, experiment statistics parameters and the retraining
//! policy. Every field has a default so a partial config.toml is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database and model artifact locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Experiment statistics
    #[serde(default)]
    pub experiments: ExperimentConfig,
    /// Continuous learning policy
    #[serde(default)]
    pub learning: LearningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Directory holding serialized model artifacts
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
}

fn default_database_path() -> PathBuf {
    data_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("moodlab.db")
}

fn default_models_dir() -> PathBuf {
    data_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("models")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            models_dir: default_models_dir(),
        }
    }
}

impl StorageConfig {
    /// Both paths rooted under one directory (tests and throwaway runs)
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database_path: dir.join("moodlab.db"),
            models_dir: dir.join("models"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// p-value below which a difference is significant
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: f64,
    /// Events per variant before a status report calls the experiment ready
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u32,
    /// Recorded on each experiment; intervals are always reported at 95%
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    /// Duration used when `create` is not given one
    #[serde(default = "default_duration_days")]
    pub default_duration_days: i64,
}

fn default_significance_threshold() -> f64 {
    0.05
}

fn default_min_sample_size() -> u32 {
    100
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_duration_days() -> i64 {
    14
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            significance_threshold: default_significance_threshold(),
            min_sample_size: default_min_sample_size(),
            confidence_level: default_confidence_level(),
            default_duration_days: default_duration_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// New samples required before a retrain is considered
    #[serde(default = "default_retrain_threshold")]
    pub retrain_threshold: usize,
    /// Minimum accuracy gain for promoting a candidate
    #[serde(default = "default_min_accuracy_improvement")]
    pub min_accuracy_improvement: f64,
    /// Hours between promotions
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
    /// Rolling buffer size
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Logged predictions used to score the active model
    #[serde(default = "default_accuracy_window")]
    pub accuracy_window: usize,
    /// |target - prediction| counted as correct for the active model
    #[serde(default = "default_accuracy_tolerance")]
    pub accuracy_tolerance: f64,
    /// Share of samples held out to score a candidate (0.0 = in-sample)
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    /// Continuous loop poll interval (seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Poll interval after a loop error (seconds)
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_forest_trees")]
    pub forest_trees: usize,
    #[serde(default = "default_forest_max_depth")]
    pub forest_max_depth: usize,
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
    /// Seed for bootstrap sampling and the holdout shuffle
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_retrain_threshold() -> usize {
    50
}

fn default_min_accuracy_improvement() -> f64 {
    0.02
}

fn default_cooldown_hours() -> i64 {
    24
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_accuracy_window() -> usize {
    100
}

fn default_accuracy_tolerance() -> f64 {
    1.0
}

fn default_holdout_fraction() -> f64 {
    0.2
}

fn default_poll_interval_secs() -> u64 {
    3600
}

fn default_error_backoff_secs() -> u64 {
    300
}

fn default_forest_trees() -> usize {
    100
}

fn default_forest_max_depth() -> usize {
    10
}

fn default_min_samples_split() -> usize {
    5
}

fn default_min_samples_leaf() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            retrain_threshold: default_retrain_threshold(),
            min_accuracy_improvement: default_min_accuracy_improvement(),
            cooldown_hours: default_cooldown_hours(),
            buffer_capacity: default_buffer_capacity(),
            accuracy_window: default_accuracy_window(),
            accuracy_tolerance: default_accuracy_tolerance(),
            holdout_fraction: default_holdout_fraction(),
            poll_interval_secs: default_poll_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            forest_trees: default_forest_trees(),
            forest_max_depth: default_forest_max_depth(),
            min_samples_split: default_min_samples_split(),
            min_samples_leaf: default_min_samples_leaf(),
            seed: default_seed(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location when `None`.
    ///
    /// A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "moodlab", "moodlab")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "moodlab", "moodlab")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_policy() {
        let config = Config::default();
        assert_eq!(config.learning.retrain_threshold, 50);
        assert_eq!(config.learning.cooldown_hours, 24);
        assert_eq!(config.learning.buffer_capacity, 1000);
        assert!((config.learning.min_accuracy_improvement - 0.02).abs() < f64::EPSILON);
        assert!((config.experiments.significance_threshold - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[learning]\nretrain_threshold = 10\n").unwrap();
        assert_eq!(parsed.learning.retrain_threshold, 10);
        assert_eq!(parsed.learning.poll_interval_secs, 3600);
        assert_eq!(parsed.experiments.default_duration_days, 14);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.learning.error_backoff_secs, 300);

        let reloaded = Config::load(Some(&path)).unwrap();
        assert_eq!(reloaded.learning.seed, config.learning.seed);
    }
}
