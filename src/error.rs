//! Error taxonomy for the experiment and learning subsystems
//!
//! Request-facing operations return [`LabError`]. Insufficient data and
//! training failures are mostly surfaced as descriptive results instead
//! (see `ExperimentResult` and `RetrainOutcome`), so those variants only
//! appear where a caller explicitly asked for something that cannot exist.

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, LabError>;

#[derive(Debug, Error)]
pub enum LabError {
    /// Unknown experiment id
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    /// Experiment exists but does not accept new assignments
    #[error("experiment {id} is not active (status: {status})")]
    ExperimentNotActive { id: String, status: String },

    /// Creation or lifecycle request rejected
    #[error("invalid experiment: {0}")]
    InvalidExperiment(String),

    /// Unknown model version id
    #[error("model version not found: {0}")]
    VersionNotFound(String),

    /// Prediction requested before any model was promoted or loaded
    #[error("no active model for kind '{0}'")]
    NoActiveModel(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Fit or evaluation of a candidate model failed
    #[error("training failed: {0}")]
    Training(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// True for the NotFound family (experiment or model version)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LabError::ExperimentNotFound(_) | LabError::VersionNotFound(_)
        )
    }
}
