//! Moodlab - Experiment & Continuous-Learning Library
//!
//! Two cooperating subsystems over one SQLite store:
//! - Experiments: deterministic variant assignment, an append-only event
//!   ledger and significance testing with winner recommendations
//! - Continuous learning: a rolling sample buffer, threshold and cooldown
//!   gated retraining in the background, and versioned model promotion
//!
//! # Example
//!
//! ```ignore
//! use moodlab::{Config, LabContext, NewExperiment};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = LabContext::open(Config::load(None)?).await?;
//!     let id = ctx
//!         .experiments
//!         .create(NewExperiment::new("Prompt wording", &["control", "warm"], "mood_improvement"))
//!         .await?;
//!     let variant = ctx.assigner.assign(&id, "user_42").await?;
//!     println!("user_42 -> {}", variant);
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod config;
pub mod storage;
pub mod experiment;
pub mod learning;
pub mod context;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use context::LabContext;
pub use error::{LabError, Result};

pub use experiment::{
    Experiment,
    ExperimentResult,
    ExperimentStatus,
    EventLedger,
    ExperimentRegistry,
    NewExperiment,
    SignificanceEvaluator,
    VariantAssigner,
};

pub use learning::{
    LearningSample,
    ModelRegistry,
    ModelVersion,
    Prediction,
    RetrainOutcome,
    RetrainScheduler,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Experiment & Continuous-Learning Library", NAME, VERSION)
}
