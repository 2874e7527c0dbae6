//! CLI interface for moodlab

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{self, Config};
use crate::context::LabContext;
use crate::experiment::NewExperiment;
use crate::learning::{FeatureMap, LearningSample, SampleKind};

#[derive(Parser)]
#[command(name = "moodlab")]
#[command(about = "Mood experiments and continuous model retraining", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to config.toml (default: platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log state transitions at info level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage A/B experiments
    Experiment {
        #[command(subcommand)]
        command: ExperimentCommands,
    },
    /// Feed and inspect the continuous-learning pipeline
    Learn {
        #[command(subcommand)]
        command: LearnCommands,
    },
    /// Score a feature mapping with the active model
    Predict {
        /// Feature mapping as a JSON object
        #[arg(short, long)]
        features: String,
    },
    /// Run the continuous-learning loop until Ctrl+C
    Serve,
    /// Show or initialize the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ExperimentCommands {
    /// Create a new active experiment
    Create {
        /// Human-readable name
        name: String,
        /// Variant names, comma separated (at least two)
        #[arg(long, value_delimiter = ',', required = true)]
        variants: Vec<String>,
        /// Metric whose values decide the winner
        #[arg(short, long)]
        metric: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Planned duration (default from config)
        #[arg(long)]
        duration_days: Option<i64>,
        /// Explicit experiment id (default: random)
        #[arg(long)]
        id: Option<String>,
    },
    /// Assign a user to a variant
    Assign { experiment_id: String, user_id: String },
    /// Record an outcome event for an assigned user
    Record {
        experiment_id: String,
        user_id: String,
        metric: String,
        value: f64,
        /// Free-form JSON context
        #[arg(long)]
        context: Option<String>,
    },
    /// Run the significance test
    Evaluate { experiment_id: String },
    /// Assignment and event counts per variant
    Status { experiment_id: String },
    /// List experiments
    List {
        /// Include paused and completed experiments
        #[arg(short, long)]
        all: bool,
    },
    /// Stop accepting new assignments
    Pause { experiment_id: String },
    /// Accept assignments again
    Resume { experiment_id: String },
    /// Close the experiment for good
    Complete { experiment_id: String },
}

#[derive(Subcommand)]
enum LearnCommands {
    /// Log a labeled sample (may trigger a retrain)
    Add {
        #[arg(short, long)]
        user: String,
        /// Observed mood
        #[arg(short, long)]
        target: f64,
        /// Feature mapping as a JSON object
        #[arg(short, long, default_value = "{}")]
        features: String,
        /// Prediction served for this entry
        #[arg(long)]
        prediction: Option<f64>,
        #[arg(long, requires = "prediction")]
        confidence: Option<f64>,
        #[arg(long, default_value = "mood_entry")]
        kind: SampleKind,
    },
    /// Retrain now, ignoring threshold and cooldown
    Retrain,
    /// Sample counts, versions and retraining history
    Insights,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_features(raw: &str) -> Result<FeatureMap> {
    serde_json::from_str(raw).context("Features must be a JSON object")
}

async fn open_context(path: Option<&Path>) -> Result<LabContext> {
    let config = Config::load(path)?;
    LabContext::open(config).await
}

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Experiment { command } => run_experiment(&open_context(config_path).await?, command).await?,
        Commands::Learn { command } => run_learn(&open_context(config_path).await?, command).await?,
        Commands::Predict { features } => {
            let ctx = open_context(config_path).await?;
            let prediction = ctx.models.predict(&parse_features(&features)?).await?;
            print_json(&prediction)?;
        }
        Commands::Serve => {
            let ctx = open_context(config_path).await?;
            if !ctx.scheduler.start_continuous_learning().await {
                bail!("Continuous learning is already running");
            }
            println!(
                "Continuous learning running (poll every {}s). Press Ctrl+C to stop.",
                ctx.config.learning.poll_interval_secs
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            ctx.scheduler.stop_continuous_learning().await;
            if let Some(outcome) = ctx.scheduler.wait_idle().await {
                print_json(&outcome)?;
            }
        }
        Commands::Config { command } => run_config(config_path, &command)?,
    }

    Ok(())
}

async fn run_experiment(ctx: &LabContext, command: ExperimentCommands) -> Result<()> {
    match command {
        ExperimentCommands::Create {
            name,
            variants,
            metric,
            description,
            duration_days,
            id,
        } => {
            let names: Vec<&str> = variants.iter().map(String::as_str).collect();
            let mut request = NewExperiment::new(name, &names, metric).with_description(description);
            if let Some(days) = duration_days {
                request = request.with_duration_days(days);
            }
            if let Some(id) = id {
                request = request.with_id(id);
            }
            let id = ctx.experiments.create(request).await?;
            print_json(&ctx.experiments.get(&id).await?)?;
        }
        ExperimentCommands::Assign { experiment_id, user_id } => {
            let variant = ctx.assigner.assign(&experiment_id, &user_id).await?;
            print_json(&serde_json::json!({
                "experiment_id": experiment_id,
                "user_id": user_id,
                "variant": variant,
            }))?;
        }
        ExperimentCommands::Record {
            experiment_id,
            user_id,
            metric,
            value,
            context,
        } => {
            let context = context
                .map(|raw| serde_json::from_str(&raw).context("Context must be valid JSON"))
                .transpose()?;
            match ctx
                .ledger
                .record_event(&experiment_id, &user_id, &metric, value, context)
                .await?
            {
                Some(event) => print_json(&event)?,
                None => eprintln!("Event not recorded: experiment inactive or user not assigned"),
            }
        }
        ExperimentCommands::Evaluate { experiment_id } => {
            print_json(&ctx.evaluator.evaluate(&experiment_id).await?)?;
        }
        ExperimentCommands::Status { experiment_id } => {
            print_json(&ctx.experiments.status(&experiment_id).await?)?;
        }
        ExperimentCommands::List { all } => {
            let experiments = if all {
                ctx.experiments.list_all().await
            } else {
                ctx.experiments.list_active().await
            };
            print_json(&experiments)?;
        }
        ExperimentCommands::Pause { experiment_id } => {
            print_json(&ctx.experiments.pause(&experiment_id).await?)?;
        }
        ExperimentCommands::Resume { experiment_id } => {
            print_json(&ctx.experiments.resume(&experiment_id).await?)?;
        }
        ExperimentCommands::Complete { experiment_id } => {
            print_json(&ctx.experiments.complete(&experiment_id).await?)?;
        }
    }
    Ok(())
}

async fn run_learn(ctx: &LabContext, command: LearnCommands) -> Result<()> {
    match command {
        LearnCommands::Add {
            user,
            target,
            features,
            prediction,
            confidence,
            kind,
        } => {
            let mut sample = LearningSample::new(user, parse_features(&features)?, target).with_kind(kind);
            if let Some(prediction) = prediction {
                sample = sample.with_prediction(prediction, confidence.unwrap_or(0.0));
            }

            let scheduled = ctx.scheduler.add_sample(sample).await?;
            // A one-shot process must not exit under its own worker
            let outcome = if scheduled { ctx.scheduler.wait_idle().await } else { None };
            print_json(&serde_json::json!({
                "retrain_scheduled": scheduled,
                "pending_samples": ctx.scheduler.pending_samples().await?,
                "outcome": outcome,
            }))?;
        }
        LearnCommands::Retrain => {
            print_json(&ctx.scheduler.retrain_now().await)?;
        }
        LearnCommands::Insights => {
            print_json(&ctx.scheduler.insights().await?)?;
        }
    }
    Ok(())
}

fn run_config(path: Option<&Path>, command: &ConfigCommands) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config::config_path()?,
    };

    match command {
        ConfigCommands::Show => {
            let config = Config::load(Some(&path))?;
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!("Config file already exists at {} (use --force to overwrite)", path.display());
            }
            Config::default().save_to(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_create_with_variant_list() {
        let cli = Cli::try_parse_from([
            "moodlab",
            "-v",
            "experiment",
            "create",
            "Prompt wording",
            "--variants",
            "control,warm",
            "--metric",
            "mood_improvement",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Experiment {
                command: ExperimentCommands::Create { variants, metric, .. },
            } => {
                assert_eq!(variants, vec!["control", "warm"]);
                assert_eq!(metric, "mood_improvement");
            }
            _ => panic!("expected experiment create"),
        }
    }

    #[test]
    fn test_rejects_unknown_sample_kind() {
        let parsed = Cli::try_parse_from(["moodlab", "learn", "add", "-u", "u1", "-t", "7", "--kind", "guess"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_features_must_be_object() {
        assert!(parse_features(r#"{"polarity": 0.4}"#).is_ok());
        assert!(parse_features("[1, 2]").is_err());
    }
}
