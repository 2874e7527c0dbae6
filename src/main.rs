//! Moodlab - operator CLI
//!
//! Runs experiments and the continuous-learning pipeline against the local store.

use clap::Parser;
use moodlab::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // WARN by default; RUST_LOG overrides, -v raises moodlab itself to INFO
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());
    if cli.verbose {
        filter = filter.add_directive("moodlab=info".parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run(cli).await
}
