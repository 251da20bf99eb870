//! Fuserate CLI - train and evaluate the multi-modal rating predictor.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fuserate_cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("fuserate=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(cmd) => cmd.run()?,
        Commands::Evaluate(cmd) => cmd.run()?,
    }

    info!("done");
    Ok(())
}
