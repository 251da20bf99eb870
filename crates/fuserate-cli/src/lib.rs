//! Fuserate CLI Library
//!
//! Command-line interface for the fuserate rating predictor:
//!
//! - **Train**: fit the multi-modal model on a JSON sample file
//! - **Evaluate**: score a trained checkpoint against a sample file
//!
//! # Example
//!
//! ```bash
//! # Train a model
//! fuserate train --model-dir /path/to/model \
//!     --samples train.json --embeddings glove.txt --epochs 20
//!
//! # Evaluate a checkpoint
//! fuserate evaluate --model-dir /path/to/model --samples test.json \
//!     --embeddings glove.txt
//! ```

pub mod commands;

use clap::{Parser, Subcommand};

pub use commands::{EvaluateCommand, TrainCommand};

/// Fuserate - multi-modal review and photo rating prediction
#[derive(Parser, Debug)]
#[command(name = "fuserate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a model on a sample file
    Train(TrainCommand),

    /// Evaluate a trained checkpoint on a sample file
    Evaluate(EvaluateCommand),
}
