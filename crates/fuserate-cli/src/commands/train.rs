//! Train command implementation.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use fuserate_data::{SampleSet, WordEmbeddings};
use fuserate_model::{ModelConfig, RatingModel};
use fuserate_optimizer::OptimizerConfig;
use fuserate_training::{Trainer, TrainerConfig};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Optimizer selection for the command line.
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// Train a model on a sample file
///
/// Reads a JSON array of samples plus a pretrained word-embedding text file,
/// fits the model, and writes the best-validation checkpoint and the model
/// configuration into the model directory.
///
/// # Example
///
/// ```bash
/// fuserate train \
///     --model-dir /path/to/model \
///     --samples train.json \
///     --embeddings glove.txt \
///     --epochs 20 --batch-size 32
/// ```
#[derive(Args, Debug, Clone)]
pub struct TrainCommand {
    /// Directory to save the checkpoint and model configuration
    #[arg(long, short = 'd', env = "FUSERATE_MODEL_DIR")]
    pub model_dir: PathBuf,

    /// JSON file holding the training samples
    #[arg(long, short = 's')]
    pub samples: PathBuf,

    /// Pretrained word-embedding text file (token followed by components)
    #[arg(long, short = 'e')]
    pub embeddings: PathBuf,

    /// Number of training epochs
    #[arg(long, default_value = "20")]
    pub epochs: usize,

    /// Batch size for training
    #[arg(long, short = 'b', default_value = "32")]
    pub batch_size: usize,

    /// Learning rate
    #[arg(long, default_value = "0.001")]
    pub learning_rate: f32,

    /// Optimizer algorithm
    #[arg(long, value_enum, default_value = "adam")]
    pub optimizer: OptimizerKind,

    /// Number of simulated devices for data-parallel batches
    #[arg(long, default_value = "1")]
    pub devices: usize,

    /// Fraction of samples held out for validation
    #[arg(long, default_value = "0.1")]
    pub val_fraction: f32,

    /// Epochs without validation improvement before stopping
    #[arg(long, default_value = "5")]
    pub patience: usize,

    /// GRU hidden size
    #[arg(long, default_value = "64")]
    pub gru_hidden: usize,

    /// Attention projection size
    #[arg(long, default_value = "32")]
    pub att_dim: usize,

    /// Shared latent dimension
    #[arg(long, default_value = "32")]
    pub latent_dim: usize,

    /// Backbone feature dimension
    #[arg(long, default_value = "32")]
    pub photo_feature_dim: usize,

    /// Photo edge length in pixels
    #[arg(long, default_value = "64")]
    pub photo_size: usize,

    /// Seed for initialization and shuffling
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

impl TrainCommand {
    pub fn run(&self) -> Result<()> {
        let vocab = WordEmbeddings::load(&self.embeddings)
            .with_context(|| format!("loading embeddings from {}", self.embeddings.display()))?;
        let samples = SampleSet::from_json_file(&self.samples)
            .with_context(|| format!("loading samples from {}", self.samples.display()))?;
        info!(
            samples = samples.len(),
            vocab = vocab.vocab_size(),
            "loaded training data"
        );

        let model_config = ModelConfig {
            gru_hidden: self.gru_hidden,
            att_dim: self.att_dim,
            latent_dim: self.latent_dim,
            photo_feature_dim: self.photo_feature_dim,
            num_users: samples.num_users(),
            num_items: samples.num_items(),
            seed: self.seed,
        };

        fs::create_dir_all(&self.model_dir)
            .with_context(|| format!("creating {}", self.model_dir.display()))?;
        let config_path = self.model_dir.join(super::MODEL_CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(&model_config)?)
            .with_context(|| format!("writing {}", config_path.display()))?;

        let optimizer = match self.optimizer {
            OptimizerKind::Sgd => OptimizerConfig::Sgd {
                learning_rate: self.learning_rate,
            },
            OptimizerKind::Adam => OptimizerConfig::adam(self.learning_rate),
        };
        let trainer_config = TrainerConfig::new(self.epochs, self.batch_size)
            .with_num_devices(self.devices)
            .with_optimizer(optimizer)
            .with_val_fraction(self.val_fraction)
            .with_early_stop_patience(self.patience)
            .with_photo_size(self.photo_size)
            .with_seed(self.seed)
            .with_checkpoint_path(self.model_dir.join(super::CHECKPOINT_FILE));

        let model = RatingModel::new(model_config, vocab.weights().clone())?;
        let mut trainer = Trainer::new(model, trainer_config)?;
        let report = trainer.fit(samples, &vocab)?;

        info!(
            epochs_run = report.epochs_run,
            best_epoch = report.best_epoch,
            best_val_mse = report.best_val_mse,
            final_train_mse = report.final_train_mse,
            "training finished"
        );
        Ok(())
    }
}
