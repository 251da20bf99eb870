//! Evaluate command implementation.

use anyhow::{Context, Result};
use clap::Args;
use fuserate_data::{BatchBuilder, SampleSet, WordEmbeddings};
use fuserate_model::{checkpoint, ModelConfig, RatingModel};
use fuserate_training::{evaluate_samples, DeviceMesh, Phase};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Evaluate a trained checkpoint on a sample file
///
/// Rebuilds the model from the configuration written at training time,
/// loads the checkpoint parameters, and reports mean squared error over
/// the given samples.
///
/// # Example
///
/// ```bash
/// fuserate evaluate \
///     --model-dir /path/to/model \
///     --samples test.json \
///     --embeddings glove.txt
/// ```
#[derive(Args, Debug, Clone)]
pub struct EvaluateCommand {
    /// Directory holding the checkpoint and model configuration
    #[arg(long, short = 'd', env = "FUSERATE_MODEL_DIR")]
    pub model_dir: PathBuf,

    /// JSON file holding the evaluation samples
    #[arg(long, short = 's')]
    pub samples: PathBuf,

    /// Pretrained word-embedding text file used at training time
    #[arg(long, short = 'e')]
    pub embeddings: PathBuf,

    /// Batch size for evaluation
    #[arg(long, short = 'b', default_value = "32")]
    pub batch_size: usize,

    /// Number of simulated devices
    #[arg(long, default_value = "1")]
    pub devices: usize,

    /// Photo edge length in pixels
    #[arg(long, default_value = "64")]
    pub photo_size: usize,
}

impl EvaluateCommand {
    pub fn run(&self) -> Result<()> {
        let config_path = self.model_dir.join(super::MODEL_CONFIG_FILE);
        let config: ModelConfig = serde_json::from_str(
            &fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?,
        )?;

        let vocab = WordEmbeddings::load(&self.embeddings)
            .with_context(|| format!("loading embeddings from {}", self.embeddings.display()))?;
        let samples = SampleSet::from_json_file(&self.samples)
            .with_context(|| format!("loading samples from {}", self.samples.display()))?;

        let checkpoint_path = self.model_dir.join(super::CHECKPOINT_FILE);
        let (metadata, params) = checkpoint::load(&checkpoint_path)
            .with_context(|| format!("loading {}", checkpoint_path.display()))?;
        info!(
            epoch = metadata.epoch,
            validation_mse = metadata.validation_mse,
            "loaded checkpoint"
        );

        let mut model = RatingModel::new(config, vocab.weights().clone())?;
        model.load_state_dict(&params)?;

        let builder = BatchBuilder::new(self.batch_size, self.photo_size);
        let mesh = DeviceMesh::new(self.devices);
        let mse = evaluate_samples(&model, &mesh, &builder, samples.samples(), &vocab, Phase::Testing)?;

        info!(samples = samples.len(), mse, "evaluation complete");
        println!("mse: {mse:.6}");
        Ok(())
    }
}
