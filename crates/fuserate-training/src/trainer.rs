//! The epoch-driven training loop.
//!
//! Each epoch shuffles the training samples, rebuilds padded batches, and
//! runs one scatter / parallel-forward / sequential-backward step per batch.
//! The loss is mean squared error; with multiple devices the per-shard mean
//! losses are averaged, so the prediction gradient for a shard row is
//! `2 * (pred - rating) / (shard_len * num_shards)`.
//!
//! After every epoch the model is scored on a held-out validation split.
//! The best validation score is checkpointed and training stops early once
//! it fails to improve for a configured number of epochs.

use crate::device::DeviceMesh;
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::MseRecorder;
use fuserate_data::{Batch, BatchBuilder, Sample, SampleSet, WordEmbeddings};
use fuserate_layers::{Parameterized, Tensor};
use fuserate_model::checkpoint::{self, CheckpointMetadata};
use fuserate_model::RatingModel;
use fuserate_optimizer::{create_optimizer, OptimizerConfig, OptimizerDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

/// Which pass the loop is running. Validation and test passes are
/// forward-only and never touch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Validating,
    Testing,
}

impl Phase {
    /// Returns the string name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Training => "training",
            Phase::Validating => "validating",
            Phase::Testing => "testing",
        }
    }
}

/// Training-loop configuration.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub num_devices: usize,
    pub optimizer: OptimizerConfig,
    /// Trailing fraction of the (shuffled) samples held out for validation.
    pub val_fraction: f32,
    /// Stop after this many epochs without validation improvement.
    pub early_stop_patience: usize,
    /// Where to write the best-so-far checkpoint, if anywhere.
    pub checkpoint_path: Option<PathBuf>,
    /// Photo edge length fed to the backbone.
    pub photo_size: usize,
    pub seed: u64,
}

impl TrainerConfig {
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self {
            epochs,
            batch_size,
            num_devices: 1,
            optimizer: OptimizerConfig::adam(1e-3),
            val_fraction: 0.1,
            early_stop_patience: 5,
            checkpoint_path: None,
            photo_size: 32,
            seed: 42,
        }
    }

    pub fn with_num_devices(mut self, num_devices: usize) -> Self {
        self.num_devices = num_devices;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_val_fraction(mut self, val_fraction: f32) -> Self {
        self.val_fraction = val_fraction;
        self
    }

    pub fn with_early_stop_patience(mut self, patience: usize) -> Self {
        self.early_stop_patience = patience;
        self
    }

    pub fn with_checkpoint_path(mut self, path: PathBuf) -> Self {
        self.checkpoint_path = Some(path);
        self
    }

    pub fn with_photo_size(mut self, photo_size: usize) -> Self {
        self.photo_size = photo_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Summary of a completed fit.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_val_mse: f64,
    pub final_train_mse: f64,
}

/// Drives training of a [`RatingModel`].
pub struct Trainer {
    model: RatingModel,
    config: TrainerConfig,
    mesh: DeviceMesh,
    /// One stateful optimizer per named trainable parameter.
    optimizers: HashMap<String, Box<dyn OptimizerDyn>>,
}

impl Trainer {
    pub fn new(model: RatingModel, config: TrainerConfig) -> TrainingResult<Self> {
        if config.epochs == 0 {
            return Err(TrainingError::Config("epochs must be positive".into()));
        }
        if config.batch_size == 0 {
            return Err(TrainingError::Config("batch size must be positive".into()));
        }
        let mesh = DeviceMesh::new(config.num_devices);
        Ok(Self {
            model,
            config,
            mesh,
            optimizers: HashMap::new(),
        })
    }

    pub fn model(&self) -> &RatingModel {
        &self.model
    }

    pub fn into_model(self) -> RatingModel {
        self.model
    }

    /// Trains on `samples`, holding out a validation split, and returns a
    /// summary. The model is left at its final-epoch parameters; the best
    /// validation parameters are in the checkpoint when a path is set.
    pub fn fit(
        &mut self,
        samples: SampleSet,
        vocab: &WordEmbeddings,
    ) -> TrainingResult<FitReport> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut shuffled = samples;
        shuffled.shuffle(&mut rng);
        let (mut train, val) = shuffled.split_off_fraction(self.config.val_fraction)?;

        let builder = BatchBuilder::new(self.config.batch_size, self.config.photo_size);

        let mut best_val_mse = f64::INFINITY;
        let mut best_epoch = 0;
        let mut stale_epochs = 0;
        let mut final_train_mse = 0.0;
        let mut epochs_run = 0;

        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();
            train.shuffle(&mut rng);

            // Batches stream from the builder; only the in-flight batch
            // holds decoded photo pixels.
            for batch in builder.batches(train.samples(), vocab)? {
                let batch = batch?;
                let loss = self.train_step(&batch)?;
                debug!(epoch, batch_len = batch.len(), loss, "step");
            }
            // Score the training split with the end-of-epoch parameters
            let train_mse = evaluate_samples(
                &self.model,
                &self.mesh,
                &builder,
                train.samples(),
                vocab,
                Phase::Training,
            )?;
            let val_mse = evaluate_samples(
                &self.model,
                &self.mesh,
                &builder,
                val.samples(),
                vocab,
                Phase::Validating,
            )?;
            final_train_mse = train_mse;
            epochs_run = epoch;

            info!(
                epoch,
                train_mse,
                val_mse,
                elapsed_s = epoch_start.elapsed().as_secs_f64(),
                "epoch complete"
            );

            if val_mse < best_val_mse {
                best_val_mse = val_mse;
                best_epoch = epoch;
                stale_epochs = 0;
                if let Some(path) = &self.config.checkpoint_path {
                    checkpoint::save(
                        path,
                        CheckpointMetadata {
                            epoch,
                            validation_mse: val_mse as f32,
                        },
                        self.model.state_dict(),
                    )?;
                }
            } else {
                stale_epochs += 1;
                if stale_epochs >= self.config.early_stop_patience {
                    info!(epoch, best_epoch, "early stop");
                    break;
                }
            }
        }

        Ok(FitReport {
            epochs_run,
            best_epoch,
            best_val_mse,
            final_train_mse,
        })
    }

    /// One optimization step over a single padded batch; returns its loss.
    pub fn train_step(&mut self, batch: &Batch) -> TrainingResult<f64> {
        self.model.zero_grads();

        let shards = self.mesh.forward_train(&self.model, batch)?;
        let num_shards = shards.len();

        // Mean of per-shard mean squared errors
        let mut loss = 0.0f64;
        for shard in &shards {
            let mut shard_loss = 0.0f64;
            for (p, y) in shard.pred.data().iter().zip(shard.batch.ratings.iter()) {
                let err = (p - y) as f64;
                shard_loss += err * err;
            }
            loss += shard_loss / shard.batch.len() as f64;
        }
        loss /= num_shards as f64;

        // Sequential backward in ascending shard order
        for shard in &shards {
            let scale = 2.0 / (shard.batch.len() * num_shards) as f32;
            let d_pred = Tensor::from_data(
                &[shard.batch.len()],
                shard
                    .pred
                    .data()
                    .iter()
                    .zip(shard.batch.ratings.iter())
                    .map(|(p, y)| scale * (p - y))
                    .collect(),
            );
            self.model.backward(&d_pred, &shard.cache)?;
        }

        self.apply_gradients();
        Ok(loss)
    }

    /// Applies every accumulated gradient through its parameter's optimizer.
    fn apply_gradients(&mut self) {
        let optimizers = &mut self.optimizers;
        let optimizer_config = &self.config.optimizer;
        self.model.visit_params_mut("", &mut |p| {
            if let Some(grad) = p.grad {
                let optimizer = optimizers
                    .entry(p.name.clone())
                    .or_insert_with(|| create_optimizer(optimizer_config.clone()));
                optimizer.apply_gradients(p.value.data_mut(), grad.data());
            }
        });
    }

}

/// Mean squared error of `model` over already-built `batches`, forward-only.
pub fn evaluate_batches(
    model: &RatingModel,
    mesh: &DeviceMesh,
    batches: &[Batch],
    phase: Phase,
) -> TrainingResult<f64> {
    let mut recorder = MseRecorder::new();
    for batch in batches {
        let pred = mesh.forward(model, batch)?;
        recorder.record(pred.data(), &batch.ratings);
    }
    finish_pass(recorder, phase)
}

/// Mean squared error of `model` over `samples`, forward-only, streaming
/// batches from `builder` so photo pixels never accumulate across batches.
pub fn evaluate_samples(
    model: &RatingModel,
    mesh: &DeviceMesh,
    builder: &BatchBuilder,
    samples: &[Sample],
    vocab: &WordEmbeddings,
    phase: Phase,
) -> TrainingResult<f64> {
    let mut recorder = MseRecorder::new();
    for batch in builder.batches(samples, vocab)? {
        let batch = batch?;
        let pred = mesh.forward(model, &batch)?;
        recorder.record(pred.data(), &batch.ratings);
    }
    finish_pass(recorder, phase)
}

fn finish_pass(recorder: MseRecorder, phase: Phase) -> TrainingResult<f64> {
    debug!(
        phase = phase.as_str(),
        samples = recorder.count(),
        mse = recorder.mse(),
        "evaluation pass"
    );
    Ok(recorder.mse())
}
