//! CLI command implementations.

mod evaluate;
mod train;

pub use evaluate::EvaluateCommand;
pub use train::TrainCommand;

/// File names inside the model directory.
pub(crate) const CHECKPOINT_FILE: &str = "best.ckpt.gz";
pub(crate) const MODEL_CONFIG_FILE: &str = "model_config.json";
