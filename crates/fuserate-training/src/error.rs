//! Error types for the training loop.

use fuserate_data::DataError;
use fuserate_model::ModelError;
use thiserror::Error;

/// Errors that can occur during training or evaluation.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// The model rejected a batch or produced non-finite values.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Batching or dataset failure.
    #[error("data error: {0}")]
    Data(#[from] DataError),

    /// Invalid trainer configuration.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience alias for training results.
pub type TrainingResult<T> = Result<T, TrainingError>;
