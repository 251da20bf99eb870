//! Error types for the rating model.

use fuserate_layers::LayerError;
use thiserror::Error;

/// Errors that can occur in model construction, inference, or persistence.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A layer rejected its input or gradient.
    #[error("layer error: {0}")]
    Layer(#[from] LayerError),

    /// A forward pass produced a non-finite value. Fatal: continuing would
    /// corrupt every parameter the gradient touches.
    #[error("numeric instability in {context}: non-finite values")]
    NumericInstability { context: String },

    /// Checkpoint contents do not match the model.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for model results.
pub type ModelResult<T> = Result<T, ModelError>;
