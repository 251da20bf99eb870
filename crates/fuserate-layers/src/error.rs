//! Error types for the fuserate-layers crate.

use thiserror::Error;

/// Error type for layer operations.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Shape mismatch between expected and actual tensor shapes.
    ///
    /// Also raised when a declared true length exceeds the padded dimension
    /// it is supposed to index into; that condition silently truncates output
    /// if tolerated, so it is always fatal.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected shape
        expected: Vec<usize>,
        /// The actual shape that was provided
        actual: Vec<usize>,
    },

    /// Invalid input dimension for the layer.
    #[error("Invalid input dimension: expected {expected}, got {actual}")]
    InvalidInputDimension {
        /// The expected input dimension
        expected: usize,
        /// The actual input dimension
        actual: usize,
    },

    /// A true length/count exceeds the padded extent it must fit in.
    #[error("Length overflow: true length {length} exceeds padded extent {padded}")]
    LengthOverflow {
        /// The declared true length
        length: usize,
        /// The padded extent the length must not exceed
        padded: usize,
    },

    /// Error during forward pass computation.
    #[error("Forward pass error: {message}")]
    ForwardError {
        /// Description of the forward pass error
        message: String,
    },

    /// Error during backward pass computation.
    #[error("Backward pass error: {message}")]
    BackwardError {
        /// Description of the backward pass error
        message: String,
    },

    /// Configuration error for the layer.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration error
        message: String,
    },

    /// Embedding lookup error.
    #[error("Embedding lookup error: {message}")]
    EmbeddingError {
        /// Description of the embedding error
        message: String,
    },
}

/// Result type alias for layer operations.
pub type LayerResult<T> = Result<T, LayerError>;
