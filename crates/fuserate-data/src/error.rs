//! Error types for data loading and batching.

use thiserror::Error;

/// Errors that can occur while loading or batching data.
#[derive(Debug, Error)]
pub enum DataError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed sample file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed line in a pretrained embedding file.
    #[error("embedding parse error at line {line}: {message}")]
    EmbeddingParse { line: usize, message: String },

    /// A batch could not be formed from the given samples.
    #[error("batching error: {0}")]
    Batching(String),
}

/// Convenience alias for data results.
pub type DataResult<T> = Result<T, DataError>;
