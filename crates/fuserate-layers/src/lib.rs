//! Neural network building blocks for the fuserate rating model.
//!
//! This crate provides the low-level pieces the multi-modal rating model is
//! assembled from: a dense [`tensor::Tensor`] type, parameter visitation for
//! optimizers and checkpoints, a fully connected [`dense::Dense`] layer, a
//! length-aware recurrent [`gru::GruEncoder`], the score/normalize/weighted-sum
//! [`attention::AttentionPool`] used for both sentence attention and photo
//! gating, and [`embedding::EmbeddingTable`] for word and matrix-factorization
//! embeddings.
//!
//! All forward passes are `&self` and return explicit cache values; backward
//! passes take `&mut self` plus the cache and accumulate gradients in the
//! layer. This keeps the forward fan-out across simulated devices free of
//! shared mutable state.

pub mod activation;
pub mod attention;
pub mod dense;
pub mod embedding;
pub mod error;
pub mod gru;
pub mod initializer;
pub mod params;
pub mod tensor;

pub use activation::Activation;
pub use attention::AttentionPool;
pub use dense::Dense;
pub use embedding::EmbeddingTable;
pub use error::{LayerError, LayerResult};
pub use gru::GruEncoder;
pub use initializer::Initializer;
pub use params::Parameterized;
pub use tensor::Tensor;
