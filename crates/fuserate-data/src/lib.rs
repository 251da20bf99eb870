//! Data loading and batching for the fuserate rating model.
//!
//! This crate turns raw review samples into padded numeric batches:
//!
//! - [`dataset`] - The [`Sample`] record and [`SampleSet`] container
//! - [`vocab`] - Pretrained word embeddings and tokenization
//! - [`photos`] - Photo decoding into normalized pixel tensors
//! - [`batch`] - Padded [`Batch`] construction and device splitting
//!
//! Batches carry explicit padded extents and true lengths side by side, so
//! downstream encoders can mask padding and a batch can be split across
//! simulated devices without changing any padded dimension.

pub mod batch;
pub mod dataset;
pub mod error;
pub mod photos;
pub mod vocab;

pub use batch::{Batch, BatchBuilder, BatchIter, PhotoBatch, TokenBatch};
pub use dataset::{Sample, SampleSet};
pub use error::{DataError, DataResult};
pub use photos::PhotoLoader;
pub use vocab::WordEmbeddings;
