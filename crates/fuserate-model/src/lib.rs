//! The fuserate multi-modal rating model.
//!
//! Three signals feed one rating prediction:
//!
//! - [`review::ReviewNetwork`] encodes the user's review history and the
//!   item's reviews with a shared sentence GRU and attention pooling.
//! - [`photo::PhotoNetwork`] runs item photos through a frozen convolutional
//!   backbone and gates them with queries derived from the text latents.
//! - [`fusion::FusionHead`] crosses the text, visual, and matrix-
//!   factorization latents elementwise and reduces them to a scalar rating.
//!
//! [`model::RatingModel`] wires the three together; [`checkpoint`] persists
//! the full state dict as gzipped JSON.

pub mod checkpoint;
pub mod error;
pub mod fusion;
pub mod model;
pub mod photo;
pub mod review;

pub use checkpoint::CheckpointMetadata;
pub use error::{ModelError, ModelResult};
pub use fusion::FusionHead;
pub use model::{ModelCache, ModelConfig, RatingModel};
pub use photo::{ConvBackbone, PhotoNetwork};
pub use review::ReviewNetwork;
