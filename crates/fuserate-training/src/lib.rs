//! Training and evaluation for the fuserate rating model.
//!
//! - [`trainer::Trainer`] - the epoch loop: shuffle, batch, step, validate,
//!   checkpoint the best validation score, stop early when stale
//! - [`device::DeviceMesh`] - scatter/gather execution across simulated
//!   devices with a deterministic sequential backward
//! - [`metrics::MseRecorder`] - streaming mean squared error

pub mod device;
pub mod error;
pub mod metrics;
pub mod trainer;

pub use device::DeviceMesh;
pub use error::{TrainingError, TrainingResult};
pub use metrics::MseRecorder;
pub use trainer::{evaluate_batches, evaluate_samples, FitReport, Phase, Trainer, TrainerConfig};
