//! Parameter optimizers for the fuserate rating model.
//!
//! Each optimizer implements the [`Optimizer`] trait and updates one flat
//! parameter buffer in place. The trainer keeps one optimizer instance per
//! named parameter so that stateful algorithms track per-parameter moments.
//!
//! # Example
//!
//! ```
//! use fuserate_optimizer::{Optimizer, Sgd, OptimizerConfig};
//!
//! let config = OptimizerConfig::Sgd { learning_rate: 0.01 };
//! let mut optimizer = Sgd::new(config).unwrap();
//!
//! let mut params = vec![1.0, 2.0, 3.0];
//! let gradients = vec![0.1, 0.2, 0.3];
//!
//! optimizer.apply_gradients(&mut params, &gradients);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod adam;
mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

/// Errors that can occur when working with optimizers.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Configuration type does not match the optimizer type.
    #[error("Config mismatch: expected {expected}, got {got}")]
    ConfigMismatch { expected: String, got: String },

    /// Invalid configuration parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Configuration for the supported optimizer types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OptimizerConfig {
    /// Stochastic Gradient Descent configuration.
    Sgd {
        /// Learning rate for gradient updates.
        learning_rate: f32,
    },

    /// Adam configuration.
    Adam {
        /// Learning rate for gradient updates.
        learning_rate: f32,
        /// Exponential decay rate for first moment estimates.
        beta1: f32,
        /// Exponential decay rate for second moment estimates.
        beta2: f32,
        /// Small constant for numerical stability.
        epsilon: f32,
    },
}

impl OptimizerConfig {
    /// Adam with the conventional defaults at the given learning rate.
    pub fn adam(learning_rate: f32) -> Self {
        OptimizerConfig::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    /// Returns the name of the optimizer type.
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerConfig::Sgd { .. } => "Sgd",
            OptimizerConfig::Adam { .. } => "Adam",
        }
    }

    /// Returns the learning rate for the optimizer.
    pub fn learning_rate(&self) -> f32 {
        match self {
            OptimizerConfig::Sgd { learning_rate } => *learning_rate,
            OptimizerConfig::Adam { learning_rate, .. } => *learning_rate,
        }
    }
}

/// Trait for parameter optimizers.
pub trait Optimizer: Sized + Send {
    /// Creates a new optimizer from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::ConfigMismatch`] if the configuration
    /// variant does not match the optimizer type.
    fn new(config: OptimizerConfig) -> Result<Self, OptimizerError>;

    /// Applies gradients to update the parameter buffer in place.
    ///
    /// # Panics
    ///
    /// May panic if `params` and `gradients` have different lengths.
    fn apply_gradients(&mut self, params: &mut [f32], gradients: &[f32]);

    /// Returns a reference to the optimizer's configuration.
    fn config(&self) -> &OptimizerConfig;
}

/// Creates a boxed optimizer from the given configuration.
pub fn create_optimizer(config: OptimizerConfig) -> Box<dyn OptimizerDyn> {
    match &config {
        OptimizerConfig::Sgd { .. } => match Sgd::new(config) {
            Ok(opt) => Box::new(opt),
            Err(_) => unreachable!("Sgd accepts its own config variant"),
        },
        OptimizerConfig::Adam { .. } => match Adam::new(config) {
            Ok(opt) => Box::new(opt),
            Err(_) => unreachable!("Adam accepts its own config variant"),
        },
    }
}

/// Dynamic dispatch version of the [`Optimizer`] trait.
pub trait OptimizerDyn: Send {
    /// Applies gradients to update the parameter buffer in place.
    fn apply_gradients(&mut self, params: &mut [f32], gradients: &[f32]);

    /// Returns a reference to the optimizer's configuration.
    fn config(&self) -> &OptimizerConfig;
}

impl<T: Optimizer> OptimizerDyn for T {
    fn apply_gradients(&mut self, params: &mut [f32], gradients: &[f32]) {
        Optimizer::apply_gradients(self, params, gradients)
    }

    fn config(&self) -> &OptimizerConfig {
        Optimizer::config(self)
    }
}
