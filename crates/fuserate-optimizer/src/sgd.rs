//! Stochastic Gradient Descent (SGD) optimizer.

use crate::{Optimizer, OptimizerConfig, OptimizerError};
use serde::{Deserialize, Serialize};

/// Stochastic Gradient Descent optimizer.
///
/// Updates parameters using the formula:
/// `param = param - learning_rate * gradient`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    learning_rate: f32,
    /// Configuration used to create this optimizer.
    config: OptimizerConfig,
}

impl Sgd {
    /// Creates a new SGD optimizer with the given learning rate.
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        let config = OptimizerConfig::Sgd { learning_rate };
        Self {
            learning_rate,
            config,
        }
    }
}

impl Optimizer for Sgd {
    fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        match config {
            OptimizerConfig::Sgd { learning_rate } => Ok(Self {
                learning_rate,
                config,
            }),
            _ => Err(OptimizerError::ConfigMismatch {
                expected: "Sgd".to_string(),
                got: config.name().to_string(),
            }),
        }
    }

    fn apply_gradients(&mut self, params: &mut [f32], gradients: &[f32]) {
        for (p, g) in params.iter_mut().zip(gradients.iter()) {
            *p -= self.learning_rate * g;
        }
    }

    fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_basic_update() {
        let mut sgd = Sgd::with_learning_rate(0.1);

        let mut params = vec![1.0, 2.0, 3.0];
        let gradients = vec![1.0, 1.0, 1.0];

        sgd.apply_gradients(&mut params, &gradients);

        assert!((params[0] - 0.9).abs() < 1e-6);
        assert!((params[1] - 1.9).abs() < 1e-6);
        assert!((params[2] - 2.9).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_zero_gradient() {
        let mut sgd = Sgd::with_learning_rate(0.1);

        let mut params = vec![1.0, 2.0];
        sgd.apply_gradients(&mut params, &[0.0, 0.0]);

        assert_eq!(params, vec![1.0, 2.0]);
    }
}
