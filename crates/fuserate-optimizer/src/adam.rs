//! Adam optimizer.
//!
//! Adam (Adaptive Moment Estimation) maintains exponential moving averages
//! of both the gradients (first moment) and squared gradients (second
//! moment), with bias correction on each.

use crate::{Optimizer, OptimizerConfig, OptimizerError};
use serde::{Deserialize, Serialize};

/// Adam optimizer with adaptive learning rates and momentum.
///
/// Updates parameters using the formula:
/// ```text
/// m = beta1 * m + (1 - beta1) * gradient
/// v = beta2 * v + (1 - beta2) * gradient^2
/// m_hat = m / (1 - beta1^t)
/// v_hat = v / (1 - beta2^t)
/// param = param - learning_rate * m_hat / (sqrt(v_hat) + epsilon)
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    /// First moment estimates, sized lazily on first use.
    m: Vec<f32>,
    /// Second moment estimates.
    v: Vec<f32>,
    /// Current timestep for bias correction.
    t: u64,
    /// Configuration used to create this optimizer.
    config: OptimizerConfig,
}

impl Adam {
    /// Creates a new Adam optimizer with the given parameters.
    pub fn with_params(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        let config = OptimizerConfig::Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        };
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
            config,
        }
    }

    /// Returns the current timestep.
    pub fn timestep(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        match config {
            OptimizerConfig::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Ok(Self {
                learning_rate,
                beta1,
                beta2,
                epsilon,
                m: Vec::new(),
                v: Vec::new(),
                t: 0,
                config,
            }),
            _ => Err(OptimizerError::ConfigMismatch {
                expected: "Adam".to_string(),
                got: config.name().to_string(),
            }),
        }
    }

    fn apply_gradients(&mut self, params: &mut [f32], gradients: &[f32]) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
        }

        self.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, (p, g)) in params.iter_mut().zip(gradients.iter()).enumerate() {
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;

            let m_hat = self.m[i] / bias_correction1;
            let v_hat = self.v[i] / bias_correction2;

            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
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
    fn test_adam_basic_update() {
        let mut adam = Adam::with_params(0.1, 0.9, 0.999, 1e-8);

        let mut params = vec![1.0, 2.0, 3.0];
        let gradients = vec![1.0, 1.0, 1.0];

        adam.apply_gradients(&mut params, &gradients);

        assert!(params[0] < 1.0);
        assert!(params[1] < 2.0);
        assert!(params[2] < 3.0);
    }

    #[test]
    fn test_adam_first_step_magnitude() {
        // With bias correction the very first step is close to the
        // learning rate for any nonzero gradient.
        let mut adam = Adam::with_params(0.01, 0.9, 0.999, 1e-8);

        let mut params = vec![0.0];
        adam.apply_gradients(&mut params, &[0.5]);

        assert!((params[0] + 0.01).abs() < 1e-4);
        assert_eq!(adam.timestep(), 1);
    }

    #[test]
    fn test_adam_converges_on_quadratic() {
        // Minimize f(x) = x^2 from x = 1.0
        let mut adam = Adam::with_params(0.1, 0.9, 0.999, 1e-8);
        let mut params = vec![1.0f32];

        for _ in 0..200 {
            let grad = vec![2.0 * params[0]];
            adam.apply_gradients(&mut params, &grad);
        }

        assert!(params[0].abs() < 0.05, "x = {}", params[0]);
    }
}
