//! Weight initializers.
//!
//! Initialization draws from a caller-supplied seeded RNG so that model
//! construction is deterministic for a fixed seed.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Initialization strategies for layer parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Initializer {
    /// All zeros.
    Zeros,
    /// All ones.
    Ones,
    /// Xavier/Glorot normal: N(0, sqrt(2 / (fan_in + fan_out))).
    Xavier {
        /// Fan-in of the parameter.
        fan_in: usize,
        /// Fan-out of the parameter.
        fan_out: usize,
    },
    /// Normal distribution with explicit mean and standard deviation.
    Normal {
        /// Mean of the distribution.
        mean: f32,
        /// Standard deviation of the distribution.
        std: f32,
    },
}

impl Initializer {
    /// Creates a tensor of the given shape drawn from this initializer.
    pub fn initialize(&self, shape: &[usize], rng: &mut StdRng) -> Tensor {
        match *self {
            Initializer::Zeros => Tensor::zeros(shape),
            Initializer::Ones => Tensor::ones(shape),
            Initializer::Xavier { fan_in, fan_out } => {
                let std = (2.0 / (fan_in + fan_out) as f32).sqrt();
                randn(shape, 0.0, std, rng)
            }
            Initializer::Normal { mean, std } => randn(shape, mean, std, rng),
        }
    }
}

/// Draws a tensor from N(mean, std) using the Box-Muller transform.
fn randn(shape: &[usize], mean: f32, std: f32, rng: &mut StdRng) -> Tensor {
    let numel: usize = shape.iter().product();
    let data: Vec<f32> = (0..numel)
        .map(|_| {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            z * std + mean
        })
        .collect();
    Tensor::from_data(shape, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_zeros_ones() {
        let mut rng = StdRng::seed_from_u64(7);
        let z = Initializer::Zeros.initialize(&[3, 3], &mut rng);
        assert!(z.data().iter().all(|&x| x == 0.0));
        let o = Initializer::Ones.initialize(&[3], &mut rng);
        assert!(o.data().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_xavier_deterministic_for_seed() {
        let init = Initializer::Xavier {
            fan_in: 8,
            fan_out: 8,
        };
        let a = init.initialize(&[8, 8], &mut StdRng::seed_from_u64(42));
        let b = init.initialize(&[8, 8], &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
        assert!(a.data().iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_normal_roughly_centered() {
        let init = Initializer::Normal {
            mean: 0.0,
            std: 0.1,
        };
        let t = init.initialize(&[1000], &mut StdRng::seed_from_u64(1));
        let mean: f32 = t.data().iter().sum::<f32>() / 1000.0;
        assert!(mean.abs() < 0.02);
    }
}
