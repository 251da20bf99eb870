//! Embedding lookup table.
//!
//! Backs both the pretrained word vectors (frozen) and the trainable
//! user/item latent factors. Frozen tables still surface their weights
//! through [`Parameterized::visit_params`] so they land in checkpoints, but
//! report no gradient slot and are skipped by the optimizer.

use crate::error::{LayerError, LayerResult};
use crate::initializer::Initializer;
use crate::params::{join, ParamMut, Parameterized};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// A `[vocab, dim]` lookup table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingTable {
    weights: Tensor,
    grad: Tensor,
    frozen: bool,
    vocab_size: usize,
    dim: usize,
}

impl EmbeddingTable {
    /// Creates a trainable table initialized from `N(0, 0.1)`.
    pub fn new(vocab_size: usize, dim: usize, rng: &mut StdRng) -> Self {
        let init = Initializer::Normal {
            mean: 0.0,
            std: 0.1,
        };
        Self {
            weights: init.initialize(&[vocab_size, dim], rng),
            grad: Tensor::zeros(&[vocab_size, dim]),
            frozen: false,
            vocab_size,
            dim,
        }
    }

    /// Wraps pretrained weights as a frozen table.
    pub fn from_pretrained(weights: Tensor) -> LayerResult<Self> {
        if weights.ndim() != 2 {
            return Err(LayerError::EmbeddingError {
                message: format!(
                    "pretrained embedding must be 2D [vocab, dim], got {}D",
                    weights.ndim()
                ),
            });
        }
        let vocab_size = weights.shape()[0];
        let dim = weights.shape()[1];
        Ok(Self {
            grad: Tensor::zeros(&[0, 0]),
            weights,
            frozen: true,
            vocab_size,
            dim,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Gathers rows for `ids`, producing `[ids.len(), dim]`.
    pub fn lookup(&self, ids: &[usize]) -> LayerResult<Tensor> {
        let mut data = Vec::with_capacity(ids.len() * self.dim);
        for &id in ids {
            if id >= self.vocab_size {
                return Err(LayerError::EmbeddingError {
                    message: format!("id {} out of range for vocab of {}", id, self.vocab_size),
                });
            }
            data.extend_from_slice(self.weights.row(id));
        }
        Ok(Tensor::from_data(&[ids.len(), self.dim], data))
    }

    /// Returns a single row view.
    pub fn row(&self, id: usize) -> LayerResult<&[f32]> {
        if id >= self.vocab_size {
            return Err(LayerError::EmbeddingError {
                message: format!("id {} out of range for vocab of {}", id, self.vocab_size),
            });
        }
        Ok(self.weights.row(id))
    }

    /// Scatters `grads` (`[ids.len(), dim]`) into the gradient buffer.
    /// No-op on a frozen table.
    pub fn accumulate_grad(&mut self, ids: &[usize], grads: &Tensor) -> LayerResult<()> {
        if self.frozen {
            return Ok(());
        }
        if grads.shape() != [ids.len(), self.dim] {
            return Err(LayerError::ShapeMismatch {
                expected: vec![ids.len(), self.dim],
                actual: grads.shape().to_vec(),
            });
        }
        for (i, &id) in ids.iter().enumerate() {
            if id >= self.vocab_size {
                return Err(LayerError::EmbeddingError {
                    message: format!("id {} out of range for vocab of {}", id, self.vocab_size),
                });
            }
            let row = self.grad.row_mut(id);
            for (g, &d) in row.iter_mut().zip(grads.row(i).iter()) {
                *g += d;
            }
        }
        Ok(())
    }
}

impl Parameterized for EmbeddingTable {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        f(&join(prefix, "weights"), &self.weights);
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        let grad = if self.frozen {
            None
        } else {
            Some(&mut self.grad)
        };
        f(ParamMut {
            name: join(prefix, "weights"),
            value: &mut self.weights,
            grad,
        });
    }

    fn zero_grads(&mut self) {
        if !self.frozen {
            self.grad.fill_zero();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_lookup_shapes_and_rows() {
        let mut rng = StdRng::seed_from_u64(11);
        let table = EmbeddingTable::new(10, 4, &mut rng);
        let out = table.lookup(&[3, 3, 7]).unwrap();
        assert_eq!(out.shape(), &[3, 4]);
        assert_eq!(out.row(0), out.row(1));
        assert_eq!(out.row(2), table.row(7).unwrap());
    }

    #[test]
    fn test_lookup_out_of_range() {
        let mut rng = StdRng::seed_from_u64(11);
        let table = EmbeddingTable::new(5, 2, &mut rng);
        assert!(matches!(
            table.lookup(&[5]),
            Err(LayerError::EmbeddingError { .. })
        ));
    }

    #[test]
    fn test_frozen_table_has_no_grad_slot() {
        let weights = Tensor::from_data(&[3, 2], vec![0.0; 6]);
        let mut table = EmbeddingTable::from_pretrained(weights).unwrap();
        let mut saw_grad = false;
        table.visit_params_mut("word", &mut |p| {
            assert_eq!(p.name, "word.weights");
            saw_grad = p.grad.is_some();
        });
        assert!(!saw_grad);

        // accumulate_grad is a no-op when frozen
        let grads = Tensor::ones(&[1, 2]);
        table.accumulate_grad(&[0], &grads).unwrap();
    }

    #[test]
    fn test_sparse_grad_accumulation() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut table = EmbeddingTable::new(4, 2, &mut rng);
        let grads = Tensor::from_data(&[3, 2], vec![1.0, 2.0, 10.0, 20.0, 1.0, 1.0]);
        table.accumulate_grad(&[1, 3, 1], &grads).unwrap();
        table.visit_params_mut("mf", &mut |p| {
            let grad = p.grad.unwrap();
            assert_eq!(grad.row(0), &[0.0, 0.0]);
            assert_eq!(grad.row(1), &[2.0, 3.0]);
            assert_eq!(grad.row(3), &[10.0, 20.0]);
        });
    }
}
