//! Score / normalize / weighted-sum attention pooling.
//!
//! One abstraction serves both cross-modal uses in the rating model: the
//! sentence attention inside the review network (learned context query,
//! [`AttentionPool::new`]) and the topic-to-photo gating in the photo
//! network (external per-row query, [`AttentionPool::external`] — no
//! context parameter is allocated).
//!
//! Scores are `q . tanh(W x_i + b)`, normalized with a softmax over the
//! *true* element count of each row; padding entries receive zero weight and
//! never contribute to the pooled output. A row with zero true elements
//! yields all-zero weights and a zero pooled vector; the caller substitutes
//! its default latent.

use crate::error::{LayerError, LayerResult};
use crate::initializer::Initializer;
use crate::params::{join, ParamMut, Parameterized};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Attention pooling over a padded collection dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionPool {
    in_dim: usize,
    att_dim: usize,
    /// Score projection [in_dim, att_dim]
    proj: Tensor,
    /// Score projection bias [att_dim]
    proj_b: Tensor,
    /// Learned context query [att_dim]; absent when the pool is driven by
    /// external queries only
    context: Option<Tensor>,
    proj_grad: Tensor,
    proj_b_grad: Tensor,
    context_grad: Option<Tensor>,
}

/// Result of an attention pooling pass.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Weighted sum per row `[batch, in_dim]`.
    pub pooled: Tensor,
    /// Normalized weights `[batch, n]`; zero on padding and empty rows.
    pub weights: Tensor,
}

/// Cached values from an attention forward pass.
#[derive(Debug, Clone)]
pub struct AttentionCache {
    inputs: Tensor,
    /// tanh projections `[batch, n, att_dim]`
    tanh: Tensor,
    weights: Tensor,
    counts: Vec<usize>,
    /// External query actually used, if any `[batch, att_dim]`
    query: Option<Tensor>,
}

impl AttentionPool {
    /// Creates a pool with a learned context query, used when no external
    /// query is passed.
    pub fn new(in_dim: usize, att_dim: usize, rng: &mut StdRng) -> Self {
        let ctx_init = Initializer::Normal {
            mean: 0.0,
            std: 0.1,
        };
        let mut pool = Self::external(in_dim, att_dim, rng);
        pool.context = Some(ctx_init.initialize(&[att_dim], rng));
        pool.context_grad = Some(Tensor::zeros(&[att_dim]));
        pool
    }

    /// Creates a pool driven purely by external queries; every forward must
    /// pass one, and no context parameter exists.
    pub fn external(in_dim: usize, att_dim: usize, rng: &mut StdRng) -> Self {
        let init = Initializer::Xavier {
            fan_in: in_dim,
            fan_out: att_dim,
        };
        Self {
            proj: init.initialize(&[in_dim, att_dim], rng),
            proj_b: Tensor::zeros(&[att_dim]),
            context: None,
            proj_grad: Tensor::zeros(&[in_dim, att_dim]),
            proj_b_grad: Tensor::zeros(&[att_dim]),
            context_grad: None,
            in_dim,
            att_dim,
        }
    }

    /// Returns the input element dimension.
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    /// Returns the attention projection dimension.
    pub fn att_dim(&self) -> usize {
        self.att_dim
    }

    fn validate(
        &self,
        inputs: &Tensor,
        counts: &[usize],
        query: Option<&Tensor>,
    ) -> LayerResult<(usize, usize)> {
        if inputs.ndim() != 3 {
            return Err(LayerError::ForwardError {
                message: format!(
                    "AttentionPool expects 3D input [batch, n, dim], got {}D",
                    inputs.ndim()
                ),
            });
        }
        let batch = inputs.shape()[0];
        let n = inputs.shape()[1];
        if inputs.shape()[2] != self.in_dim {
            return Err(LayerError::InvalidInputDimension {
                expected: self.in_dim,
                actual: inputs.shape()[2],
            });
        }
        if counts.len() != batch {
            return Err(LayerError::ShapeMismatch {
                expected: vec![batch],
                actual: vec![counts.len()],
            });
        }
        for &count in counts {
            if count > n {
                return Err(LayerError::LengthOverflow {
                    length: count,
                    padded: n,
                });
            }
        }
        match query {
            Some(q) => {
                if q.shape() != [batch, self.att_dim] {
                    return Err(LayerError::ShapeMismatch {
                        expected: vec![batch, self.att_dim],
                        actual: q.shape().to_vec(),
                    });
                }
            }
            None => {
                if self.context.is_none() {
                    return Err(LayerError::ForwardError {
                        message: "attention pool has no learned context; an external query is required"
                            .to_string(),
                    });
                }
            }
        }
        Ok((batch, n))
    }

    /// Pools `inputs` over the collection dimension.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Padded elements `[batch, n, in_dim]`
    /// * `counts` - True element count per row (softmax support)
    /// * `query` - Optional external query `[batch, att_dim]`; the learned
    ///   context vector is used when absent
    pub fn forward(
        &self,
        inputs: &Tensor,
        counts: &[usize],
        query: Option<&Tensor>,
    ) -> LayerResult<AttentionOutput> {
        let (out, _) = self.run(inputs, counts, query, false)?;
        Ok(out)
    }

    /// Same as [`forward`](Self::forward) but returns the backward cache.
    pub fn forward_train(
        &self,
        inputs: &Tensor,
        counts: &[usize],
        query: Option<&Tensor>,
    ) -> LayerResult<(AttentionOutput, AttentionCache)> {
        let (out, cache) = self.run(inputs, counts, query, true)?;
        let cache = cache.ok_or(LayerError::BackwardError {
            message: "attention cache missing after training forward".to_string(),
        })?;
        Ok((out, cache))
    }

    fn run(
        &self,
        inputs: &Tensor,
        counts: &[usize],
        query: Option<&Tensor>,
        keep_cache: bool,
    ) -> LayerResult<(AttentionOutput, Option<AttentionCache>)> {
        let (batch, n) = self.validate(inputs, counts, query)?;
        let in_dim = self.in_dim;
        let att = self.att_dim;

        let mut tanh = vec![0.0; batch * n * att];
        let mut weights = vec![0.0; batch * n];
        let mut pooled = vec![0.0; batch * in_dim];
        let context: Option<&[f32]> = self.context.as_ref().map(Tensor::data);

        for b in 0..batch {
            let count = counts[b];
            if count == 0 {
                continue;
            }
            let q: &[f32] = match query {
                Some(q) => q.row(b),
                // Presence was checked in validate
                None => context.ok_or_else(|| LayerError::ForwardError {
                    message: "attention pool lost its context".to_string(),
                })?,
            };

            // Scores over the true element count
            let mut scores = vec![0.0; count];
            for i in 0..count {
                let x = &inputs.data()[(b * n + i) * in_dim..(b * n + i + 1) * in_dim];
                let t = &mut tanh[(b * n + i) * att..(b * n + i + 1) * att];
                for (c, tc) in t.iter_mut().enumerate() {
                    let mut pre = self.proj_b.data()[c];
                    for (r, &xr) in x.iter().enumerate() {
                        pre += xr * self.proj.data()[r * att + c];
                    }
                    *tc = pre.tanh();
                }
                scores[i] = t.iter().zip(q.iter()).map(|(a, b)| a * b).sum();
            }

            // Stable softmax over the true count
            let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0;
            for s in scores.iter_mut() {
                *s = (*s - max).exp();
                denom += *s;
            }
            for (i, s) in scores.iter().enumerate() {
                weights[b * n + i] = s / denom;
            }

            for i in 0..count {
                let w = weights[b * n + i];
                let x = &inputs.data()[(b * n + i) * in_dim..(b * n + i + 1) * in_dim];
                let out = &mut pooled[b * in_dim..(b + 1) * in_dim];
                for (o, &xr) in out.iter_mut().zip(x.iter()) {
                    *o += w * xr;
                }
            }
        }

        let output = AttentionOutput {
            pooled: Tensor::from_data(&[batch, in_dim], pooled),
            weights: Tensor::from_data(&[batch, n], weights),
        };
        let cache = keep_cache.then(|| AttentionCache {
            inputs: inputs.clone(),
            tanh: Tensor::from_data(&[batch, n, att], tanh),
            weights: output.weights.clone(),
            counts: counts.to_vec(),
            query: query.cloned(),
        });
        Ok((output, cache))
    }

    /// Accumulates parameter gradients and returns the input gradient plus
    /// the external-query gradient when one was used.
    pub fn backward(
        &mut self,
        d_pooled: &Tensor,
        cache: &AttentionCache,
    ) -> LayerResult<(Tensor, Option<Tensor>)> {
        let batch = cache.inputs.shape()[0];
        let n = cache.inputs.shape()[1];
        let in_dim = self.in_dim;
        let att = self.att_dim;
        if d_pooled.shape() != [batch, in_dim] {
            return Err(LayerError::ShapeMismatch {
                expected: vec![batch, in_dim],
                actual: d_pooled.shape().to_vec(),
            });
        }

        let mut d_inputs = vec![0.0; batch * n * in_dim];
        let mut d_query = cache.query.as_ref().map(|_| vec![0.0; batch * att]);

        for b in 0..batch {
            let count = cache.counts[b];
            if count == 0 {
                continue;
            }
            let q: &[f32] = match &cache.query {
                Some(q) => q.row(b),
                None => self
                    .context
                    .as_ref()
                    .map(Tensor::data)
                    .ok_or_else(|| LayerError::BackwardError {
                        message: "cached pass used a learned context that no longer exists"
                            .to_string(),
                    })?,
            };
            let dp = d_pooled.row(b);

            // d a_i = d_pooled . x_i ; softmax backward to scores
            let mut da = vec![0.0; count];
            for (i, dai) in da.iter_mut().enumerate() {
                let x = &cache.inputs.data()[(b * n + i) * in_dim..(b * n + i + 1) * in_dim];
                *dai = dp.iter().zip(x.iter()).map(|(a, b)| a * b).sum();
            }
            let weighted: f32 = (0..count)
                .map(|i| cache.weights.data()[b * n + i] * da[i])
                .sum();

            for i in 0..count {
                let a_i = cache.weights.data()[b * n + i];
                let ds = a_i * (da[i] - weighted);
                let t = &cache.tanh.data()[(b * n + i) * att..(b * n + i + 1) * att];
                let x = &cache.inputs.data()[(b * n + i) * in_dim..(b * n + i + 1) * in_dim];
                let dx = &mut d_inputs[(b * n + i) * in_dim..(b * n + i + 1) * in_dim];

                // Weighted-sum path
                for (d, &g) in dx.iter_mut().zip(dp.iter()) {
                    *d += a_i * g;
                }

                for c in 0..att {
                    // Query path
                    match (&mut d_query, &mut self.context_grad) {
                        (Some(dq), _) => dq[b * att + c] += ds * t[c],
                        (None, Some(cg)) => cg.data_mut()[c] += ds * t[c],
                        (None, None) => {}
                    }
                    // Score path through tanh projection
                    let dpre = ds * q[c] * (1.0 - t[c] * t[c]);
                    self.proj_b_grad.data_mut()[c] += dpre;
                    for (r, &xr) in x.iter().enumerate() {
                        self.proj_grad.data_mut()[r * att + c] += xr * dpre;
                        dx[r] += self.proj.data()[r * att + c] * dpre;
                    }
                }
            }
        }

        let d_inputs = Tensor::from_data(&[batch, n, in_dim], d_inputs);
        let d_query = d_query.map(|d| Tensor::from_data(&[batch, att], d));
        Ok((d_inputs, d_query))
    }
}

impl Parameterized for AttentionPool {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        f(&join(prefix, "proj"), &self.proj);
        f(&join(prefix, "proj_b"), &self.proj_b);
        if let Some(context) = &self.context {
            f(&join(prefix, "context"), context);
        }
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        f(ParamMut {
            name: join(prefix, "proj"),
            value: &mut self.proj,
            grad: Some(&mut self.proj_grad),
        });
        f(ParamMut {
            name: join(prefix, "proj_b"),
            value: &mut self.proj_b,
            grad: Some(&mut self.proj_b_grad),
        });
        if let (Some(context), Some(grad)) = (&mut self.context, &mut self.context_grad) {
            f(ParamMut {
                name: join(prefix, "context"),
                value: context,
                grad: Some(grad),
            });
        }
    }

    fn zero_grads(&mut self) {
        self.proj_grad.fill_zero();
        self.proj_b_grad.fill_zero();
        if let Some(grad) = &mut self.context_grad {
            grad.fill_zero();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(5)
    }

    fn rand_input(shape: &[usize], seed: u64) -> Tensor {
        Initializer::Normal {
            mean: 0.0,
            std: 0.5,
        }
        .initialize(shape, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_weights_sum_to_one_over_true_count() {
        let pool = AttentionPool::new(4, 3, &mut rng());
        let inputs = rand_input(&[2, 5, 4], 1);
        let out = pool.forward(&inputs, &[3, 5], None).unwrap();

        for (b, &count) in [3usize, 5].iter().enumerate() {
            let sum: f32 = (0..5).map(|i| out.weights.data()[b * 5 + i]).sum();
            assert!((sum - 1.0).abs() < 1e-5);
            // Padding entries carry zero weight
            for i in count..5 {
                assert_eq!(out.weights.data()[b * 5 + i], 0.0);
            }
        }
    }

    #[test]
    fn test_empty_row_default() {
        let pool = AttentionPool::new(4, 3, &mut rng());
        let inputs = rand_input(&[1, 5, 4], 2);
        let out = pool.forward(&inputs, &[0], None).unwrap();
        assert!(out.weights.data().iter().all(|&w| w == 0.0));
        assert!(out.pooled.data().iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_count_overflow_is_an_error() {
        let pool = AttentionPool::new(4, 3, &mut rng());
        let inputs = rand_input(&[1, 5, 4], 3);
        let err = pool.forward(&inputs, &[6], None).unwrap_err();
        assert!(matches!(err, LayerError::LengthOverflow { .. }));
    }

    #[test]
    fn test_external_query_changes_pooling() {
        let pool = AttentionPool::new(4, 3, &mut rng());
        let inputs = rand_input(&[1, 4, 4], 4);
        let query = rand_input(&[1, 3], 5);
        let a = pool.forward(&inputs, &[4], None).unwrap();
        let b = pool.forward(&inputs, &[4], Some(&query)).unwrap();
        let diff: f32 = a
            .pooled
            .data()
            .iter()
            .zip(b.pooled.data().iter())
            .map(|(x, y)| (x - y).abs())
            .sum();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_external_pool_carries_no_context_parameter() {
        let pool = AttentionPool::external(4, 3, &mut rng());
        let mut names = Vec::new();
        pool.visit_params("gate", &mut |name, _| names.push(name.to_string()));
        assert_eq!(names, vec!["gate.proj", "gate.proj_b"]);

        let inputs = rand_input(&[1, 2, 4], 9);
        let err = pool.forward(&inputs, &[2], None).unwrap_err();
        assert!(matches!(err, LayerError::ForwardError { .. }));

        let query = rand_input(&[1, 3], 10);
        assert!(pool.forward(&inputs, &[2], Some(&query)).is_ok());
    }

    #[test]
    fn test_backward_gradient_check_context() {
        let mut pool = AttentionPool::new(3, 2, &mut rng());
        let inputs = rand_input(&[2, 4, 3], 6);
        let counts = [4, 2];

        let (out, cache) = pool.forward_train(&inputs, &counts, None).unwrap();
        let grad = Tensor::ones(out.pooled.shape());
        pool.backward(&grad, &cache).unwrap();

        let idx = 1;
        let analytic = pool.context_grad.as_ref().unwrap().data()[idx];
        let eps = 1e-3;
        let loss_at = |delta: f32| {
            let mut p = pool.clone();
            p.context.as_mut().unwrap().data_mut()[idx] += delta;
            p.forward(&inputs, &counts, None).unwrap().pooled.sum()
        };
        let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
        assert!(
            (analytic - numeric).abs() < 1e-2,
            "analytic {analytic} vs numeric {numeric}"
        );
    }

    #[test]
    fn test_backward_gradient_check_inputs_and_query() {
        let mut pool = AttentionPool::new(3, 2, &mut rng());
        let inputs = rand_input(&[1, 3, 3], 7);
        let query = rand_input(&[1, 2], 8);
        let counts = [3];

        let (out, cache) = pool.forward_train(&inputs, &counts, Some(&query)).unwrap();
        let grad = Tensor::ones(out.pooled.shape());
        let (dx, dq) = pool.backward(&grad, &cache).unwrap();
        let dq = dq.expect("external query must produce a gradient");

        let eps = 1e-3;
        // Input entry
        let idx = 4;
        let mut plus = inputs.clone();
        plus.data_mut()[idx] += eps;
        let mut minus = inputs.clone();
        minus.data_mut()[idx] -= eps;
        let numeric = (pool.forward(&plus, &counts, Some(&query)).unwrap().pooled.sum()
            - pool
                .forward(&minus, &counts, Some(&query))
                .unwrap()
                .pooled
                .sum())
            / (2.0 * eps);
        assert!((dx.data()[idx] - numeric).abs() < 1e-2);

        // Query entry
        let mut q_plus = query.clone();
        q_plus.data_mut()[0] += eps;
        let mut q_minus = query.clone();
        q_minus.data_mut()[0] -= eps;
        let numeric = (pool
            .forward(&inputs, &counts, Some(&q_plus))
            .unwrap()
            .pooled
            .sum()
            - pool
                .forward(&inputs, &counts, Some(&q_minus))
                .unwrap()
                .pooled
                .sum())
            / (2.0 * eps);
        assert!((dq.data()[0] - numeric).abs() < 1e-2);
    }
}
