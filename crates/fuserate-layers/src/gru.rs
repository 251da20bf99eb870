//! Length-aware GRU sequence encoder.
//!
//! Encodes a batch of padded, variable-length sequences into fixed-size
//! vectors. The recurrence only runs over the true-length prefix of each
//! sequence: once a row's true length is exhausted, its hidden state is
//! frozen, so padding positions never influence the encoded state.
//!
//! The per-timestep output is re-padded to an explicit `total_length` that
//! the caller threads through from the *unsplit* batch. When one logical
//! batch is scattered across devices, each shard re-pads to the same global
//! extent and the gathered outputs concatenate cleanly. Inferring the extent
//! from the shard instead is exactly the bug this signature prevents.

use crate::error::{LayerError, LayerResult};
use crate::initializer::Initializer;
use crate::params::{join, ParamMut, Parameterized};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Gated recurrent unit encoder over padded sequences.
///
/// The forward pass computes, per valid time step:
/// - `r_t = sigmoid(x_t W_rx + h W_rh + b_r)` (reset gate)
/// - `z_t = sigmoid(x_t W_zx + h W_zh + b_z)` (update gate)
/// - `c_t = tanh(x_t W_hx + (r_t * h) W_hh + b_h)` (candidate state)
/// - `h = (1 - z_t) * h + z_t * c_t`
///
/// Steps at or past a row's true length leave `h` unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GruEncoder {
    input_dim: usize,
    hidden_dim: usize,
    /// Reset gate weights for input
    w_r_x: Tensor,
    /// Reset gate weights for hidden state
    w_r_h: Tensor,
    /// Reset gate bias
    b_r: Tensor,
    /// Update gate weights for input
    w_z_x: Tensor,
    /// Update gate weights for hidden state
    w_z_h: Tensor,
    /// Update gate bias
    b_z: Tensor,
    /// Candidate state weights for input
    w_h_x: Tensor,
    /// Candidate state weights for hidden state
    w_h_h: Tensor,
    /// Candidate state bias
    b_h: Tensor,
    w_r_x_grad: Tensor,
    w_r_h_grad: Tensor,
    b_r_grad: Tensor,
    w_z_x_grad: Tensor,
    w_z_h_grad: Tensor,
    b_z_grad: Tensor,
    w_h_x_grad: Tensor,
    w_h_h_grad: Tensor,
    b_h_grad: Tensor,
}

/// Output of a GRU encoding pass.
#[derive(Debug, Clone)]
pub struct GruOutput {
    /// All hidden states, padded to `[batch, total_length, hidden_dim]`.
    ///
    /// Positions at or past each row's true length are zero.
    pub states: Tensor,
    /// Final hidden state per sequence `[batch, hidden_dim]`.
    ///
    /// Zero for sequences of length zero.
    pub last: Tensor,
}

/// Cached values from a GRU forward pass for backpropagation through time.
#[derive(Debug, Clone)]
pub struct GruCache {
    input: Tensor,
    lengths: Vec<usize>,
    /// Hidden states `h_0..h_T`, each `[batch, hidden_dim]`.
    hs: Vec<Tensor>,
    /// Reset gate values per step.
    rs: Vec<Tensor>,
    /// Update gate values per step.
    zs: Vec<Tensor>,
    /// Candidate states per step.
    cs: Vec<Tensor>,
}

impl GruEncoder {
    /// Creates a new GRU encoder with Xavier-initialized weights.
    pub fn new(input_dim: usize, hidden_dim: usize, rng: &mut StdRng) -> Self {
        let init_x = Initializer::Xavier {
            fan_in: input_dim,
            fan_out: hidden_dim,
        };
        let init_h = Initializer::Xavier {
            fan_in: hidden_dim,
            fan_out: hidden_dim,
        };
        Self {
            w_r_x: init_x.initialize(&[input_dim, hidden_dim], rng),
            w_r_h: init_h.initialize(&[hidden_dim, hidden_dim], rng),
            b_r: Tensor::zeros(&[hidden_dim]),
            w_z_x: init_x.initialize(&[input_dim, hidden_dim], rng),
            w_z_h: init_h.initialize(&[hidden_dim, hidden_dim], rng),
            b_z: Tensor::zeros(&[hidden_dim]),
            w_h_x: init_x.initialize(&[input_dim, hidden_dim], rng),
            w_h_h: init_h.initialize(&[hidden_dim, hidden_dim], rng),
            b_h: Tensor::zeros(&[hidden_dim]),
            w_r_x_grad: Tensor::zeros(&[input_dim, hidden_dim]),
            w_r_h_grad: Tensor::zeros(&[hidden_dim, hidden_dim]),
            b_r_grad: Tensor::zeros(&[hidden_dim]),
            w_z_x_grad: Tensor::zeros(&[input_dim, hidden_dim]),
            w_z_h_grad: Tensor::zeros(&[hidden_dim, hidden_dim]),
            b_z_grad: Tensor::zeros(&[hidden_dim]),
            w_h_x_grad: Tensor::zeros(&[input_dim, hidden_dim]),
            w_h_h_grad: Tensor::zeros(&[hidden_dim, hidden_dim]),
            b_h_grad: Tensor::zeros(&[hidden_dim]),
            input_dim,
            hidden_dim,
        }
    }

    /// Returns the input dimension.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Returns the hidden dimension.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn validate(
        &self,
        input: &Tensor,
        lengths: &[usize],
        total_length: usize,
    ) -> LayerResult<(usize, usize)> {
        if input.ndim() != 3 {
            return Err(LayerError::ForwardError {
                message: format!(
                    "GruEncoder expects 3D input [batch, time, dim], got {}D",
                    input.ndim()
                ),
            });
        }
        let batch = input.shape()[0];
        let steps = input.shape()[1];
        if input.shape()[2] != self.input_dim {
            return Err(LayerError::InvalidInputDimension {
                expected: self.input_dim,
                actual: input.shape()[2],
            });
        }
        if lengths.len() != batch {
            return Err(LayerError::ShapeMismatch {
                expected: vec![batch],
                actual: vec![lengths.len()],
            });
        }
        for &len in lengths {
            if len > steps {
                return Err(LayerError::LengthOverflow {
                    length: len,
                    padded: steps,
                });
            }
            if len > total_length {
                return Err(LayerError::LengthOverflow {
                    length: len,
                    padded: total_length,
                });
            }
        }
        Ok((batch, steps))
    }

    /// Extracts timestep `t` as a `[batch, input_dim]` tensor.
    fn extract_timestep(&self, input: &Tensor, t: usize, batch: usize, steps: usize) -> Tensor {
        let dim = self.input_dim;
        let mut data = vec![0.0; batch * dim];
        for b in 0..batch {
            let src = b * steps * dim + t * dim;
            data[b * dim..(b + 1) * dim].copy_from_slice(&input.data()[src..src + dim]);
        }
        Tensor::from_data(&[batch, dim], data)
    }

    fn sigmoid_gate(&self, x: &Tensor, h: &Tensor, w_x: &Tensor, w_h: &Tensor, b: &Tensor) -> Tensor {
        x.matmul(w_x)
            .add(&h.matmul(w_h))
            .add(b)
            .map(|v| 1.0 / (1.0 + (-v).exp()))
    }

    fn candidate(&self, x: &Tensor, h: &Tensor, r: &Tensor) -> Tensor {
        x.matmul(&self.w_h_x)
            .add(&r.mul(h).matmul(&self.w_h_h))
            .add(&self.b_h)
            .map(|v| v.tanh())
    }

    /// Encodes a padded batch, producing per-step states and the final state.
    ///
    /// # Arguments
    ///
    /// * `input` - Padded embeddings `[batch, steps, input_dim]`
    /// * `lengths` - True length per sequence; padding positions are ignored
    /// * `total_length` - Global padded extent of the *unsplit* batch; the
    ///   per-step output is padded to this, never to the shard-local maximum
    pub fn encode(
        &self,
        input: &Tensor,
        lengths: &[usize],
        total_length: usize,
    ) -> LayerResult<GruOutput> {
        let (output, _) = self.run(input, lengths, total_length, false)?;
        Ok(output)
    }

    /// Same as [`encode`](Self::encode) but returns the BPTT cache.
    pub fn encode_train(
        &self,
        input: &Tensor,
        lengths: &[usize],
        total_length: usize,
    ) -> LayerResult<(GruOutput, GruCache)> {
        let (output, cache) = self.run(input, lengths, total_length, true)?;
        let cache = cache.ok_or(LayerError::BackwardError {
            message: "GRU cache missing after training forward".to_string(),
        })?;
        Ok((output, cache))
    }

    fn run(
        &self,
        input: &Tensor,
        lengths: &[usize],
        total_length: usize,
        keep_cache: bool,
    ) -> LayerResult<(GruOutput, Option<GruCache>)> {
        let (batch, steps) = self.validate(input, lengths, total_length)?;
        let hidden = self.hidden_dim;

        let mut h = Tensor::zeros(&[batch, hidden]);
        let mut states = vec![0.0; batch * total_length * hidden];

        let mut hs = Vec::new();
        let mut rs = Vec::new();
        let mut zs = Vec::new();
        let mut cs = Vec::new();
        if keep_cache {
            hs.push(h.clone());
        }

        for t in 0..steps {
            let x_t = self.extract_timestep(input, t, batch, steps);
            let r = self.sigmoid_gate(&x_t, &h, &self.w_r_x, &self.w_r_h, &self.b_r);
            let z = self.sigmoid_gate(&x_t, &h, &self.w_z_x, &self.w_z_h, &self.b_z);
            let c = self.candidate(&x_t, &h, &r);

            let mut h_new = Tensor::zeros(&[batch, hidden]);
            for b in 0..batch {
                let row = h_new.row_mut(b);
                if t < lengths[b] {
                    for d in 0..hidden {
                        let idx = b * hidden + d;
                        row[d] = (1.0 - z.data()[idx]) * h.data()[idx]
                            + z.data()[idx] * c.data()[idx];
                    }
                    let dst = b * total_length * hidden + t * hidden;
                    states[dst..dst + hidden].copy_from_slice(row);
                } else {
                    row.copy_from_slice(h.row(b));
                }
            }
            h = h_new;

            if keep_cache {
                hs.push(h.clone());
                rs.push(r);
                zs.push(z);
                cs.push(c);
            }
        }

        let output = GruOutput {
            states: Tensor::from_data(&[batch, total_length, hidden], states),
            last: h,
        };
        let cache = keep_cache.then(|| GruCache {
            input: input.clone(),
            lengths: lengths.to_vec(),
            hs,
            rs,
            zs,
            cs,
        });
        Ok((output, cache))
    }

    /// Backpropagation through time.
    ///
    /// `d_last` is the gradient on the final hidden state `[batch, hidden]`;
    /// `d_states` optionally carries gradients on the padded per-step output.
    /// Returns the gradient on the input `[batch, steps, input_dim]`.
    pub fn backward(
        &mut self,
        d_last: &Tensor,
        d_states: Option<&Tensor>,
        cache: &GruCache,
    ) -> LayerResult<Tensor> {
        let batch = cache.input.shape()[0];
        let steps = cache.input.shape()[1];
        let hidden = self.hidden_dim;
        if d_last.shape() != [batch, hidden] {
            return Err(LayerError::ShapeMismatch {
                expected: vec![batch, hidden],
                actual: d_last.shape().to_vec(),
            });
        }

        let mut dh = d_last.clone();
        let mut dx = vec![0.0; batch * steps * self.input_dim];

        for t in (0..steps).rev() {
            // Direct gradient on h_{t+1} from the padded per-step output;
            // padded positions carry no signal and are skipped.
            if let Some(ds) = d_states {
                let total = ds.shape()[1];
                for b in 0..batch {
                    if t < cache.lengths[b] {
                        let src = b * total * hidden + t * hidden;
                        let row = dh.row_mut(b);
                        for d in 0..hidden {
                            row[d] += ds.data()[src + d];
                        }
                    }
                }
            }

            let h_prev = &cache.hs[t];
            let r = &cache.rs[t];
            let z = &cache.zs[t];
            let c = &cache.cs[t];
            let x_t = self.extract_timestep(&cache.input, t, batch, steps);

            // h' = (1-z)*h + z*c
            let mut dz = dh.mul(&c.sub(h_prev));
            let dc = dh.mul(z);
            let dh_pass = dh.mul(&z.map(|v| 1.0 - v));

            let mut dc_pre = dc.mul(&c.map(|v| 1.0 - v * v));
            // Rows past their true length are frozen; the gradient passes
            // through untouched and no gate gradients are produced.
            for b in 0..batch {
                if t >= cache.lengths[b] {
                    for d in 0..hidden {
                        dc_pre.row_mut(b)[d] = 0.0;
                        dz.row_mut(b)[d] = 0.0;
                    }
                }
            }

            let d_rh = dc_pre.matmul(&self.w_h_h.transpose());
            let dr = d_rh.mul(h_prev);
            let mut dr_pre = dr.mul(&r.map(|v| v * (1.0 - v)));
            let mut dz_pre = dz.mul(&z.map(|v| v * (1.0 - v)));
            for b in 0..batch {
                if t >= cache.lengths[b] {
                    for d in 0..hidden {
                        dr_pre.row_mut(b)[d] = 0.0;
                        dz_pre.row_mut(b)[d] = 0.0;
                    }
                }
            }

            // Parameter gradients
            self.w_r_x_grad.add_assign(&x_t.transpose().matmul(&dr_pre));
            self.w_r_h_grad
                .add_assign(&h_prev.transpose().matmul(&dr_pre));
            self.b_r_grad.add_assign(&dr_pre.sum_axis(0));
            self.w_z_x_grad.add_assign(&x_t.transpose().matmul(&dz_pre));
            self.w_z_h_grad
                .add_assign(&h_prev.transpose().matmul(&dz_pre));
            self.b_z_grad.add_assign(&dz_pre.sum_axis(0));
            self.w_h_x_grad.add_assign(&x_t.transpose().matmul(&dc_pre));
            self.w_h_h_grad
                .add_assign(&r.mul(h_prev).transpose().matmul(&dc_pre));
            self.b_h_grad.add_assign(&dc_pre.sum_axis(0));

            // Input gradient for this step
            let dx_t = dr_pre
                .matmul(&self.w_r_x.transpose())
                .add(&dz_pre.matmul(&self.w_z_x.transpose()))
                .add(&dc_pre.matmul(&self.w_h_x.transpose()));
            for b in 0..batch {
                let dst = b * steps * self.input_dim + t * self.input_dim;
                dx[dst..dst + self.input_dim].copy_from_slice(dx_t.row(b));
            }

            // Gradient on h_t
            let mut dh_new = dh_pass
                .add(&d_rh.mul(r))
                .add(&dr_pre.matmul(&self.w_r_h.transpose()))
                .add(&dz_pre.matmul(&self.w_z_h.transpose()));
            for b in 0..batch {
                if t >= cache.lengths[b] {
                    dh_new.row_mut(b).copy_from_slice(dh.row(b));
                }
            }
            dh = dh_new;
        }

        Ok(Tensor::from_data(&[batch, steps, self.input_dim], dx))
    }
}

impl Parameterized for GruEncoder {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        f(&join(prefix, "w_r_x"), &self.w_r_x);
        f(&join(prefix, "w_r_h"), &self.w_r_h);
        f(&join(prefix, "b_r"), &self.b_r);
        f(&join(prefix, "w_z_x"), &self.w_z_x);
        f(&join(prefix, "w_z_h"), &self.w_z_h);
        f(&join(prefix, "b_z"), &self.b_z);
        f(&join(prefix, "w_h_x"), &self.w_h_x);
        f(&join(prefix, "w_h_h"), &self.w_h_h);
        f(&join(prefix, "b_h"), &self.b_h);
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        let pairs: [(&str, &mut Tensor, &mut Tensor); 9] = [
            ("w_r_x", &mut self.w_r_x, &mut self.w_r_x_grad),
            ("w_r_h", &mut self.w_r_h, &mut self.w_r_h_grad),
            ("b_r", &mut self.b_r, &mut self.b_r_grad),
            ("w_z_x", &mut self.w_z_x, &mut self.w_z_x_grad),
            ("w_z_h", &mut self.w_z_h, &mut self.w_z_h_grad),
            ("b_z", &mut self.b_z, &mut self.b_z_grad),
            ("w_h_x", &mut self.w_h_x, &mut self.w_h_x_grad),
            ("w_h_h", &mut self.w_h_h, &mut self.w_h_h_grad),
            ("b_h", &mut self.b_h, &mut self.b_h_grad),
        ];
        for (name, value, grad) in pairs {
            f(ParamMut {
                name: join(prefix, name),
                value,
                grad: Some(grad),
            });
        }
    }

    fn zero_grads(&mut self) {
        self.w_r_x_grad.fill_zero();
        self.w_r_h_grad.fill_zero();
        self.b_r_grad.fill_zero();
        self.w_z_x_grad.fill_zero();
        self.w_z_h_grad.fill_zero();
        self.b_z_grad.fill_zero();
        self.w_h_x_grad.fill_zero();
        self.w_h_h_grad.fill_zero();
        self.b_h_grad.fill_zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    fn rand_input(shape: &[usize], seed: u64) -> Tensor {
        Initializer::Normal {
            mean: 0.0,
            std: 0.5,
        }
        .initialize(shape, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_encode_shapes() {
        let gru = GruEncoder::new(4, 6, &mut rng());
        let input = rand_input(&[3, 5, 4], 1);
        let out = gru.encode(&input, &[5, 3, 1], 5).unwrap();
        assert_eq!(out.states.shape(), &[3, 5, 6]);
        assert_eq!(out.last.shape(), &[3, 6]);
    }

    #[test]
    fn test_padding_does_not_influence_state() {
        let gru = GruEncoder::new(4, 6, &mut rng());
        let input = rand_input(&[1, 5, 4], 2);

        // Corrupt the padding positions; the encoded state must not change.
        let mut corrupted = input.clone();
        for v in corrupted.data_mut()[2 * 4..].iter_mut() {
            *v = 99.0;
        }

        let a = gru.encode(&input, &[2], 5).unwrap();
        let b = gru.encode(&corrupted, &[2], 5).unwrap();
        for (x, y) in a.last.data().iter().zip(b.last.data().iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_total_length_repads_output() {
        let gru = GruEncoder::new(4, 6, &mut rng());
        // Shard padded to 3 steps, but the unsplit batch was padded to 7.
        let input = rand_input(&[2, 3, 4], 3);
        let out = gru.encode(&input, &[3, 2], 7).unwrap();
        assert_eq!(out.states.shape(), &[2, 7, 6]);
        // Positions past the true length stay zero.
        let hidden = 6;
        for t in 3..7 {
            for d in 0..hidden {
                assert_eq!(out.states.data()[t * hidden + d], 0.0);
            }
        }
    }

    #[test]
    fn test_length_overflow_is_an_error() {
        let gru = GruEncoder::new(4, 6, &mut rng());
        let input = rand_input(&[1, 3, 4], 4);
        // True length exceeds the padded extent: silent truncation forbidden.
        let err = gru.encode(&input, &[5], 5).unwrap_err();
        assert!(matches!(err, LayerError::LengthOverflow { .. }));
        // True length exceeds the declared total after a split.
        let err = gru.encode(&input, &[3], 2).unwrap_err();
        assert!(matches!(err, LayerError::LengthOverflow { .. }));
    }

    #[test]
    fn test_zero_length_yields_zero_state() {
        let gru = GruEncoder::new(4, 6, &mut rng());
        let input = rand_input(&[2, 3, 4], 5);
        let out = gru.encode(&input, &[0, 3], 3).unwrap();
        assert!(out.last.row(0).iter().all(|&x| x == 0.0));
        assert!(out.last.row(1).iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_bptt_gradient_check() {
        let mut gru = GruEncoder::new(3, 4, &mut rng());
        let input = rand_input(&[2, 4, 3], 6);
        let lengths = [4, 2];

        let (out, cache) = gru.encode_train(&input, &lengths, 4).unwrap();
        let d_last = Tensor::ones(out.last.shape());
        gru.backward(&d_last, None, &cache).unwrap();

        // Check one entry of each weight family against finite differences
        // of loss = sum(last).
        let checks: [(&str, usize); 3] = [("w_z_x", 2), ("w_h_h", 5), ("w_r_h", 7)];
        for (name, idx) in checks {
            let mut analytic = 0.0;
            gru.visit_params_mut("", &mut |p| {
                if p.name == name {
                    if let Some(grad) = p.grad {
                        analytic = grad.data()[idx];
                    }
                }
            });

            let eps = 1e-3;
            let loss_at = |delta: f32| {
                let mut g = gru.clone();
                g.visit_params_mut("", &mut |p| {
                    if p.name == name {
                        p.value.data_mut()[idx] += delta;
                    }
                });
                g.encode(&input, &lengths, 4).unwrap().last.sum()
            };
            let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
            assert!(
                (analytic - numeric).abs() < 2e-2,
                "{name}[{idx}]: analytic {analytic} vs numeric {numeric}"
            );
        }
    }

    #[test]
    fn test_bptt_input_gradient_check() {
        let mut gru = GruEncoder::new(3, 4, &mut rng());
        let input = rand_input(&[1, 3, 3], 7);
        let lengths = [3];

        let (out, cache) = gru.encode_train(&input, &lengths, 3).unwrap();
        let d_last = Tensor::ones(out.last.shape());
        let dx = gru.backward(&d_last, None, &cache).unwrap();

        let idx = 4;
        let eps = 1e-3;
        let mut plus = input.clone();
        plus.data_mut()[idx] += eps;
        let mut minus = input.clone();
        minus.data_mut()[idx] -= eps;
        let f_plus = gru.encode(&plus, &lengths, 3).unwrap().last.sum();
        let f_minus = gru.encode(&minus, &lengths, 3).unwrap().last.sum();
        let numeric = (f_plus - f_minus) / (2.0 * eps);
        assert!(
            (dx.data()[idx] - numeric).abs() < 1e-2,
            "input grad {} vs numeric {numeric}",
            dx.data()[idx]
        );
    }
}
