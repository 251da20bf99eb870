//! Fusion of textual, visual, and collaborative signals into a rating.
//!
//! Three elementwise user-item interactions are computed: the text latents,
//! the gated visual latents, and the matrix-factorization latents. The
//! visual interaction is L1-normalized per row (with a small epsilon so a
//! zero vector stays zero instead of dividing by zero), which keeps its
//! scale comparable across items with very different photo sets. The three
//! interactions are concatenated and reduced to a scalar prediction by a
//! two-layer head.

use crate::error::{ModelError, ModelResult};
use fuserate_layers::dense::DenseCache;
use fuserate_layers::params::{join, ParamMut, Parameterized};
use fuserate_layers::{Activation, Dense, EmbeddingTable, Tensor};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Epsilon added to the L1 norm of the visual interaction.
pub const L1_EPS: f32 = 1e-8;

/// Rating head over the three fused interactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionHead {
    user_latents: EmbeddingTable,
    item_latents: EmbeddingTable,
    /// `[3 * latent_dim] -> [latent_dim]`, ReLU.
    hidden: Dense,
    /// `[latent_dim] -> 1`, linear.
    output: Dense,
    latent_dim: usize,
}

/// Gradients flowing back out of the fusion head into the encoders.
#[derive(Debug, Clone)]
pub struct FusionGrads {
    pub d_user_text: Tensor,
    pub d_item_text: Tensor,
    pub d_visual_user: Tensor,
    pub d_visual_item: Tensor,
}

/// Cached values from a fusion forward pass.
#[derive(Debug)]
pub struct FusionCache {
    user_ids: Vec<usize>,
    item_ids: Vec<usize>,
    user_text: Tensor,
    item_text: Tensor,
    visual_user: Tensor,
    visual_item: Tensor,
    mf_user: Tensor,
    mf_item: Tensor,
    /// Raw visual interaction before normalization.
    visual_raw: Tensor,
    /// Normalized visual interaction.
    visual_hat: Tensor,
    /// Per-row L1 norm plus epsilon.
    norms: Vec<f32>,
    hidden: DenseCache,
    output: DenseCache,
}

impl FusionHead {
    pub fn new(num_users: usize, num_items: usize, latent_dim: usize, rng: &mut StdRng) -> Self {
        Self {
            user_latents: EmbeddingTable::new(num_users, latent_dim, rng),
            item_latents: EmbeddingTable::new(num_items, latent_dim, rng),
            hidden: Dense::new(3 * latent_dim, latent_dim, Activation::Relu, rng),
            output: Dense::new(latent_dim, 1, Activation::None, rng),
            latent_dim,
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Predicts ratings `[batch]` without caching.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        user_ids: &[usize],
        item_ids: &[usize],
        user_text: &Tensor,
        item_text: &Tensor,
        visual_user: &Tensor,
        visual_item: &Tensor,
    ) -> ModelResult<Tensor> {
        let (pred, _) = self.run(
            user_ids,
            item_ids,
            user_text,
            item_text,
            visual_user,
            visual_item,
            false,
        )?;
        Ok(pred)
    }

    /// Predicts ratings, returning the backward cache.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_train(
        &self,
        user_ids: &[usize],
        item_ids: &[usize],
        user_text: &Tensor,
        item_text: &Tensor,
        visual_user: &Tensor,
        visual_item: &Tensor,
    ) -> ModelResult<(Tensor, FusionCache)> {
        let (pred, cache) = self.run(
            user_ids,
            item_ids,
            user_text,
            item_text,
            visual_user,
            visual_item,
            true,
        )?;
        let cache = cache.ok_or_else(|| {
            ModelError::Checkpoint("fusion cache missing after training forward".to_string())
        })?;
        Ok((pred, cache))
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        user_ids: &[usize],
        item_ids: &[usize],
        user_text: &Tensor,
        item_text: &Tensor,
        visual_user: &Tensor,
        visual_item: &Tensor,
        keep_cache: bool,
    ) -> ModelResult<(Tensor, Option<FusionCache>)> {
        let batch = user_ids.len();
        let dim = self.latent_dim;

        let mf_user = self.user_latents.lookup(user_ids)?;
        let mf_item = self.item_latents.lookup(item_ids)?;

        let text = user_text.mul(item_text);
        let visual_raw = visual_user.mul(visual_item);
        let mf = mf_user.mul(&mf_item);

        // Row-wise L1 normalization; a zero row stays zero.
        let mut norms = Vec::with_capacity(batch);
        let mut visual_hat = visual_raw.clone();
        for b in 0..batch {
            let norm: f32 = visual_raw.row(b).iter().map(|v| v.abs()).sum::<f32>() + L1_EPS;
            norms.push(norm);
            for v in visual_hat.row_mut(b) {
                *v /= norm;
            }
        }

        let mut fused = vec![0.0f32; batch * 3 * dim];
        for b in 0..batch {
            let dst = &mut fused[b * 3 * dim..(b + 1) * 3 * dim];
            dst[..dim].copy_from_slice(text.row(b));
            dst[dim..2 * dim].copy_from_slice(visual_hat.row(b));
            dst[2 * dim..].copy_from_slice(mf.row(b));
        }
        let fused = Tensor::from_data(&[batch, 3 * dim], fused);
        // Checked before the head: ReLU would silently swallow a NaN.
        if !fused.is_finite() {
            return Err(ModelError::NumericInstability {
                context: "fused interactions".to_string(),
            });
        }

        let (pred, caches) = if keep_cache {
            let (h, hidden_cache) = self.hidden.forward_train(&fused)?;
            let (p, output_cache) = self.output.forward_train(&h)?;
            (p, Some((hidden_cache, output_cache)))
        } else {
            let h = self.hidden.forward(&fused)?;
            (self.output.forward(&h)?, None)
        };
        let pred = pred.reshape(&[batch]);
        if !pred.is_finite() {
            return Err(ModelError::NumericInstability {
                context: "rating head".to_string(),
            });
        }

        let cache = caches.map(|(hidden, output)| FusionCache {
            user_ids: user_ids.to_vec(),
            item_ids: item_ids.to_vec(),
            user_text: user_text.clone(),
            item_text: item_text.clone(),
            visual_user: visual_user.clone(),
            visual_item: visual_item.clone(),
            mf_user,
            mf_item,
            visual_raw,
            visual_hat,
            norms,
            hidden,
            output,
        });
        Ok((pred, cache))
    }

    /// Backpropagates `d_pred` (`[batch]`), accumulating head and latent
    /// gradients and returning the gradients for the encoder outputs.
    pub fn backward(&mut self, d_pred: &Tensor, cache: &FusionCache) -> ModelResult<FusionGrads> {
        let batch = cache.user_ids.len();
        let dim = self.latent_dim;

        let d_out = d_pred.reshape(&[batch, 1]);
        let d_hidden = self.output.backward(&d_out, &cache.output)?;
        let d_fused = self.hidden.backward(&d_hidden, &cache.hidden)?;

        let mut d_text = vec![0.0f32; batch * dim];
        let mut d_visual_hat = vec![0.0f32; batch * dim];
        let mut d_mf = vec![0.0f32; batch * dim];
        for b in 0..batch {
            let src = d_fused.row(b);
            d_text[b * dim..(b + 1) * dim].copy_from_slice(&src[..dim]);
            d_visual_hat[b * dim..(b + 1) * dim].copy_from_slice(&src[dim..2 * dim]);
            d_mf[b * dim..(b + 1) * dim].copy_from_slice(&src[2 * dim..]);
        }
        let d_text = Tensor::from_data(&[batch, dim], d_text);
        let d_mf = Tensor::from_data(&[batch, dim], d_mf);

        // L1 normalization backward:
        // d v_j = (d v_hat_j - (d v_hat . v_hat) * sign(v_j)) / norm
        let mut d_visual_raw = vec![0.0f32; batch * dim];
        for b in 0..batch {
            let dv_hat = &d_visual_hat[b * dim..(b + 1) * dim];
            let dot: f32 = dv_hat
                .iter()
                .zip(cache.visual_hat.row(b).iter())
                .map(|(a, b)| a * b)
                .sum();
            for j in 0..dim {
                let v = cache.visual_raw.row(b)[j];
                let sign = if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    0.0
                };
                d_visual_raw[b * dim + j] = (dv_hat[j] - dot * sign) / cache.norms[b];
            }
        }
        let d_visual_raw = Tensor::from_data(&[batch, dim], d_visual_raw);

        self.user_latents
            .accumulate_grad(&cache.user_ids, &d_mf.mul(&cache.mf_item))?;
        self.item_latents
            .accumulate_grad(&cache.item_ids, &d_mf.mul(&cache.mf_user))?;

        Ok(FusionGrads {
            d_user_text: d_text.mul(&cache.item_text),
            d_item_text: d_text.mul(&cache.user_text),
            d_visual_user: d_visual_raw.mul(&cache.visual_item),
            d_visual_item: d_visual_raw.mul(&cache.visual_user),
        })
    }
}

impl Parameterized for FusionHead {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.user_latents
            .visit_params(&join(prefix, "user_latents"), f);
        self.item_latents
            .visit_params(&join(prefix, "item_latents"), f);
        self.hidden.visit_params(&join(prefix, "hidden"), f);
        self.output.visit_params(&join(prefix, "output"), f);
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        self.user_latents
            .visit_params_mut(&join(prefix, "user_latents"), f);
        self.item_latents
            .visit_params_mut(&join(prefix, "item_latents"), f);
        self.hidden.visit_params_mut(&join(prefix, "hidden"), f);
        self.output.visit_params_mut(&join(prefix, "output"), f);
    }

    fn zero_grads(&mut self) {
        self.user_latents.zero_grads();
        self.item_latents.zero_grads();
        self.hidden.zero_grads();
        self.output.zero_grads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuserate_layers::Initializer;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(21)
    }

    fn rand(shape: &[usize], seed: u64) -> Tensor {
        Initializer::Normal {
            mean: 0.0,
            std: 0.5,
        }
        .initialize(shape, &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_forward_shape_and_finiteness() {
        let head = FusionHead::new(4, 6, 3, &mut rng());
        let pred = head
            .forward(
                &[0, 3],
                &[1, 5],
                &rand(&[2, 3], 1),
                &rand(&[2, 3], 2),
                &rand(&[2, 3], 3),
                &rand(&[2, 3], 4),
            )
            .unwrap();
        assert_eq!(pred.shape(), &[2]);
        assert!(pred.is_finite());
    }

    #[test]
    fn test_zero_visual_interaction_stays_zero() {
        let head = FusionHead::new(2, 2, 3, &mut rng());
        let zeros = Tensor::zeros(&[1, 3]);
        // Forward must not divide by zero when both visual latents are zero
        let pred = head
            .forward(
                &[0],
                &[0],
                &rand(&[1, 3], 5),
                &rand(&[1, 3], 6),
                &zeros,
                &zeros,
            )
            .unwrap();
        assert!(pred.is_finite());
    }

    #[test]
    fn test_non_finite_prediction_is_fatal() {
        let head = FusionHead::new(2, 2, 3, &mut rng());
        let bad = Tensor::from_data(&[1, 3], vec![f32::NAN, 0.0, 0.0]);
        let err = head
            .forward(&[0], &[0], &bad, &rand(&[1, 3], 7), &bad, &bad)
            .unwrap_err();
        assert!(matches!(err, ModelError::NumericInstability { .. }));
    }

    #[test]
    fn test_backward_gradient_check_visual_path() {
        // The visual path crosses the L1 normalization, the trickiest part
        // of the head's backward.
        let mut head = FusionHead::new(2, 2, 3, &mut rng());
        let user_text = rand(&[1, 3], 8);
        let item_text = rand(&[1, 3], 9);
        let visual_user = rand(&[1, 3], 10);
        let visual_item = rand(&[1, 3], 11);

        let (pred, cache) = head
            .forward_train(&[0], &[1], &user_text, &item_text, &visual_user, &visual_item)
            .unwrap();
        let grads = head
            .backward(&Tensor::ones(pred.shape()), &cache)
            .unwrap();

        let eps = 1e-3;
        let idx = 1;
        let loss_at = |delta: f32| {
            let mut v = visual_user.clone();
            v.data_mut()[idx] += delta;
            head.forward(&[0], &[1], &user_text, &item_text, &v, &visual_item)
                .unwrap()
                .sum()
        };
        let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
        assert!(
            (grads.d_visual_user.data()[idx] - numeric).abs() < 1e-2,
            "analytic {} vs numeric {numeric}",
            grads.d_visual_user.data()[idx]
        );
    }

    #[test]
    fn test_backward_gradient_check_mf_path() {
        let mut head = FusionHead::new(3, 3, 2, &mut rng());
        let user_text = rand(&[1, 2], 12);
        let item_text = rand(&[1, 2], 13);
        let visual = rand(&[1, 2], 14);

        let (pred, cache) = head
            .forward_train(&[2], &[0], &user_text, &item_text, &visual, &visual)
            .unwrap();
        head.backward(&Tensor::ones(pred.shape()), &cache).unwrap();

        let mut analytic = 0.0;
        head.visit_params_mut("", &mut |p| {
            if p.name == "user_latents.weights" {
                if let Some(grad) = p.grad {
                    // Row 2, component 0
                    analytic = grad.row(2)[0];
                }
            }
        });

        let eps = 1e-3;
        let loss_at = |delta: f32| {
            let mut h = head.clone();
            h.visit_params_mut("", &mut |p| {
                if p.name == "user_latents.weights" {
                    p.value.row_mut(2)[0] += delta;
                }
            });
            h.forward(&[2], &[0], &user_text, &item_text, &visual, &visual)
                .unwrap()
                .sum()
        };
        let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
        assert!(
            (analytic - numeric).abs() < 1e-2,
            "analytic {analytic} vs numeric {numeric}"
        );
    }
}
