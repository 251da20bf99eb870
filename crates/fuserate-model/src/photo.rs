//! Photo encoder with review-aware gating.
//!
//! Photos pass through a small frozen convolutional backbone and a trainable
//! projection into the shared latent space. Each side's text latent is
//! projected into an attention query that gates the item's photos, so the
//! same photos pool differently for what the user tends to write about and
//! for what the item's reviews emphasize. An item with no photos pools to
//! the zero latent, which the fusion head treats as a neutral visual signal.

use crate::error::ModelResult;
use fuserate_data::PhotoBatch;
use fuserate_layers::attention::AttentionCache;
use fuserate_layers::dense::DenseCache;
use fuserate_layers::params::{join, ParamMut, Parameterized};
use fuserate_layers::{Activation, AttentionPool, Dense, Initializer, Tensor};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// One 3x3 stride-2 convolution stage with ReLU, zero padding of 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConvStage {
    /// `[out_channels, in_channels, 3, 3]`
    weight: Tensor,
    /// `[out_channels]`
    bias: Tensor,
}

impl ConvStage {
    const KERNEL: usize = 3;
    const STRIDE: usize = 2;
    const PAD: usize = 1;

    fn new(in_channels: usize, out_channels: usize, rng: &mut StdRng) -> Self {
        let fan_in = in_channels * Self::KERNEL * Self::KERNEL;
        let init = Initializer::Xavier {
            fan_in,
            fan_out: out_channels,
        };
        Self {
            weight: init.initialize(&[out_channels, in_channels, Self::KERNEL, Self::KERNEL], rng),
            bias: Tensor::zeros(&[out_channels]),
        }
    }

    fn out_edge(in_edge: usize) -> usize {
        (in_edge + 2 * Self::PAD - Self::KERNEL) / Self::STRIDE + 1
    }

    /// Forward over `[n, in_channels, edge, edge]`.
    fn forward(&self, input: &Tensor) -> Tensor {
        let n = input.shape()[0];
        let in_c = input.shape()[1];
        let edge = input.shape()[2];
        let out_c = self.weight.shape()[0];
        let out_edge = Self::out_edge(edge);

        let mut out = vec![0.0f32; n * out_c * out_edge * out_edge];
        for img in 0..n {
            for oc in 0..out_c {
                for oy in 0..out_edge {
                    for ox in 0..out_edge {
                        let mut acc = self.bias.data()[oc];
                        for ic in 0..in_c {
                            for ky in 0..Self::KERNEL {
                                let y = oy * Self::STRIDE + ky;
                                if y < Self::PAD || y >= edge + Self::PAD {
                                    continue;
                                }
                                let y = y - Self::PAD;
                                for kx in 0..Self::KERNEL {
                                    let x = ox * Self::STRIDE + kx;
                                    if x < Self::PAD || x >= edge + Self::PAD {
                                        continue;
                                    }
                                    let x = x - Self::PAD;
                                    let w = self.weight.data()
                                        [((oc * in_c + ic) * Self::KERNEL + ky) * Self::KERNEL + kx];
                                    let v = input.data()[((img * in_c + ic) * edge + y) * edge + x];
                                    acc += w * v;
                                }
                            }
                        }
                        out[((img * out_c + oc) * out_edge + oy) * out_edge + ox] = acc.max(0.0);
                    }
                }
            }
        }
        Tensor::from_data(&[n, out_c, out_edge, out_edge], out)
    }
}

/// Frozen convolutional feature extractor.
///
/// Three stride-2 stages followed by global average pooling. The weights are
/// fixed at construction (or overwritten from a checkpoint) and receive no
/// gradient; only the projection layers downstream of it are trained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvBackbone {
    stages: Vec<ConvStage>,
    feature_dim: usize,
}

impl ConvBackbone {
    pub fn new(feature_dim: usize, rng: &mut StdRng) -> Self {
        let channels = [3, 8, 16, feature_dim];
        let stages = channels
            .windows(2)
            .map(|w| ConvStage::new(w[0], w[1], rng))
            .collect();
        Self {
            stages,
            feature_dim,
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Extracts pooled features `[n, feature_dim]` from `[n, 3, edge, edge]`.
    pub fn forward(&self, pixels: &Tensor) -> Tensor {
        let mut current = pixels.clone();
        for stage in &self.stages {
            current = stage.forward(&current);
        }
        let n = current.shape()[0];
        let channels = current.shape()[1];
        let hw = current.shape()[2] * current.shape()[3];
        let mut pooled = vec![0.0f32; n * channels];
        for img in 0..n {
            for c in 0..channels {
                let start = (img * channels + c) * hw;
                let sum: f32 = current.data()[start..start + hw].iter().sum();
                pooled[img * channels + c] = sum / hw as f32;
            }
        }
        Tensor::from_data(&[n, channels], pooled)
    }
}

impl Parameterized for ConvBackbone {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        for (i, stage) in self.stages.iter().enumerate() {
            f(&join(prefix, &format!("stage{i}.weight")), &stage.weight);
            f(&join(prefix, &format!("stage{i}.bias")), &stage.bias);
        }
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        for (i, stage) in self.stages.iter_mut().enumerate() {
            f(ParamMut {
                name: join(prefix, &format!("stage{i}.weight")),
                value: &mut stage.weight,
                grad: None,
            });
            f(ParamMut {
                name: join(prefix, &format!("stage{i}.bias")),
                value: &mut stage.bias,
                grad: None,
            });
        }
    }

    fn zero_grads(&mut self) {}
}

/// Visual encoder producing one gated latent per side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoNetwork {
    backbone: ConvBackbone,
    /// Backbone features into the shared latent space.
    photo_proj: Dense,
    /// Text latents into gating queries, one per side.
    topic_user: Dense,
    topic_item: Dense,
    gate: AttentionPool,
    latent_dim: usize,
}

/// Gated visual latents `[batch, latent_dim]`, zero when an item has no photos.
#[derive(Debug, Clone)]
pub struct PhotoOutput {
    pub visual_user: Tensor,
    pub visual_item: Tensor,
}

/// Cached values from a photo forward pass.
#[derive(Debug)]
pub struct PhotoCache {
    proj: DenseCache,
    topic_user: DenseCache,
    topic_item: DenseCache,
    gate_user: AttentionCache,
    gate_item: AttentionCache,
    batch: usize,
    max_photos: usize,
}

impl PhotoNetwork {
    pub fn new(
        feature_dim: usize,
        att_dim: usize,
        latent_dim: usize,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            backbone: ConvBackbone::new(feature_dim, rng),
            photo_proj: Dense::new(feature_dim, latent_dim, Activation::Relu, rng),
            topic_user: Dense::new(latent_dim, att_dim, Activation::Tanh, rng),
            topic_item: Dense::new(latent_dim, att_dim, Activation::Tanh, rng),
            gate: AttentionPool::external(latent_dim, att_dim, rng),
            latent_dim,
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn photo_features(&self, photos: &PhotoBatch) -> Tensor {
        let batch = photos.batch_size();
        let max_photos = photos.max_photos();
        let size = photos.size();
        let flat = photos
            .pixels()
            .reshape(&[batch * max_photos, 3, size, size]);
        self.backbone.forward(&flat)
    }

    /// Encodes photos under both text queries without caching.
    pub fn forward(
        &self,
        photos: &PhotoBatch,
        user_text: &Tensor,
        item_text: &Tensor,
    ) -> ModelResult<PhotoOutput> {
        let features = self.photo_features(photos);
        let latents = self
            .photo_proj
            .forward(&features)?
            .reshape(&[photos.batch_size(), photos.max_photos(), self.latent_dim]);
        let q_user = self.topic_user.forward(user_text)?;
        let q_item = self.topic_item.forward(item_text)?;
        let pooled_user = self.gate.forward(&latents, photos.counts(), Some(&q_user))?;
        let pooled_item = self.gate.forward(&latents, photos.counts(), Some(&q_item))?;
        Ok(PhotoOutput {
            visual_user: pooled_user.pooled,
            visual_item: pooled_item.pooled,
        })
    }

    /// Encodes photos under both text queries, returning the backward cache.
    pub fn forward_train(
        &self,
        photos: &PhotoBatch,
        user_text: &Tensor,
        item_text: &Tensor,
    ) -> ModelResult<(PhotoOutput, PhotoCache)> {
        let features = self.photo_features(photos);
        let (latents, proj) = self.photo_proj.forward_train(&features)?;
        let latents =
            latents.reshape(&[photos.batch_size(), photos.max_photos(), self.latent_dim]);
        let (q_user, topic_user) = self.topic_user.forward_train(user_text)?;
        let (q_item, topic_item) = self.topic_item.forward_train(item_text)?;
        let (pooled_user, gate_user) =
            self.gate
                .forward_train(&latents, photos.counts(), Some(&q_user))?;
        let (pooled_item, gate_item) =
            self.gate
                .forward_train(&latents, photos.counts(), Some(&q_item))?;
        Ok((
            PhotoOutput {
                visual_user: pooled_user.pooled,
                visual_item: pooled_item.pooled,
            },
            PhotoCache {
                proj,
                topic_user,
                topic_item,
                gate_user,
                gate_item,
                batch: photos.batch_size(),
                max_photos: photos.max_photos(),
            },
        ))
    }

    /// Backpropagates through gating and projection; returns the gradients
    /// flowing back into the two text latents. The backbone is frozen, so
    /// feature gradients stop at the projection input.
    pub fn backward(
        &mut self,
        d_visual_user: &Tensor,
        d_visual_item: &Tensor,
        cache: &PhotoCache,
    ) -> ModelResult<(Tensor, Tensor)> {
        let (d_lat_user, dq_user) = self.gate.backward(d_visual_user, &cache.gate_user)?;
        let (d_lat_item, dq_item) = self.gate.backward(d_visual_item, &cache.gate_item)?;

        let dq_user = dq_user.ok_or_else(missing_query_grad)?;
        let dq_item = dq_item.ok_or_else(missing_query_grad)?;
        let d_user_text = self.topic_user.backward(&dq_user, &cache.topic_user)?;
        let d_item_text = self.topic_item.backward(&dq_item, &cache.topic_item)?;

        let d_latents = d_lat_user
            .add(&d_lat_item)
            .reshape(&[cache.batch * cache.max_photos, self.latent_dim]);
        self.photo_proj.backward(&d_latents, &cache.proj)?;

        Ok((d_user_text, d_item_text))
    }
}

fn missing_query_grad() -> crate::error::ModelError {
    crate::error::ModelError::Checkpoint(
        "gating backward produced no query gradient".to_string(),
    )
}

impl Parameterized for PhotoNetwork {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.backbone.visit_params(&join(prefix, "backbone"), f);
        self.photo_proj.visit_params(&join(prefix, "photo_proj"), f);
        self.topic_user.visit_params(&join(prefix, "topic_user"), f);
        self.topic_item.visit_params(&join(prefix, "topic_item"), f);
        self.gate.visit_params(&join(prefix, "gate"), f);
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        self.backbone.visit_params_mut(&join(prefix, "backbone"), f);
        self.photo_proj
            .visit_params_mut(&join(prefix, "photo_proj"), f);
        self.topic_user
            .visit_params_mut(&join(prefix, "topic_user"), f);
        self.topic_item
            .visit_params_mut(&join(prefix, "topic_item"), f);
        self.gate.visit_params_mut(&join(prefix, "gate"), f);
    }

    fn zero_grads(&mut self) {
        self.backbone.zero_grads();
        self.photo_proj.zero_grads();
        self.topic_user.zero_grads();
        self.topic_item.zero_grads();
        self.gate.zero_grads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuserate_data::{BatchBuilder, Sample, WordEmbeddings};
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(9)
    }

    fn photo_batch(paths: Vec<String>) -> PhotoBatch {
        let vocab = WordEmbeddings::from_vectors(vec![("ok".to_string(), vec![0.1, 0.2])]).unwrap();
        let sample = Sample {
            user_id: 0,
            item_id: 0,
            rating: 3.0,
            user_sentences: vec!["ok".to_string()],
            item_sentences: vec!["ok".to_string()],
            photo_paths: paths,
        };
        BatchBuilder::new(1, 8)
            .build(&[sample], &vocab)
            .unwrap()
            .remove(0)
            .photos
    }

    #[test]
    fn test_backbone_output_shape() {
        let backbone = ConvBackbone::new(12, &mut rng());
        let pixels = Tensor::ones(&[2, 3, 16, 16]);
        let features = backbone.forward(&pixels);
        assert_eq!(features.shape(), &[2, 12]);
        assert!(features.is_finite());
    }

    #[test]
    fn test_backbone_is_frozen() {
        let mut backbone = ConvBackbone::new(4, &mut rng());
        let mut any_grad = false;
        backbone.visit_params_mut("backbone", &mut |p| {
            any_grad |= p.grad.is_some();
        });
        assert!(!any_grad);
    }

    #[test]
    fn test_zero_photo_item_pools_to_zero() {
        let net = PhotoNetwork::new(4, 3, 5, &mut rng());
        let photos = photo_batch(vec![]);
        assert_eq!(photos.max_photos(), 0);

        let user_text = Tensor::ones(&[1, 5]);
        let item_text = Tensor::ones(&[1, 5]);
        let out = net.forward(&photos, &user_text, &item_text).unwrap();
        assert!(out.visual_user.data().iter().all(|&v| v == 0.0));
        assert!(out.visual_item.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_missing_photo_placeholder_still_forwards() {
        let net = PhotoNetwork::new(4, 3, 5, &mut rng());
        let photos = photo_batch(vec!["/nonexistent/a.jpg".to_string()]);
        assert_eq!(photos.counts(), &[1]);

        let user_text = Tensor::ones(&[1, 5]);
        let item_text = Tensor::ones(&[1, 5]);
        let out = net.forward(&photos, &user_text, &item_text).unwrap();
        assert_eq!(out.visual_user.shape(), &[1, 5]);
        assert!(out.visual_user.is_finite());
    }

    #[test]
    fn test_backward_flows_into_text_latents() {
        let mut net = PhotoNetwork::new(4, 3, 5, &mut rng());
        let photos = photo_batch(vec![
            "/nonexistent/a.jpg".to_string(),
            "/nonexistent/b.jpg".to_string(),
        ]);

        let user_text = Tensor::from_data(&[1, 5], vec![0.3, -0.2, 0.5, 0.1, -0.4]);
        let item_text = Tensor::from_data(&[1, 5], vec![-0.1, 0.2, 0.3, -0.5, 0.4]);
        let (out, cache) = net.forward_train(&photos, &user_text, &item_text).unwrap();

        let d_user = Tensor::ones(out.visual_user.shape());
        let d_item = Tensor::ones(out.visual_item.shape());
        let (d_user_text, d_item_text) = net.backward(&d_user, &d_item, &cache).unwrap();
        assert_eq!(d_user_text.shape(), &[1, 5]);
        assert_eq!(d_item_text.shape(), &[1, 5]);

        // Numeric check against the user text query path
        let eps = 1e-3;
        let loss_at = |delta: f32| {
            let mut t = user_text.clone();
            t.data_mut()[0] += delta;
            net.forward(&photos, &t, &item_text)
                .unwrap()
                .visual_user
                .sum()
        };
        let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
        assert!(
            (d_user_text.data()[0] - numeric).abs() < 1e-2,
            "analytic {} vs numeric {numeric}",
            d_user_text.data()[0]
        );
    }
}
