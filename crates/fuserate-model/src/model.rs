//! The assembled multi-modal rating model.

use crate::error::{ModelError, ModelResult};
use crate::fusion::{FusionCache, FusionHead};
use crate::photo::{PhotoCache, PhotoNetwork};
use crate::review::{ReviewCache, ReviewNetwork};
use fuserate_data::Batch;
use fuserate_layers::params::{join, ParamMut, Parameterized};
use fuserate_layers::{EmbeddingTable, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters for [`RatingModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// GRU hidden size for sentence encoding.
    pub gru_hidden: usize,
    /// Attention projection size, shared by sentence attention and photo gating.
    pub att_dim: usize,
    /// Shared latent dimension of all three modalities.
    pub latent_dim: usize,
    /// Backbone feature dimension.
    pub photo_feature_dim: usize,
    /// Number of rows in the user latent table.
    pub num_users: usize,
    /// Number of rows in the item latent table.
    pub num_items: usize,
    /// Seed for parameter initialization.
    pub seed: u64,
}

impl ModelConfig {
    /// A small configuration suitable for tests and smoke runs.
    pub fn small(num_users: usize, num_items: usize) -> Self {
        Self {
            gru_hidden: 8,
            att_dim: 6,
            latent_dim: 8,
            photo_feature_dim: 8,
            num_users,
            num_items,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// The full review + photo + matrix-factorization rating predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingModel {
    review: ReviewNetwork,
    photo: PhotoNetwork,
    fusion: FusionHead,
    config: ModelConfig,
}

/// Cached values from a full forward pass.
#[derive(Debug)]
pub struct ModelCache {
    review: ReviewCache,
    photo: PhotoCache,
    fusion: FusionCache,
}

impl RatingModel {
    /// Builds a model around pretrained word vectors.
    ///
    /// `word_weights` is the `[vocab, dim]` table produced by the embedding
    /// loader, unknown row first; it is kept frozen.
    pub fn new(config: ModelConfig, word_weights: Tensor) -> ModelResult<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let words = EmbeddingTable::from_pretrained(word_weights)?;
        let review = ReviewNetwork::new(
            words,
            config.gru_hidden,
            config.att_dim,
            config.latent_dim,
            &mut rng,
        );
        let photo = PhotoNetwork::new(
            config.photo_feature_dim,
            config.att_dim,
            config.latent_dim,
            &mut rng,
        );
        let fusion = FusionHead::new(
            config.num_users,
            config.num_items,
            config.latent_dim,
            &mut rng,
        );
        Ok(Self {
            review,
            photo,
            fusion,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Predicts ratings `[batch]` for a padded batch.
    pub fn forward(&self, batch: &Batch) -> ModelResult<Tensor> {
        let text = self.review.forward(&batch.user_docs, &batch.item_docs)?;
        let visual = self
            .photo
            .forward(&batch.photos, &text.user_text, &text.item_text)?;
        self.fusion.forward(
            &batch.user_ids,
            &batch.item_ids,
            &text.user_text,
            &text.item_text,
            &visual.visual_user,
            &visual.visual_item,
        )
    }

    /// Predicts ratings, returning the cache needed by [`backward`](Self::backward).
    pub fn forward_train(&self, batch: &Batch) -> ModelResult<(Tensor, ModelCache)> {
        let (text, review_cache) = self
            .review
            .forward_train(&batch.user_docs, &batch.item_docs)?;
        let (visual, photo_cache) =
            self.photo
                .forward_train(&batch.photos, &text.user_text, &text.item_text)?;
        let (pred, fusion_cache) = self.fusion.forward_train(
            &batch.user_ids,
            &batch.item_ids,
            &text.user_text,
            &text.item_text,
            &visual.visual_user,
            &visual.visual_item,
        )?;
        Ok((
            pred,
            ModelCache {
                review: review_cache,
                photo: photo_cache,
                fusion: fusion_cache,
            },
        ))
    }

    /// Backpropagates a prediction gradient, accumulating into every
    /// trainable parameter's gradient buffer.
    ///
    /// The text latents feed both the fusion head and the photo gating
    /// queries, so their gradients sum over both paths before entering the
    /// review network.
    pub fn backward(&mut self, d_pred: &Tensor, cache: &ModelCache) -> ModelResult<()> {
        let grads = self.fusion.backward(d_pred, &cache.fusion)?;
        let (d_user_from_photo, d_item_from_photo) = self.photo.backward(
            &grads.d_visual_user,
            &grads.d_visual_item,
            &cache.photo,
        )?;
        let d_user_text = grads.d_user_text.add(&d_user_from_photo);
        let d_item_text = grads.d_item_text.add(&d_item_from_photo);
        self.review
            .backward(&d_user_text, &d_item_text, &cache.review)?;
        Ok(())
    }

    /// All parameters by dotted name, including frozen ones.
    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        let mut state = BTreeMap::new();
        self.visit_params("", &mut |name, value| {
            state.insert(name.to_string(), value.clone());
        });
        state
    }

    /// Loads a state dict produced by [`state_dict`](Self::state_dict).
    ///
    /// Every parameter must be present with a matching shape.
    pub fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor>) -> ModelResult<()> {
        let mut problems: Vec<String> = Vec::new();
        self.visit_params_mut("", &mut |p| match state.get(&p.name) {
            Some(saved) if saved.shape() == p.value.shape() => {
                p.value.data_mut().copy_from_slice(saved.data());
            }
            Some(saved) => problems.push(format!(
                "{}: shape {:?} does not match {:?}",
                p.name,
                saved.shape(),
                p.value.shape()
            )),
            None => problems.push(format!("{}: missing from checkpoint", p.name)),
        });
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Checkpoint(problems.join("; ")))
        }
    }
}

impl Parameterized for RatingModel {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.review.visit_params(&join(prefix, "review"), f);
        self.photo.visit_params(&join(prefix, "photo"), f);
        self.fusion.visit_params(&join(prefix, "fusion"), f);
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        self.review.visit_params_mut(&join(prefix, "review"), f);
        self.photo.visit_params_mut(&join(prefix, "photo"), f);
        self.fusion.visit_params_mut(&join(prefix, "fusion"), f);
    }

    fn zero_grads(&mut self) {
        self.review.zero_grads();
        self.photo.zero_grads();
        self.fusion.zero_grads();
    }
}
