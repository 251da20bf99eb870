//! Review-text encoder.
//!
//! Each document (the user's review history, or the reviews of an item) is a
//! padded grid of sentences. Every sentence runs through a shared GRU whose
//! final state summarizes it; sentence summaries are pooled with learned
//! attention and a per-side dense projection maps the pooled vector into the
//! shared latent space. Rows with no sentences at all take a learned default
//! latent instead of a projection of nothing.
//!
//! The GRU and the sentence attention are shared between the user and item
//! sides; only the final projection and the empty-document default differ.

use crate::error::ModelResult;
use fuserate_data::TokenBatch;
use fuserate_layers::attention::AttentionCache;
use fuserate_layers::dense::DenseCache;
use fuserate_layers::gru::GruCache;
use fuserate_layers::params::{join, ParamMut, Parameterized};
use fuserate_layers::{
    Activation, AttentionPool, Dense, EmbeddingTable, GruEncoder, Initializer, Tensor,
};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Text encoder producing one latent per side of the interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewNetwork {
    /// Pretrained word vectors, frozen.
    words: EmbeddingTable,
    gru: GruEncoder,
    sent_attention: AttentionPool,
    project_user: Dense,
    project_item: Dense,
    /// Default latent for a user with no review text.
    empty_user: Tensor,
    /// Default latent for an item with no review text.
    empty_item: Tensor,
    empty_user_grad: Tensor,
    empty_item_grad: Tensor,
    latent_dim: usize,
}

/// Latents for both sides `[batch, latent_dim]`.
#[derive(Debug, Clone)]
pub struct ReviewOutput {
    pub user_text: Tensor,
    pub item_text: Tensor,
}

/// Cached values from both sides of a review forward pass.
#[derive(Debug)]
pub struct ReviewCache {
    user: SideCache,
    item: SideCache,
}

#[derive(Debug)]
struct SideCache {
    gru: GruCache,
    attention: AttentionCache,
    dense: DenseCache,
    sent_counts: Vec<usize>,
}

enum Side {
    User,
    Item,
}

impl ReviewNetwork {
    /// Creates a review encoder over the given frozen word table.
    pub fn new(
        words: EmbeddingTable,
        gru_hidden: usize,
        att_dim: usize,
        latent_dim: usize,
        rng: &mut StdRng,
    ) -> Self {
        let word_dim = words.dim();
        let default_init = Initializer::Normal {
            mean: 0.0,
            std: 0.1,
        };
        Self {
            gru: GruEncoder::new(word_dim, gru_hidden, rng),
            sent_attention: AttentionPool::new(gru_hidden, att_dim, rng),
            project_user: Dense::new(gru_hidden, latent_dim, Activation::Tanh, rng),
            project_item: Dense::new(gru_hidden, latent_dim, Activation::Tanh, rng),
            empty_user: default_init.initialize(&[latent_dim], rng),
            empty_item: default_init.initialize(&[latent_dim], rng),
            empty_user_grad: Tensor::zeros(&[latent_dim]),
            empty_item_grad: Tensor::zeros(&[latent_dim]),
            words,
            latent_dim,
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Encodes both documents without caching.
    pub fn forward(
        &self,
        user_docs: &TokenBatch,
        item_docs: &TokenBatch,
    ) -> ModelResult<ReviewOutput> {
        let (user_text, _) = self.forward_side(user_docs, Side::User, false)?;
        let (item_text, _) = self.forward_side(item_docs, Side::Item, false)?;
        Ok(ReviewOutput {
            user_text,
            item_text,
        })
    }

    /// Encodes both documents, returning the backward cache.
    pub fn forward_train(
        &self,
        user_docs: &TokenBatch,
        item_docs: &TokenBatch,
    ) -> ModelResult<(ReviewOutput, ReviewCache)> {
        let (user_text, user) = self.forward_side(user_docs, Side::User, true)?;
        let (item_text, item) = self.forward_side(item_docs, Side::Item, true)?;
        let cache = ReviewCache {
            user: user.ok_or_else(missing_cache)?,
            item: item.ok_or_else(missing_cache)?,
        };
        Ok((
            ReviewOutput {
                user_text,
                item_text,
            },
            cache,
        ))
    }

    fn forward_side(
        &self,
        docs: &TokenBatch,
        side: Side,
        keep_cache: bool,
    ) -> ModelResult<(Tensor, Option<SideCache>)> {
        let batch = docs.batch_size();
        let sentences = docs.max_sentences();
        let tokens = docs.max_tokens();

        // Every sentence slot becomes one GRU sequence; padding slots have
        // length zero and contribute a zero summary.
        let embedded = self
            .words
            .lookup(docs.flat_ids())?
            .reshape(&[batch * sentences, tokens, self.words.dim()]);

        let (dense, empty) = match side {
            Side::User => (&self.project_user, &self.empty_user),
            Side::Item => (&self.project_item, &self.empty_item),
        };

        if keep_cache {
            let (gru_out, gru_cache) =
                self.gru
                    .encode_train(&embedded, docs.flat_lengths(), tokens)?;
            let summaries = gru_out
                .last
                .reshape(&[batch, sentences, self.gru_hidden()]);
            let (att_out, att_cache) =
                self.sent_attention
                    .forward_train(&summaries, docs.sent_counts(), None)?;
            let (mut text, dense_cache) = dense.forward_train(&att_out.pooled)?;
            apply_empty_default(&mut text, docs.sent_counts(), empty);
            Ok((
                text,
                Some(SideCache {
                    gru: gru_cache,
                    attention: att_cache,
                    dense: dense_cache,
                    sent_counts: docs.sent_counts().to_vec(),
                }),
            ))
        } else {
            let gru_out = self.gru.encode(&embedded, docs.flat_lengths(), tokens)?;
            let summaries = gru_out
                .last
                .reshape(&[batch, sentences, self.gru_hidden()]);
            let att_out = self
                .sent_attention
                .forward(&summaries, docs.sent_counts(), None)?;
            let mut text = dense.forward(&att_out.pooled)?;
            apply_empty_default(&mut text, docs.sent_counts(), empty);
            Ok((text, None))
        }
    }

    /// Backpropagates through both sides, accumulating gradients.
    ///
    /// Input-embedding gradients stop at the frozen word table.
    pub fn backward(
        &mut self,
        d_user_text: &Tensor,
        d_item_text: &Tensor,
        cache: &ReviewCache,
    ) -> ModelResult<()> {
        self.backward_side(d_user_text, &cache.user, Side::User)?;
        self.backward_side(d_item_text, &cache.item, Side::Item)?;
        Ok(())
    }

    fn backward_side(&mut self, d_text: &Tensor, cache: &SideCache, side: Side) -> ModelResult<()> {
        // Empty-document rows bypassed the projection entirely; their
        // gradient lands on the learned default instead.
        let mut d_text = d_text.clone();
        {
            let empty_grad = match side {
                Side::User => &mut self.empty_user_grad,
                Side::Item => &mut self.empty_item_grad,
            };
            for (b, &count) in cache.sent_counts.iter().enumerate() {
                if count == 0 {
                    let row = d_text.row_mut(b);
                    for (g, r) in empty_grad.data_mut().iter_mut().zip(row.iter_mut()) {
                        *g += *r;
                        *r = 0.0;
                    }
                }
            }
        }

        let dense = match side {
            Side::User => &mut self.project_user,
            Side::Item => &mut self.project_item,
        };
        let d_pooled = dense.backward(&d_text, &cache.dense)?;
        let (d_summaries, _) = self.sent_attention.backward(&d_pooled, &cache.attention)?;

        let batch = d_summaries.shape()[0];
        let sentences = d_summaries.shape()[1];
        let hidden = self.gru_hidden();
        let d_last = d_summaries.reshape(&[batch * sentences, hidden]);
        // Word embeddings are frozen, so the input gradient is dropped.
        self.gru.backward(&d_last, None, &cache.gru)?;
        Ok(())
    }

    fn gru_hidden(&self) -> usize {
        self.gru.hidden_dim()
    }
}

fn apply_empty_default(text: &mut Tensor, sent_counts: &[usize], empty: &Tensor) {
    for (b, &count) in sent_counts.iter().enumerate() {
        if count == 0 {
            text.row_mut(b).copy_from_slice(empty.data());
        }
    }
}

fn missing_cache() -> crate::error::ModelError {
    crate::error::ModelError::Checkpoint("review cache missing after training forward".to_string())
}

impl Parameterized for ReviewNetwork {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.words.visit_params(&join(prefix, "words"), f);
        self.gru.visit_params(&join(prefix, "gru"), f);
        self.sent_attention
            .visit_params(&join(prefix, "sent_attention"), f);
        self.project_user
            .visit_params(&join(prefix, "project_user"), f);
        self.project_item
            .visit_params(&join(prefix, "project_item"), f);
        f(&join(prefix, "empty_user"), &self.empty_user);
        f(&join(prefix, "empty_item"), &self.empty_item);
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        self.words.visit_params_mut(&join(prefix, "words"), f);
        self.gru.visit_params_mut(&join(prefix, "gru"), f);
        self.sent_attention
            .visit_params_mut(&join(prefix, "sent_attention"), f);
        self.project_user
            .visit_params_mut(&join(prefix, "project_user"), f);
        self.project_item
            .visit_params_mut(&join(prefix, "project_item"), f);
        f(ParamMut {
            name: join(prefix, "empty_user"),
            value: &mut self.empty_user,
            grad: Some(&mut self.empty_user_grad),
        });
        f(ParamMut {
            name: join(prefix, "empty_item"),
            value: &mut self.empty_item,
            grad: Some(&mut self.empty_item_grad),
        });
    }

    fn zero_grads(&mut self) {
        self.words.zero_grads();
        self.gru.zero_grads();
        self.sent_attention.zero_grads();
        self.project_user.zero_grads();
        self.project_item.zero_grads();
        self.empty_user_grad.fill_zero();
        self.empty_item_grad.fill_zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuserate_data::{BatchBuilder, Sample, WordEmbeddings};
    use rand::SeedableRng;

    fn vocab() -> WordEmbeddings {
        WordEmbeddings::from_vectors(vec![
            ("clean".to_string(), vec![0.4, -0.1, 0.2]),
            ("room".to_string(), vec![-0.3, 0.5, 0.1]),
            ("great".to_string(), vec![0.2, 0.2, -0.4]),
            ("view".to_string(), vec![0.1, -0.2, 0.3]),
        ])
        .unwrap()
    }

    fn network(vocab: &WordEmbeddings) -> ReviewNetwork {
        let mut rng = StdRng::seed_from_u64(3);
        let words = EmbeddingTable::from_pretrained(vocab.weights().clone()).unwrap();
        ReviewNetwork::new(words, 5, 4, 6, &mut rng)
    }

    fn batch(samples: &[Sample], vocab: &WordEmbeddings) -> fuserate_data::Batch {
        BatchBuilder::new(samples.len(), 4)
            .build(samples, vocab)
            .unwrap()
            .remove(0)
    }

    fn sample(user: &[&str], item: &[&str]) -> Sample {
        Sample {
            user_id: 0,
            item_id: 0,
            rating: 4.0,
            user_sentences: user.iter().map(|s| s.to_string()).collect(),
            item_sentences: item.iter().map(|s| s.to_string()).collect(),
            photo_paths: vec![],
        }
    }

    #[test]
    fn test_forward_shapes() {
        let vocab = vocab();
        let net = network(&vocab);
        let batch = batch(
            &[
                sample(&["clean room", "great view"], &["great room"]),
                sample(&["view"], &["clean view great"]),
            ],
            &vocab,
        );
        let out = net.forward(&batch.user_docs, &batch.item_docs).unwrap();
        assert_eq!(out.user_text.shape(), &[2, 6]);
        assert_eq!(out.item_text.shape(), &[2, 6]);
        assert!(out.user_text.is_finite());
    }

    #[test]
    fn test_empty_document_takes_learned_default() {
        let vocab = vocab();
        let net = network(&vocab);
        // Punctuation-only review tokenizes to nothing
        let batch = batch(&[sample(&["..."], &["clean room"])], &vocab);
        assert_eq!(batch.user_docs.sent_counts(), &[0]);

        let out = net.forward(&batch.user_docs, &batch.item_docs).unwrap();
        assert_eq!(out.user_text.row(0), net.empty_user.data());
    }

    #[test]
    fn test_train_matches_eval_forward() {
        let vocab = vocab();
        let net = network(&vocab);
        let batch = batch(&[sample(&["clean room great"], &["view"])], &vocab);

        let eval = net.forward(&batch.user_docs, &batch.item_docs).unwrap();
        let (train, _) = net
            .forward_train(&batch.user_docs, &batch.item_docs)
            .unwrap();
        assert_eq!(eval.user_text.data(), train.user_text.data());
        assert_eq!(eval.item_text.data(), train.item_text.data());
    }

    #[test]
    fn test_backward_accumulates_and_empty_rows_hit_default() {
        let vocab = vocab();
        let mut net = network(&vocab);
        let batch = batch(&[sample(&["..."], &["clean room"])], &vocab);

        let (out, cache) = net
            .forward_train(&batch.user_docs, &batch.item_docs)
            .unwrap();
        let d_user = Tensor::ones(out.user_text.shape());
        let d_item = Tensor::ones(out.item_text.shape());
        net.backward(&d_user, &d_item, &cache).unwrap();

        // The empty user row routed its whole gradient to the default latent
        assert!(net.empty_user_grad.data().iter().all(|&g| (g - 1.0).abs() < 1e-6));
        // The item side flowed through the projection instead
        let mut project_item_grad_nonzero = false;
        net.visit_params_mut("", &mut |p| {
            if p.name.starts_with("project_item") {
                if let Some(grad) = p.grad {
                    project_item_grad_nonzero |= grad.data().iter().any(|&g| g != 0.0);
                }
            }
        });
        assert!(project_item_grad_nonzero);
    }

    #[test]
    fn test_gradient_check_through_projection() {
        let vocab = vocab();
        let mut net = network(&vocab);
        let batch = batch(&[sample(&["clean room great view"], &["view room"])], &vocab);

        let (out, cache) = net
            .forward_train(&batch.user_docs, &batch.item_docs)
            .unwrap();
        let d_user = Tensor::ones(out.user_text.shape());
        let d_item = Tensor::zeros(out.item_text.shape());
        net.backward(&d_user, &d_item, &cache).unwrap();

        let mut analytic = 0.0;
        net.visit_params_mut("", &mut |p| {
            if p.name == "project_user.weights" {
                if let Some(grad) = p.grad {
                    analytic = grad.data()[3];
                }
            }
        });

        let eps = 1e-3;
        let loss_at = |delta: f32| {
            let mut n = net.clone();
            n.visit_params_mut("", &mut |p| {
                if p.name == "project_user.weights" {
                    p.value.data_mut()[3] += delta;
                }
            });
            n.forward(&batch.user_docs, &batch.item_docs)
                .unwrap()
                .user_text
                .sum()
        };
        let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * eps);
        assert!(
            (analytic - numeric).abs() < 1e-2,
            "analytic {analytic} vs numeric {numeric}"
        );
    }
}
