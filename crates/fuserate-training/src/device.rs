//! Simulated multi-device execution.
//!
//! A batch is scattered into contiguous row shards, the forward pass fans
//! out across a thread per shard, and results gather back in shard order.
//! Because shards keep the parent batch's padded extents and every forward
//! is pure over `&self`, a split run produces bitwise the same per-sample
//! outputs as an unsplit one. Backward stays sequential in ascending shard
//! order so gradient accumulation is deterministic.

use crate::error::TrainingResult;
use fuserate_data::Batch;
use fuserate_layers::Tensor;
use fuserate_model::{ModelCache, ModelError, RatingModel};
use rayon::prelude::*;

/// A fixed-size group of simulated devices.
#[derive(Debug, Clone, Copy)]
pub struct DeviceMesh {
    num_devices: usize,
}

/// One shard's forward results, in scatter order.
#[derive(Debug)]
pub struct ShardForward {
    pub batch: Batch,
    pub pred: Tensor,
    pub cache: ModelCache,
}

impl DeviceMesh {
    /// Creates a mesh of `num_devices` devices; zero is clamped to one.
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices: num_devices.max(1),
        }
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Scatters, runs the forward pass in parallel, and gathers predictions
    /// back into the batch's row order.
    pub fn forward(&self, model: &RatingModel, batch: &Batch) -> TrainingResult<Tensor> {
        let shards = batch.split(self.num_devices);
        let preds = shards
            .par_iter()
            .map(|shard| model.forward(shard))
            .collect::<Result<Vec<Tensor>, ModelError>>()?;

        let mut gathered = Vec::with_capacity(batch.len());
        for pred in &preds {
            gathered.extend_from_slice(pred.data());
        }
        Ok(Tensor::from_data(&[batch.len()], gathered))
    }

    /// Like [`forward`](Self::forward) but keeps each shard's cache for the
    /// sequential backward pass.
    pub fn forward_train(
        &self,
        model: &RatingModel,
        batch: &Batch,
    ) -> TrainingResult<Vec<ShardForward>> {
        let shards = batch.split(self.num_devices);
        let results = shards
            .into_par_iter()
            .map(|shard| {
                let (pred, cache) = model.forward_train(&shard)?;
                Ok(ShardForward {
                    batch: shard,
                    pred,
                    cache,
                })
            })
            .collect::<Result<Vec<ShardForward>, ModelError>>()?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuserate_data::{BatchBuilder, Sample, WordEmbeddings};
    use fuserate_model::ModelConfig;

    fn vocab() -> WordEmbeddings {
        WordEmbeddings::from_vectors(vec![
            ("quiet".to_string(), vec![0.3, -0.2]),
            ("spacious".to_string(), vec![-0.1, 0.4]),
            ("dark".to_string(), vec![0.2, 0.1]),
        ])
        .unwrap()
    }

    fn batch(vocab: &WordEmbeddings) -> Batch {
        let samples: Vec<Sample> = (0..8)
            .map(|i| Sample {
                user_id: i,
                item_id: i % 2,
                rating: 1.0 + i as f32,
                user_sentences: match i % 3 {
                    0 => vec!["quiet spacious".to_string()],
                    1 => vec!["dark".to_string(), "quiet spacious dark".to_string()],
                    _ => vec!["dark quiet spacious quiet".to_string()],
                },
                item_sentences: vec!["spacious".to_string()],
                photo_paths: vec![],
            })
            .collect();
        BatchBuilder::new(8, 8).build(&samples, vocab).unwrap().remove(0)
    }

    #[test]
    fn test_split_forward_matches_unsplit() {
        let vocab = vocab();
        let model = RatingModel::new(ModelConfig::small(8, 2), vocab.weights().clone()).unwrap();
        let batch = batch(&vocab);

        let single = DeviceMesh::new(1).forward(&model, &batch).unwrap();
        for devices in [2, 3, 5, 8] {
            let split = DeviceMesh::new(devices).forward(&model, &batch).unwrap();
            assert_eq!(single.data(), split.data(), "{devices} devices");
        }
    }

    #[test]
    fn test_forward_train_preserves_row_order() {
        let vocab = vocab();
        let model = RatingModel::new(ModelConfig::small(8, 2), vocab.weights().clone()).unwrap();
        let batch = batch(&vocab);

        let shards = DeviceMesh::new(2).forward_train(&model, &batch).unwrap();
        let gathered: Vec<usize> = shards
            .iter()
            .flat_map(|s| s.batch.user_ids.iter().copied())
            .collect();
        assert_eq!(gathered, batch.user_ids);
        let total: usize = shards.iter().map(|s| s.pred.numel()).sum();
        assert_eq!(total, batch.len());
    }
}
