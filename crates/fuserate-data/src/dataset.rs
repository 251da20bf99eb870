//! Sample records and the in-memory sample set.

use crate::error::{DataError, DataResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// One rating interaction.
///
/// `user_sentences` holds sentences drawn from the user's past review text
/// and `item_sentences` from reviews written about the item. `photo_paths`
/// points at the item's photos on disk; missing or undecodable photos are
/// replaced by zero placeholders at batch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// User index into the latent-factor table.
    pub user_id: usize,
    /// Item index into the latent-factor table.
    pub item_id: usize,
    /// Observed rating, the regression target.
    pub rating: f32,
    /// Sentences from the user's review history.
    pub user_sentences: Vec<String>,
    /// Sentences from reviews of the item.
    pub item_sentences: Vec<String>,
    /// Paths to the item's photos.
    #[serde(default)]
    pub photo_paths: Vec<String>,
}

/// An owned collection of samples.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    /// Wraps an existing vector of samples.
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Loads a JSON array of samples from `path`.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> DataResult<Self> {
        let file = File::open(path.as_ref())?;
        let samples: Vec<Sample> = serde_json::from_reader(BufReader::new(file))?;
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Shuffles the samples in place.
    pub fn shuffle(&mut self, rng: &mut StdRng) {
        self.samples.shuffle(rng);
    }

    /// Splits off the trailing `fraction` of samples into a second set.
    ///
    /// Used to carve a validation set out of the training data. `fraction`
    /// must lie in `(0, 1)`.
    pub fn split_off_fraction(mut self, fraction: f32) -> DataResult<(Self, Self)> {
        if !(0.0..1.0).contains(&fraction) || fraction == 0.0 {
            return Err(DataError::Batching(format!(
                "split fraction must be in (0, 1), got {fraction}"
            )));
        }
        let held = ((self.samples.len() as f32) * fraction).round() as usize;
        let held = held.clamp(1, self.samples.len().saturating_sub(1).max(1));
        let tail = self.samples.split_off(self.samples.len() - held);
        Ok((Self { samples: self.samples }, Self { samples: tail }))
    }

    /// Largest user id plus one, for sizing the user latent table.
    pub fn num_users(&self) -> usize {
        self.samples.iter().map(|s| s.user_id + 1).max().unwrap_or(0)
    }

    /// Largest item id plus one, for sizing the item latent table.
    pub fn num_items(&self) -> usize {
        self.samples.iter().map(|s| s.item_id + 1).max().unwrap_or(0)
    }
}
