//! Padded batch construction and device splitting.
//!
//! A [`Batch`] carries everything one training step needs: token ids for the
//! user and item documents, photo pixels, latent-table ids, and ratings.
//! Padded extents are decided once per batch at build time; [`Batch::split`]
//! slices rows for the simulated devices without touching those extents, so
//! every shard sees identical tensor dimensions and per-sample outputs match
//! an unsplit run exactly.

use crate::dataset::Sample;
use crate::error::{DataError, DataResult};
use crate::photos::PhotoLoader;
use crate::vocab::WordEmbeddings;
use fuserate_layers::Tensor;

/// Tokenized review documents, padded to `[batch, max_sentences, max_tokens]`.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    ids: Vec<usize>,
    batch: usize,
    max_sentences: usize,
    max_tokens: usize,
    /// True sentence count per row.
    sent_counts: Vec<usize>,
    /// True token count per `[batch, max_sentences]` slot, zero on padding.
    lengths: Vec<usize>,
}

impl TokenBatch {
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn max_sentences(&self) -> usize {
        self.max_sentences
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn sent_counts(&self) -> &[usize] {
        &self.sent_counts
    }

    /// Token ids flattened to `[batch * max_sentences, max_tokens]` order.
    pub fn flat_ids(&self) -> &[usize] {
        &self.ids
    }

    /// Sentence lengths flattened to `[batch * max_sentences]`.
    pub fn flat_lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Token ids of one sentence slot.
    pub fn sentence(&self, row: usize, sent: usize) -> &[usize] {
        let start = (row * self.max_sentences + sent) * self.max_tokens;
        &self.ids[start..start + self.max_tokens]
    }

    fn slice_rows(&self, start: usize, end: usize) -> Self {
        let per_row = self.max_sentences * self.max_tokens;
        Self {
            ids: self.ids[start * per_row..end * per_row].to_vec(),
            batch: end - start,
            max_sentences: self.max_sentences,
            max_tokens: self.max_tokens,
            sent_counts: self.sent_counts[start..end].to_vec(),
            lengths: self.lengths[start * self.max_sentences..end * self.max_sentences].to_vec(),
        }
    }
}

/// Decoded photos, padded to `[batch, max_photos, 3, size, size]`.
#[derive(Debug, Clone)]
pub struct PhotoBatch {
    pixels: Tensor,
    /// True photo count per row.
    counts: Vec<usize>,
    max_photos: usize,
    size: usize,
}

impl PhotoBatch {
    pub fn batch_size(&self) -> usize {
        self.counts.len()
    }

    pub fn max_photos(&self) -> usize {
        self.max_photos
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Pixels as `[batch, max_photos, 3, size, size]`.
    pub fn pixels(&self) -> &Tensor {
        &self.pixels
    }

    fn slice_rows(&self, start: usize, end: usize) -> Self {
        let per_row = self.max_photos * 3 * self.size * self.size;
        let data = self.pixels.data()[start * per_row..end * per_row].to_vec();
        Self {
            pixels: Tensor::from_data(
                &[end - start, self.max_photos, 3, self.size, self.size],
                data,
            ),
            counts: self.counts[start..end].to_vec(),
            max_photos: self.max_photos,
            size: self.size,
        }
    }
}

/// One padded training batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub user_ids: Vec<usize>,
    pub item_ids: Vec<usize>,
    pub ratings: Vec<f32>,
    pub user_docs: TokenBatch,
    pub item_docs: TokenBatch,
    pub photos: PhotoBatch,
}

impl Batch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Splits into at most `n` contiguous row shards with identical padded
    /// extents. Fewer shards come back when the batch has fewer rows than
    /// `n`; empty shards are never produced.
    pub fn split(&self, n: usize) -> Vec<Batch> {
        let n = n.max(1).min(self.len().max(1));
        let base = self.len() / n;
        let rem = self.len() % n;
        let mut shards = Vec::with_capacity(n);
        let mut start = 0;
        for i in 0..n {
            let rows = base + usize::from(i < rem);
            if rows == 0 {
                continue;
            }
            let end = start + rows;
            shards.push(Batch {
                user_ids: self.user_ids[start..end].to_vec(),
                item_ids: self.item_ids[start..end].to_vec(),
                ratings: self.ratings[start..end].to_vec(),
                user_docs: self.user_docs.slice_rows(start, end),
                item_docs: self.item_docs.slice_rows(start, end),
                photos: self.photos.slice_rows(start, end),
            });
            start = end;
        }
        shards
    }
}

/// Builds padded batches from raw samples.
///
/// Samples are ordered longest-document-first before chunking so rows of
/// similar length share a batch and padding stays small, then each batch is
/// padded to its own maxima (subject to the configured caps). Photos are
/// decoded when a batch is yielded, never all at once, so peak pixel memory
/// is bounded by one batch.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    batch_size: usize,
    max_sentences: usize,
    max_tokens: usize,
    max_photos: usize,
    photo_loader: PhotoLoader,
}

impl BatchBuilder {
    /// Creates a builder with the given batch size and photo edge length.
    pub fn new(batch_size: usize, photo_size: usize) -> Self {
        Self {
            batch_size,
            max_sentences: 16,
            max_tokens: 64,
            max_photos: 8,
            photo_loader: PhotoLoader::new(photo_size),
        }
    }

    /// Caps the number of sentences kept per document.
    pub fn with_max_sentences(mut self, max_sentences: usize) -> Self {
        self.max_sentences = max_sentences;
        self
    }

    /// Caps the number of tokens kept per sentence.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Caps the number of photos kept per sample.
    pub fn with_max_photos(mut self, max_photos: usize) -> Self {
        self.max_photos = max_photos;
        self
    }

    /// Tokenizes, orders, and chunks `samples`, yielding one padded batch at
    /// a time. Token ids are prepared up front; photo pixels are decoded
    /// only when their batch is pulled from the iterator, so only the
    /// in-flight batch owns decoded pixel tensors.
    pub fn batches<'a>(
        &'a self,
        samples: &[Sample],
        vocab: &WordEmbeddings,
    ) -> DataResult<BatchIter<'a>> {
        if self.batch_size == 0 {
            return Err(DataError::Batching("batch size must be positive".into()));
        }
        if samples.is_empty() {
            return Err(DataError::Batching("no samples to batch".into()));
        }

        let mut tokenized: Vec<TokenizedSample> = samples
            .iter()
            .map(|s| self.tokenize_sample(s, vocab))
            .collect();

        // Longest documents first so batch-local padding stays tight
        tokenized.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));

        let mut chunks = Vec::with_capacity(tokenized.len().div_ceil(self.batch_size));
        let mut remaining = tokenized;
        while remaining.len() > self.batch_size {
            let tail = remaining.split_off(self.batch_size);
            chunks.push(remaining);
            remaining = tail;
        }
        chunks.push(remaining);

        Ok(BatchIter {
            builder: self,
            chunks: chunks.into_iter(),
        })
    }

    /// Collects every batch of [`BatchBuilder::batches`] into memory at once.
    /// Suited to small sample sets; large photo corpora should iterate.
    pub fn build(&self, samples: &[Sample], vocab: &WordEmbeddings) -> DataResult<Vec<Batch>> {
        self.batches(samples, vocab)?.collect()
    }

    fn tokenize_sample(&self, sample: &Sample, vocab: &WordEmbeddings) -> TokenizedSample {
        let doc = |sentences: &[String]| -> Vec<Vec<usize>> {
            let mut out: Vec<Vec<usize>> = sentences
                .iter()
                .map(|s| {
                    let mut ids = vocab.tokenize(s);
                    ids.truncate(self.max_tokens);
                    ids
                })
                .filter(|ids| !ids.is_empty())
                .collect();
            // Keep the longest sentences when over the cap
            out.sort_by(|a, b| b.len().cmp(&a.len()));
            out.truncate(self.max_sentences);
            out
        };
        TokenizedSample {
            user_id: sample.user_id,
            item_id: sample.item_id,
            rating: sample.rating,
            user_doc: doc(&sample.user_sentences),
            item_doc: doc(&sample.item_sentences),
            photo_paths: sample
                .photo_paths
                .iter()
                .take(self.max_photos)
                .cloned()
                .collect(),
        }
    }

    fn pad_chunk(&self, chunk: &[TokenizedSample]) -> DataResult<Batch> {
        let batch = chunk.len();
        let user_docs = pad_docs(chunk.iter().map(|s| &s.user_doc), batch);
        let item_docs = pad_docs(chunk.iter().map(|s| &s.item_doc), batch);

        let max_photos = chunk.iter().map(|s| s.photo_paths.len()).max().unwrap_or(0);
        let size = self.photo_loader.size();
        let per_photo = self.photo_loader.numel();
        let mut pixels = vec![0.0f32; batch * max_photos * per_photo];
        let mut counts = Vec::with_capacity(batch);
        for (row, sample) in chunk.iter().enumerate() {
            counts.push(sample.photo_paths.len());
            for (v, path) in sample.photo_paths.iter().enumerate() {
                let photo = self.photo_loader.load(path);
                let start = (row * max_photos + v) * per_photo;
                pixels[start..start + per_photo].copy_from_slice(photo.data());
            }
        }

        Ok(Batch {
            user_ids: chunk.iter().map(|s| s.user_id).collect(),
            item_ids: chunk.iter().map(|s| s.item_id).collect(),
            ratings: chunk.iter().map(|s| s.rating).collect(),
            user_docs,
            item_docs,
            photos: PhotoBatch {
                pixels: Tensor::from_data(&[batch, max_photos, 3, size, size], pixels),
                counts,
                max_photos,
                size,
            },
        })
    }
}

/// Lazily yields padded batches from pre-tokenized chunks.
pub struct BatchIter<'a> {
    builder: &'a BatchBuilder,
    chunks: std::vec::IntoIter<Vec<TokenizedSample>>,
}

impl Iterator for BatchIter<'_> {
    type Item = DataResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        Some(self.builder.pad_chunk(&chunk))
    }
}

struct TokenizedSample {
    user_id: usize,
    item_id: usize,
    rating: f32,
    user_doc: Vec<Vec<usize>>,
    item_doc: Vec<Vec<usize>>,
    photo_paths: Vec<String>,
}

impl TokenizedSample {
    /// Longest sentence across both documents, the batch-grouping key.
    fn sort_key(&self) -> usize {
        self.user_doc
            .iter()
            .chain(self.item_doc.iter())
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }
}

fn pad_docs<'a>(docs: impl Iterator<Item = &'a Vec<Vec<usize>>> + Clone, batch: usize) -> TokenBatch {
    let max_sentences = docs.clone().map(|d| d.len()).max().unwrap_or(0).max(1);
    let max_tokens = docs
        .clone()
        .flat_map(|d| d.iter().map(Vec::len))
        .max()
        .unwrap_or(0)
        .max(1);

    let mut ids = vec![0usize; batch * max_sentences * max_tokens];
    let mut sent_counts = Vec::with_capacity(batch);
    let mut lengths = vec![0usize; batch * max_sentences];
    for (row, doc) in docs.enumerate() {
        sent_counts.push(doc.len());
        for (s, sentence) in doc.iter().enumerate() {
            lengths[row * max_sentences + s] = sentence.len();
            let start = (row * max_sentences + s) * max_tokens;
            ids[start..start + sentence.len()].copy_from_slice(sentence);
        }
    }

    TokenBatch {
        ids,
        batch,
        max_sentences,
        max_tokens,
        sent_counts,
        lengths,
    }
}
