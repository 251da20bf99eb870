//! Pretrained word embeddings and tokenization.
//!
//! The embedding file is plain text, one token per line followed by its
//! vector components. Index 0 is reserved for the unknown token and maps to
//! a zero vector; every out-of-vocabulary word tokenizes to it.

use crate::error::{DataError, DataResult};
use fuserate_layers::Tensor;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Index of the unknown-word row.
pub const UNK_ID: usize = 0;

/// A vocabulary backed by pretrained word vectors.
#[derive(Debug, Clone)]
pub struct WordEmbeddings {
    index: HashMap<String, usize>,
    weights: Tensor,
    dim: usize,
}

impl WordEmbeddings {
    /// Loads a `token v1 .. vd` text file.
    ///
    /// The vector dimension is taken from the first line; later lines with a
    /// different component count are an error.
    pub fn load<P: AsRef<Path>>(path: P) -> DataResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut index = HashMap::new();
        let mut data: Vec<f32> = Vec::new();
        let mut dim = 0usize;

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let token = match parts.next() {
                Some(t) => t,
                None => continue,
            };
            let values = parts
                .map(|v| {
                    v.parse::<f32>().map_err(|e| DataError::EmbeddingParse {
                        line: line_no + 1,
                        message: format!("bad component {v:?}: {e}"),
                    })
                })
                .collect::<DataResult<Vec<f32>>>()?;
            if values.is_empty() {
                return Err(DataError::EmbeddingParse {
                    line: line_no + 1,
                    message: "no vector components".to_string(),
                });
            }
            if dim == 0 {
                dim = values.len();
                // Reserve the zero row for unknown words
                data.extend(std::iter::repeat(0.0).take(dim));
            } else if values.len() != dim {
                return Err(DataError::EmbeddingParse {
                    line: line_no + 1,
                    message: format!("expected {dim} components, got {}", values.len()),
                });
            }
            index.insert(token.to_string(), data.len() / dim);
            data.extend(values);
        }

        if dim == 0 {
            return Err(DataError::EmbeddingParse {
                line: 0,
                message: "embedding file is empty".to_string(),
            });
        }
        let vocab = data.len() / dim;
        Ok(Self {
            index,
            weights: Tensor::from_data(&[vocab, dim], data),
            dim,
        })
    }

    /// Builds a vocabulary directly from token / vector pairs.
    pub fn from_vectors(entries: Vec<(String, Vec<f32>)>) -> DataResult<Self> {
        let dim = entries.first().map(|(_, v)| v.len()).unwrap_or(0);
        if dim == 0 {
            return Err(DataError::EmbeddingParse {
                line: 0,
                message: "no embedding vectors given".to_string(),
            });
        }
        let mut index = HashMap::new();
        let mut data = vec![0.0; dim];
        for (line_no, (token, values)) in entries.into_iter().enumerate() {
            if values.len() != dim {
                return Err(DataError::EmbeddingParse {
                    line: line_no + 1,
                    message: format!("expected {dim} components, got {}", values.len()),
                });
            }
            index.insert(token, data.len() / dim);
            data.extend(values);
        }
        let vocab = data.len() / dim;
        Ok(Self {
            index,
            weights: Tensor::from_data(&[vocab, dim], data),
            dim,
        })
    }

    /// Number of rows including the unknown row.
    pub fn vocab_size(&self) -> usize {
        self.weights.shape()[0]
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The `[vocab, dim]` weight matrix, unknown row first.
    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    /// Maps a single token to its id, unknown words to [`UNK_ID`].
    pub fn token_id(&self, token: &str) -> usize {
        self.index.get(token).copied().unwrap_or(UNK_ID)
    }

    /// Tokenizes one sentence into word ids.
    ///
    /// Lowercases, splits on whitespace, and strips surrounding punctuation;
    /// tokens that become empty are dropped.
    pub fn tokenize(&self, sentence: &str) -> Vec<usize> {
        sentence
            .split_whitespace()
            .filter_map(|raw| {
                let token = raw
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase();
                if token.is_empty() {
                    None
                } else {
                    Some(self.token_id(&token))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn toy() -> WordEmbeddings {
        WordEmbeddings::from_vectors(vec![
            ("good".to_string(), vec![1.0, 0.0]),
            ("room".to_string(), vec![0.0, 1.0]),
        ])
        .unwrap()
    }

    #[test]
    fn test_load_reserves_zero_unk_row() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "good 1.0 0.5").unwrap();
        writeln!(file, "room -0.5 0.25").unwrap();

        let emb = WordEmbeddings::load(file.path()).unwrap();
        assert_eq!(emb.vocab_size(), 3);
        assert_eq!(emb.dim(), 2);
        assert_eq!(emb.weights().row(UNK_ID), &[0.0, 0.0]);
        assert_eq!(emb.token_id("good"), 1);
        assert_eq!(emb.token_id("missing"), UNK_ID);
        assert_eq!(emb.weights().row(2), &[-0.5, 0.25]);
    }

    #[test]
    fn test_load_rejects_ragged_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "good 1.0 0.5").unwrap();
        writeln!(file, "room -0.5").unwrap();

        let err = WordEmbeddings::load(file.path()).unwrap_err();
        assert!(matches!(err, DataError::EmbeddingParse { line: 2, .. }));
    }

    #[test]
    fn test_tokenize_normalizes_and_maps_unknowns() {
        let emb = toy();
        let ids = emb.tokenize("Good room, (terrible) view!");
        assert_eq!(ids, vec![1, 2, UNK_ID, UNK_ID]);
        assert!(emb.tokenize("...   ...").is_empty());
    }
}
