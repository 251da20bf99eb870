//! Gzipped JSON checkpoints.
//!
//! A checkpoint holds the full state dict plus training metadata in a single
//! gzip-compressed JSON document. Writes go through a temporary file in the
//! destination directory followed by a rename, so a crash mid-write never
//! leaves a truncated checkpoint behind.

use crate::error::{ModelError, ModelResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fuserate_layers::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use tracing::info;

/// Training context stored alongside the parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch after which this checkpoint was taken (1-based).
    pub epoch: usize,
    /// Validation mean squared error at that epoch.
    pub validation_mse: f32,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    metadata: CheckpointMetadata,
    params: BTreeMap<String, Tensor>,
}

/// Writes a checkpoint atomically.
pub fn save<P: AsRef<Path>>(
    path: P,
    metadata: CheckpointMetadata,
    params: BTreeMap<String, Tensor>,
) -> ModelResult<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file = CheckpointFile { metadata, params };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
        serde_json::to_writer(&mut encoder, &file)?;
        encoder.finish()?;
    }
    tmp.as_file_mut().flush()?;
    tmp.persist(path).map_err(|e| ModelError::Io(e.error))?;
    info!(path = %path.display(), epoch = file.metadata.epoch, "checkpoint written");
    Ok(())
}

/// Reads a checkpoint written by [`save`].
pub fn load<P: AsRef<Path>>(
    path: P,
) -> ModelResult<(CheckpointMetadata, BTreeMap<String, Tensor>)> {
    let file = File::open(path.as_ref())?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let parsed: CheckpointFile = serde_json::from_reader(decoder)?;
    Ok((parsed.metadata, parsed.params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        params.insert(
            "fusion.output.weights".to_string(),
            Tensor::from_data(&[2, 1], vec![0.5, -0.25]),
        );
        params.insert("fusion.output.bias".to_string(), Tensor::zeros(&[1]));
        params
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt.gz");

        let metadata = CheckpointMetadata {
            epoch: 3,
            validation_mse: 0.75,
        };
        save(&path, metadata, params()).unwrap();

        let (loaded_meta, loaded_params) = load(&path).unwrap();
        assert_eq!(loaded_meta.epoch, 3);
        assert!((loaded_meta.validation_mse - 0.75).abs() < 1e-6);
        assert_eq!(loaded_params, params());
    }

    #[test]
    fn test_save_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt.gz");

        for epoch in 1..=2 {
            let metadata = CheckpointMetadata {
                epoch,
                validation_mse: 1.0 / epoch as f32,
            };
            save(&path, metadata, params()).unwrap();
        }
        let (metadata, _) = load(&path).unwrap();
        assert_eq!(metadata.epoch, 2);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load("/nonexistent/model.ckpt.gz").unwrap_err();
        assert!(matches!(err, ModelError::Io(_)));
    }
}
