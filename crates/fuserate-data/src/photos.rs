//! Photo decoding into normalized pixel tensors.

use fuserate_layers::Tensor;
use image::imageops::FilterType;
use std::path::Path;
use tracing::warn;

/// Decodes photos into `[3, size, size]` float tensors.
///
/// Pixels are scaled to `[0, 1]` and laid out channel-major. A photo that is
/// missing or fails to decode becomes a zero tensor rather than aborting the
/// batch; the gating attention learns to discount such placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PhotoLoader {
    size: usize,
}

impl PhotoLoader {
    /// Creates a loader producing `size` x `size` tensors.
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    /// Edge length of produced tensors.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of floats in one decoded photo.
    pub fn numel(&self) -> usize {
        3 * self.size * self.size
    }

    /// Loads one photo, substituting zeros when decoding fails.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Tensor {
        let path = path.as_ref();
        match image::open(path) {
            Ok(img) => {
                let resized =
                    img.resize_exact(self.size as u32, self.size as u32, FilterType::Triangle);
                let rgb = resized.to_rgb8();
                let hw = self.size * self.size;
                let mut data = vec![0.0f32; 3 * hw];
                for (i, pixel) in rgb.pixels().enumerate() {
                    for c in 0..3 {
                        data[c * hw + i] = pixel.0[c] as f32 / 255.0;
                    }
                }
                Tensor::from_data(&[3, self.size, self.size], data)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "photo decode failed, using zeros");
                Tensor::zeros(&[3, self.size, self.size])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_missing_photo_becomes_zeros() {
        let loader = PhotoLoader::new(4);
        let out = loader.load("/nonexistent/photo.jpg");
        assert_eq!(out.shape(), &[3, 4, 4]);
        assert!(out.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_decode_resize_and_normalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        let img = RgbImage::from_pixel(8, 6, Rgb([255, 0, 0]));
        img.save(&path).unwrap();

        let loader = PhotoLoader::new(4);
        let out = loader.load(&path);
        assert_eq!(out.shape(), &[3, 4, 4]);
        // Red channel saturated, others zero
        for i in 0..16 {
            assert!((out.data()[i] - 1.0).abs() < 1e-3);
            assert!(out.data()[16 + i].abs() < 1e-3);
            assert!(out.data()[32 + i].abs() < 1e-3);
        }
    }
}
