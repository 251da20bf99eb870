//! Streaming evaluation metrics.

/// Accumulates squared error across batches.
///
/// The final mean divides by the number of *samples*, not batches, so
/// unevenly sized batches (the usual tail batch) are weighted correctly.
#[derive(Debug, Clone, Default)]
pub struct MseRecorder {
    sum_squared_error: f64,
    count: u64,
}

impl MseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates one batch of predictions against targets.
    ///
    /// # Panics
    ///
    /// Panics if the slices differ in length.
    pub fn record(&mut self, predictions: &[f32], targets: &[f32]) {
        assert_eq!(
            predictions.len(),
            targets.len(),
            "predictions and targets must align"
        );
        for (p, t) in predictions.iter().zip(targets.iter()) {
            let err = (p - t) as f64;
            self.sum_squared_error += err * err;
        }
        self.count += predictions.len() as u64;
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean squared error over everything recorded so far.
    pub fn mse(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_squared_error / self.count as f64
        }
    }

    /// Clears the accumulator.
    pub fn reset(&mut self) {
        self.sum_squared_error = 0.0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mse_across_uneven_batches() {
        let mut recorder = MseRecorder::new();
        recorder.record(&[1.0, 2.0, 3.0], &[1.0, 1.0, 1.0]);
        recorder.record(&[4.0], &[2.0]);
        // (0 + 1 + 4 + 4) / 4
        assert!((recorder.mse() - 2.25).abs() < 1e-9);
        assert_eq!(recorder.count(), 4);

        recorder.reset();
        assert_eq!(recorder.count(), 0);
        assert_eq!(recorder.mse(), 0.0);
    }
}
