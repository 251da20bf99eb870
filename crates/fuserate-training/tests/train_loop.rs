//! End-to-end training scenarios on a small synthetic dataset.

use fuserate_data::{BatchBuilder, Sample, SampleSet, WordEmbeddings};
use fuserate_model::{checkpoint, ModelConfig, RatingModel};
use fuserate_optimizer::OptimizerConfig;
use fuserate_training::{evaluate_batches, DeviceMesh, Phase, Trainer, TrainerConfig};

fn vocab() -> WordEmbeddings {
    WordEmbeddings::from_vectors(vec![
        ("great".to_string(), vec![0.5, 0.1, -0.2]),
        ("clean".to_string(), vec![0.3, -0.4, 0.1]),
        ("terrible".to_string(), vec![-0.5, 0.2, 0.3]),
        ("noisy".to_string(), vec![-0.2, -0.3, 0.4]),
        ("room".to_string(), vec![0.1, 0.2, 0.1]),
        ("stay".to_string(), vec![-0.1, 0.3, -0.3]),
    ])
    .unwrap()
}

/// Ratings track sentiment words, so there is signal to learn.
fn samples() -> Vec<Sample> {
    let positive = ["great room", "clean stay", "great clean room"];
    let negative = ["terrible room", "noisy stay", "terrible noisy room"];
    (0..12)
        .map(|i| {
            let good = i % 2 == 0;
            let text = if good {
                positive[i % 3]
            } else {
                negative[i % 3]
            };
            Sample {
                user_id: i % 4,
                item_id: i % 6,
                rating: if good { 4.5 } else { 1.5 },
                user_sentences: vec![text.to_string(), "room stay".to_string()],
                item_sentences: vec![text.to_string()],
                photo_paths: vec![],
            }
        })
        .collect()
}

fn fresh_model(vocab: &WordEmbeddings) -> RatingModel {
    RatingModel::new(ModelConfig::small(4, 6), vocab.weights().clone()).unwrap()
}

#[test]
fn test_fit_reduces_training_mse() {
    let vocab = vocab();
    let model = fresh_model(&vocab);

    let builder = BatchBuilder::new(4, 8);
    let all_batches = builder.build(&samples(), &vocab).unwrap();
    let initial_mse =
        evaluate_batches(&model, &DeviceMesh::new(1), &all_batches, Phase::Testing).unwrap();

    let config = TrainerConfig::new(10, 4)
        .with_optimizer(OptimizerConfig::adam(0.02))
        .with_val_fraction(0.25)
        .with_early_stop_patience(10)
        .with_photo_size(8);
    let mut trainer = Trainer::new(model, config).unwrap();
    let report = trainer.fit(SampleSet::new(samples()), &vocab).unwrap();

    assert!(report.epochs_run >= 1);
    let final_mse =
        evaluate_batches(trainer.model(), &DeviceMesh::new(1), &all_batches, Phase::Testing)
            .unwrap();
    assert!(
        final_mse < initial_mse,
        "final {final_mse} vs initial {initial_mse}"
    );
}

#[test]
fn test_two_device_step_tracks_single_device() {
    let vocab = vocab();
    let builder = BatchBuilder::new(4, 8);
    let batches = builder.build(&samples()[..4], &vocab).unwrap();
    let batch = &batches[0];

    let step = |devices: usize| {
        let config = TrainerConfig::new(1, 4)
            .with_optimizer(OptimizerConfig::Sgd { learning_rate: 0.05 })
            .with_num_devices(devices);
        let mut trainer = Trainer::new(fresh_model(&vocab), config).unwrap();
        trainer.train_step(batch).unwrap();
        DeviceMesh::new(1)
            .forward(trainer.model(), batch)
            .unwrap()
    };

    let single = step(1);
    let double = step(2);
    // Even shards make the per-row loss gradient identical; only float
    // accumulation order differs between the two runs.
    for (a, b) in single.data().iter().zip(double.data().iter()) {
        assert!((a - b).abs() < 1e-3, "single {a} vs double {b}");
    }
}

#[test]
fn test_best_checkpoint_written_and_loadable() {
    let vocab = vocab();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("best.ckpt.gz");

    let config = TrainerConfig::new(4, 4)
        .with_optimizer(OptimizerConfig::adam(0.02))
        .with_val_fraction(0.25)
        .with_early_stop_patience(10)
        .with_checkpoint_path(path.clone());
    let mut trainer = Trainer::new(fresh_model(&vocab), config).unwrap();
    let report = trainer.fit(SampleSet::new(samples()), &vocab).unwrap();

    let (metadata, params) = checkpoint::load(&path).unwrap();
    assert_eq!(metadata.epoch, report.best_epoch);
    assert!((metadata.validation_mse as f64 - report.best_val_mse).abs() < 1e-5);

    let mut restored = fresh_model(&vocab);
    restored.load_state_dict(&params).unwrap();

    let batches = BatchBuilder::new(4, 8).build(&samples(), &vocab).unwrap();
    let mse =
        evaluate_batches(&restored, &DeviceMesh::new(1), &batches, Phase::Testing).unwrap();
    assert!(mse.is_finite());
}

#[test]
fn test_early_stop_with_frozen_learning_rate() {
    let vocab = vocab();
    // A zero learning rate never improves validation after the first epoch
    let config = TrainerConfig::new(10, 4)
        .with_optimizer(OptimizerConfig::Sgd { learning_rate: 0.0 })
        .with_val_fraction(0.25)
        .with_early_stop_patience(2);
    let mut trainer = Trainer::new(fresh_model(&vocab), config).unwrap();
    let report = trainer.fit(SampleSet::new(samples()), &vocab).unwrap();

    assert_eq!(report.best_epoch, 1);
    assert_eq!(report.epochs_run, 3);
}

#[test]
fn test_trainer_rejects_degenerate_config() {
    let vocab = vocab();
    assert!(Trainer::new(fresh_model(&vocab), TrainerConfig::new(0, 4)).is_err());
    assert!(Trainer::new(fresh_model(&vocab), TrainerConfig::new(1, 0)).is_err());
}
