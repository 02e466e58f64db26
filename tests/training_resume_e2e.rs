use std::sync::Arc;

use burn_autodiff::Autodiff;
use burn_core::module::AutodiffModule;
use burn_core::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use orinet::checkpoint::{load_checkpoint, CheckpointDir};
use orinet::data::{BatchLoader, PairDataset, PatchSet};
use orinet::descriptor::PixelDescriptor;
use orinet::model::OrientationNetConfig;
use orinet::schedule::{LearningRateSchedule, LinearDecay};
use orinet::train::{run_with_data, sgd_optimizer, TrainConfig, Trainer};

type TB = Autodiff<NdArray<f32>>;

const SIZE: usize = 24;

/// Noise patches, four per label.
fn noise_set(n: usize, seed: u64) -> Arc<PatchSet> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let pixels: Vec<f32> = (0..n * SIZE * SIZE).map(|_| rng.random::<f32>()).collect();
    let labels = (0..n).map(|i| (i / 4) as u64).collect();
    Arc::new(PatchSet::new(SIZE, pixels, labels).unwrap())
}

fn tiny_config(log_dir: &std::path::Path) -> TrainConfig {
    TrainConfig {
        log_dir: log_dir.to_path_buf(),
        num_workers: 2,
        epochs: 2,
        batch_size: 6,
        test_batch_size: 8,
        n_pairs: 18,
        n_test_pairs: 8,
        no_cuda: true,
        patch_size: 12,
        log_interval: 1,
        ..TrainConfig::default()
    }
}

#[test]
fn scheduler_advances_once_per_batch() {
    let device = Default::default();
    let model = OrientationNetConfig {
        patch_size: 12,
        ..Default::default()
    }
    .init::<TB>(&device)
    .unwrap();
    let pairs = Arc::new(PairDataset::sample(noise_set(32, 1), 20, 2).unwrap());
    let loader = BatchLoader::new(pairs, 6, 0).unwrap();
    assert_eq!(loader.num_batches(), 4);

    let schedule = LinearDecay::new(0.01, 6, 20, 3).unwrap();
    let mut trainer = Trainer::new(model, sgd_optimizer::<TB>(1e-4), schedule, 0, 10);
    assert_eq!(trainer.lr(), 0.01);

    let summary = trainer
        .train_epoch(0, &loader, &PixelDescriptor, &device)
        .unwrap();
    assert_eq!(summary.batches, 4);
    assert!(summary.mean_loss.is_finite());
    assert!(summary.mean_geom.is_finite());
    assert_eq!(trainer.schedule().step(), Some(3));
    assert_eq!(trainer.lr(), trainer.schedule().rate_at(3));
    assert_eq!(trainer.lr(), trainer.schedule().current());
}

#[test]
fn training_updates_parameters() {
    let device = Default::default();
    let model = OrientationNetConfig {
        patch_size: 12,
        ..Default::default()
    }
    .init::<TB>(&device)
    .unwrap();
    let fixed_data: Vec<f32> = (0..4 * 12 * 12).map(|i| ((i * 7) % 23) as f32 / 23.0).collect();
    let fixed_patches = || {
        Tensor::<NdArray<f32>, 4>::from_data(
            TensorData::new(fixed_data.clone(), [4, 1, 12, 12]),
            &device,
        )
    };
    let before = model.valid().forward(fixed_patches()).into_data().to_vec::<f32>().unwrap();

    let pairs = Arc::new(PairDataset::sample(noise_set(32, 3), 12, 4).unwrap());
    let loader = BatchLoader::new(pairs, 6, 1).unwrap();
    let schedule = LinearDecay::new(0.1, 6, 12, 1).unwrap();
    let mut trainer = Trainer::new(model, sgd_optimizer::<TB>(0.0), schedule, 0, 10);
    trainer
        .train_epoch(0, &loader, &PixelDescriptor, &device)
        .unwrap();

    let after = trainer
        .model()
        .valid()
        .forward(fixed_patches())
        .into_data()
        .to_vec::<f32>()
        .unwrap();
    assert_ne!(before, after);
}

#[test]
fn run_checkpoints_every_epoch_and_resumes_at_the_stored_epoch() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = tiny_config(tmp.path());
    let train = Arc::new(PairDataset::sample(noise_set(40, 5), cfg.n_pairs, 6).unwrap());
    let test = Arc::new(PairDataset::sample(noise_set(24, 7), cfg.n_test_pairs, 8).unwrap());

    let reports = run_with_data(&cfg, Arc::clone(&train), Arc::clone(&test)).unwrap();
    assert_eq!(reports.len(), 2);
    for r in &reports {
        assert_eq!(r.batches, 1);
        assert!(r.geom_mean.is_finite() && r.desc_mean.is_finite());
    }

    let run_dir = CheckpointDir::create(cfg.run_dir()).unwrap();
    assert_eq!(
        run_dir.dir(),
        tmp.path().join("ONet_sum_pixels_0.01_18").as_path()
    );
    let first = run_dir.path_for(0);
    let second = run_dir.path_for(1);
    assert!(first.is_file());
    assert!(second.is_file());
    let stored = load_checkpoint::<NdArray<f32>>(&second, &Default::default()).unwrap();
    assert_eq!(stored.epoch, 2);

    // `epochs` counts epochs to run: resuming from epoch 0's checkpoint (stored epoch 1) trains
    // epochs 1 and 2.
    let resumed_cfg = TrainConfig {
        resume: Some(first),
        ..cfg.clone()
    };
    let resumed = run_with_data(&resumed_cfg, Arc::clone(&train), Arc::clone(&test)).unwrap();
    assert_eq!(resumed.len(), 2);
    assert!(run_dir.path_for(2).is_file());
    let stored = load_checkpoint::<NdArray<f32>>(&run_dir.path_for(2), &Default::default()).unwrap();
    assert_eq!(stored.epoch, 3);

    // A missing resume path is only a warning; the CLI start epoch applies.
    let missing_cfg = TrainConfig {
        resume: Some(tmp.path().join("missing.mpk")),
        start_epoch: 1,
        ..cfg
    };
    let fresh = run_with_data(&missing_cfg, train, test).unwrap();
    assert_eq!(fresh.len(), 2);
}

#[test]
fn start_epoch_offsets_the_epoch_range() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        start_epoch: 3,
        epochs: 2,
        ..tiny_config(tmp.path())
    };
    let train = Arc::new(PairDataset::sample(noise_set(40, 9), cfg.n_pairs, 10).unwrap());
    let test = Arc::new(PairDataset::sample(noise_set(24, 11), cfg.n_test_pairs, 12).unwrap());

    let reports = run_with_data(&cfg, train, test).unwrap();
    assert_eq!(reports.len(), 2);

    let run_dir = CheckpointDir::create(cfg.run_dir()).unwrap();
    assert!(!run_dir.path_for(2).is_file());
    assert!(run_dir.path_for(3).is_file());
    assert!(run_dir.path_for(4).is_file());
    let last = load_checkpoint::<NdArray<f32>>(&run_dir.path_for(4), &Default::default()).unwrap();
    assert_eq!(last.epoch, 5);
}
