//! Training and evaluation loops.
//!
//! Per training batch: random affine augmentation, [`forward_views`], hardest-in-batch triplet
//! loss on the descriptors, backward, SGD step, then one [`LinearDecay`] update. The geometric
//! disagreement between the anchor and aligned positive transforms is only monitored.

use core::fmt;
use core::str::FromStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn_core as burn;

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::ElementConversion;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_optim::decay::WeightDecayConfig;
use burn_optim::momentum::MomentumConfig;
use burn_optim::{GradientsParams, Optimizer, SgdConfig};
use log::{info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::augment::{random_affine, AugmentConfig};
use crate::checkpoint::{self, CheckpointDir};
use crate::data::{load_phototour, BatchLoader, PairDataset};
use crate::descriptor::{Descriptor, DescriptorKind, PatchDescriptor};
use crate::loss::{
    descriptor_distance, geometric_distance, hardest_triplet_margin_loss, TripletMarginConfig,
};
use crate::model::{OrientationNet, OrientationNetConfig, TransformPredictor};
use crate::pipeline::{affine_tensors, forward_views};
use crate::schedule::{LearningRateSchedule, LinearDecay};
use crate::{Error, Result};

/// Backend used by [`run`].
pub type TrainBackend = Autodiff<NdArray<f32>>;

/// How the geometric and descriptor terms would be combined.
///
/// Only recorded in the run name; the optimized loss is the descriptor loss alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    #[default]
    Sum,
    Mul,
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeMode::Sum => "sum",
            MergeMode::Mul => "mul",
        })
    }
}

impl FromStr for MergeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(MergeMode::Sum),
            "mul" => Ok(MergeMode::Mul),
            _ => Err(Error::Domain("merge must be one of: sum, mul")),
        }
    }
}

impl Serialize for MergeMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Every knob of a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub dataroot: PathBuf,
    pub train_set: String,
    pub test_set: String,
    pub log_dir: PathBuf,
    pub num_workers: usize,
    pub resume: Option<PathBuf>,
    pub start_epoch: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub n_pairs: usize,
    pub n_test_pairs: usize,
    pub lr: f64,
    pub wd: f64,
    pub no_cuda: bool,
    pub gpu_id: String,
    pub seed: u64,
    pub log_interval: usize,
    pub descriptor: DescriptorKind,
    pub hardnet_weights: PathBuf,
    pub merge: MergeMode,
    pub geom_loss_coef: f64,
    pub descr_loss_coef: f64,
    pub patch_size: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataroot: PathBuf::from("datasets/"),
            train_set: "liberty".into(),
            test_set: "notredame".into(),
            log_dir: PathBuf::from("./logs"),
            num_workers: 8,
            resume: None,
            start_epoch: 0,
            epochs: 10,
            batch_size: 128,
            test_batch_size: 1024,
            n_pairs: 500_000,
            n_test_pairs: 500_000,
            lr: 0.01,
            wd: 1e-4,
            no_cuda: false,
            gpu_id: "0".into(),
            seed: 0,
            log_interval: 10,
            descriptor: DescriptorKind::Pixels,
            hardnet_weights: PathBuf::from("HardNet++.mpk"),
            merge: MergeMode::Sum,
            geom_loss_coef: 1.0,
            descr_loss_coef: 0.0,
            patch_size: 32,
        }
    }
}

impl TrainConfig {
    /// `ONet_<merge>_<descriptor>_<lr>_<n_pairs>`
    pub fn run_suffix(&self) -> String {
        format!(
            "ONet_{}_{}_{}_{}",
            self.merge, self.descriptor, self.lr, self.n_pairs
        )
    }

    pub fn run_dir(&self) -> PathBuf {
        self.log_dir.join(self.run_suffix())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return Err(Error::Domain("batch sizes must be >= 1"));
        }
        if self.n_pairs == 0 || self.n_test_pairs == 0 {
            return Err(Error::Domain("pair counts must be >= 1"));
        }
        if self.epochs == 0 {
            return Err(Error::Domain("epochs must be >= 1"));
        }
        if self.log_interval == 0 {
            return Err(Error::Domain("log_interval must be >= 1"));
        }
        if !self.lr.is_finite() || !self.wd.is_finite() || self.wd < 0.0 {
            return Err(Error::Domain("lr must be finite and wd finite and nonnegative"));
        }
        Ok(())
    }
}

/// SGD with momentum 0.9, dampening 0.9 and L2 weight decay `wd`.
pub fn sgd_optimizer<B: AutodiffBackend>(wd: f64) -> impl Optimizer<OrientationNet<B>, B> {
    SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(0.9)
                .with_dampening(0.9)
                .with_nesterov(false),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(wd as f32)))
        .init::<B, OrientationNet<B>>()
}

/// Aggregates of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub batches: usize,
    pub mean_loss: f64,
    pub mean_geom: f64,
}

/// Owns the model, its optimizer, the schedule and the augmentation RNG.
pub struct Trainer<B: AutodiffBackend, O> {
    model: OrientationNet<B>,
    optim: O,
    schedule: LinearDecay,
    lr: f64,
    rng: ChaCha8Rng,
    augment: AugmentConfig,
    loss: TripletMarginConfig,
    log_interval: usize,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<OrientationNet<B>, B>,
{
    pub fn new(
        model: OrientationNet<B>,
        optim: O,
        schedule: LinearDecay,
        seed: u64,
        log_interval: usize,
    ) -> Self {
        Self {
            model,
            optim,
            lr: schedule.current(),
            schedule,
            rng: ChaCha8Rng::seed_from_u64(seed),
            augment: AugmentConfig::default(),
            loss: TripletMarginConfig::default(),
            log_interval: log_interval.max(1),
        }
    }

    pub fn model(&self) -> &OrientationNet<B> {
        &self.model
    }

    /// Rate the next optimizer step will use.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn schedule(&self) -> &LinearDecay {
        &self.schedule
    }

    /// One pass over `loader` (its flips, if any, are drawn for `epoch`).
    pub fn train_epoch<D: PatchDescriptor<B>>(
        &mut self,
        epoch: usize,
        loader: &BatchLoader,
        descriptor: &D,
        device: &B::Device,
    ) -> Result<EpochSummary> {
        let total_batches = loader.num_batches();
        let mut loss_sum = 0.0;
        let mut geom_sum = 0.0;
        let mut batches = 0usize;

        for (batch_idx, batch) in loader.pass(epoch).enumerate() {
            let batch = batch?;
            let (n, size) = (batch.len, batch.patch_size);
            let (anchors, positives) = batch.into_tensors::<B>(device);
            let aug = random_affine(n, size, size, &self.augment, &mut self.rng)?;
            let (lafs, inv_rot) = affine_tensors::<B>(&aug, device);

            let out = forward_views(&self.model, descriptor, anchors, positives, lafs, inv_rot)?;
            let geom = geometric_distance(
                out.transform_a_rot.detach(),
                out.transform_p_aligned.detach(),
            )
            .mean()
            .into_scalar()
            .elem::<f64>();
            let loss = hardest_triplet_margin_loss(out.desc_a, out.desc_p, &self.loss)?;
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optim.step(self.lr, self.model.clone(), grads);
            self.lr = self.schedule.advance();

            if batch_idx % self.log_interval == 0 {
                info!(
                    "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}, {:.6}",
                    epoch,
                    batch_idx * n,
                    loader.dataset_len(),
                    100.0 * batch_idx as f64 / total_batches as f64,
                    loss_value,
                    geom
                );
            }
            loss_sum += loss_value;
            geom_sum += geom;
            batches += 1;
        }

        let denom = batches.max(1) as f64;
        Ok(EpochSummary {
            batches,
            mean_loss: loss_sum / denom,
            mean_geom: geom_sum / denom,
        })
    }
}

/// Mean of per-batch means over an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalReport {
    pub geom_mean: f64,
    pub desc_mean: f64,
    pub batches: usize,
}

/// Evaluation knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalConfig {
    pub seed: u64,
    pub max_angle: f32,
    pub log_interval: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            max_angle: core::f32::consts::PI,
            log_interval: 10,
        }
    }
}

/// Rotation-only evaluation; reads the model, never updates it.
pub fn evaluate<B, P, D>(
    predictor: &P,
    descriptor: &D,
    loader: &BatchLoader,
    cfg: &EvalConfig,
    epoch: usize,
    device: &B::Device,
) -> Result<EvalReport>
where
    B: Backend,
    P: TransformPredictor<B>,
    D: PatchDescriptor<B>,
{
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let augment = AugmentConfig::rotation_only(cfg.max_angle);
    let total_batches = loader.num_batches();
    let log_interval = cfg.log_interval.max(1);
    let mut geom_sum = 0.0;
    let mut desc_sum = 0.0;
    let mut batches = 0usize;

    for (batch_idx, batch) in loader.iter().enumerate() {
        let batch = batch?;
        let (n, size) = (batch.len, batch.patch_size);
        let (anchors, positives) = batch.into_tensors::<B>(device);
        let aug = random_affine(n, size, size, &augment, &mut rng)?;
        let (lafs, inv_rot) = affine_tensors::<B>(&aug, device);

        let out = forward_views(predictor, descriptor, anchors, positives, lafs, inv_rot)?;
        geom_sum += geometric_distance(out.transform_a_rot, out.transform_p_aligned)
            .mean()
            .into_scalar()
            .elem::<f64>();
        desc_sum += descriptor_distance(out.desc_a, out.desc_p)
            .mean()
            .into_scalar()
            .elem::<f64>();
        batches += 1;

        if batch_idx % log_interval == 0 {
            info!(
                " Test Epoch: {} [{}/{} ({:.0}%)]",
                epoch,
                batch_idx * n,
                loader.dataset_len(),
                100.0 * batch_idx as f64 / total_batches as f64
            );
        }
    }

    if batches == 0 {
        return Err(Error::Domain("evaluation set is empty"));
    }
    Ok(EvalReport {
        geom_mean: geom_sum / batches as f64,
        desc_mean: desc_sum / batches as f64,
        batches,
    })
}

/// Load a PhotoTour scene and sample `n_pairs` matching pairs from it.
pub fn load_pairs(dataroot: &Path, name: &str, n_pairs: usize, seed: u64) -> Result<PairDataset> {
    let patches = load_phototour(&dataroot.join(name))?;
    PairDataset::sample(Arc::new(patches), n_pairs, seed)
}

/// Full run over the PhotoTour scenes named in `cfg`.
pub fn run(cfg: &TrainConfig) -> Result<Vec<EvalReport>> {
    cfg.validate()?;
    info!("loading train set {}", cfg.train_set);
    let train = load_pairs(&cfg.dataroot, &cfg.train_set, cfg.n_pairs, cfg.seed)?;
    info!("loading test set {}", cfg.test_set);
    let test = load_pairs(
        &cfg.dataroot,
        &cfg.test_set,
        cfg.n_test_pairs,
        cfg.seed.wrapping_add(1),
    )?;
    run_with_data(cfg, Arc::new(train), Arc::new(test))
}

/// Train `epochs` epochs starting at `start_epoch` (or the resumed epoch), checkpointing and
/// evaluating after every epoch.
pub fn run_with_data(
    cfg: &TrainConfig,
    train: Arc<PairDataset>,
    test: Arc<PairDataset>,
) -> Result<Vec<EvalReport>> {
    cfg.validate()?;
    if !cfg.no_cuda {
        warn!(
            "GPU {} requested; training runs on the CPU ndarray backend",
            cfg.gpu_id
        );
    }
    let device = Default::default();

    let ckpt = CheckpointDir::create(cfg.run_dir())?;
    info!("run directory {}", ckpt.dir().display());

    let mut model = OrientationNetConfig {
        patch_size: cfg.patch_size,
        ..OrientationNetConfig::default()
    }
    .init::<TrainBackend>(&device)?;

    let mut start_epoch = cfg.start_epoch;
    if let Some(path) = &cfg.resume {
        let (restored, stored) = checkpoint::resume(path, model, &device)?;
        model = restored;
        if let Some(epoch) = stored {
            start_epoch = epoch;
        }
    }

    let descriptor = Descriptor::<TrainBackend>::from_kind(
        cfg.descriptor,
        cfg.patch_size,
        &cfg.hardnet_weights,
        &device,
    )?;
    let eval_descriptor = descriptor.valid();

    let schedule = LinearDecay::new(cfg.lr, cfg.batch_size, cfg.n_pairs, cfg.epochs)?;
    let mut trainer = Trainer::new(
        model,
        sgd_optimizer::<TrainBackend>(cfg.wd),
        schedule,
        cfg.seed,
        cfg.log_interval,
    );

    let train_loader =
        BatchLoader::new(train, cfg.batch_size, cfg.num_workers)?.with_fliprot(cfg.seed);
    let test_loader = BatchLoader::new(test, cfg.test_batch_size, cfg.num_workers)?;
    let eval_cfg = EvalConfig {
        seed: cfg.seed,
        log_interval: cfg.log_interval,
        ..EvalConfig::default()
    };

    let mut reports = Vec::new();
    for epoch in start_epoch..start_epoch + cfg.epochs {
        let summary = trainer.train_epoch(epoch, &train_loader, &descriptor, &device)?;
        info!(
            "epoch {epoch}: {} batches, mean loss {:.6}, mean geom {:.6}, lr {:.6}",
            summary.batches,
            summary.mean_loss,
            summary.mean_geom,
            trainer.lr()
        );
        let path = ckpt.save(trainer.model(), epoch)?;
        info!("saved {}", path.display());

        let eval_model = trainer.model().valid();
        let report = evaluate(
            &eval_model,
            &eval_descriptor,
            &test_loader,
            &eval_cfg,
            epoch,
            &device,
        )?;
        println!("Test set: Geom MSE: {:.8}", report.geom_mean);
        println!("Test set: Desc dist: {:.8}", report.desc_mean);
        reports.push(report);
    }
    Ok(reports)
}
