use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::*;
use orinet::descriptor::DescriptorKind;
use orinet::train::{self, MergeMode, TrainConfig};

#[derive(Parser, Debug)]
#[command(name = "orinet-train", about = "Train a patch orientation network")]
struct Args {
    /// Directory holding the PhotoTour scenes.
    #[arg(long, default_value = "datasets/")]
    dataroot: PathBuf,
    /// Scene to train on.
    #[arg(long, default_value = "liberty")]
    train_set: String,
    /// Scene to evaluate on.
    #[arg(long, default_value = "notredame")]
    test_set: String,
    /// Checkpoints go to `<log-dir>/<run name>/`.
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,
    /// Batch loader threads.
    #[arg(long, default_value_t = 8)]
    num_workers: usize,
    /// Checkpoint to resume from.
    #[arg(long)]
    resume: Option<PathBuf>,
    /// First epoch when not resuming.
    #[arg(long, default_value_t = 0)]
    start_epoch: usize,
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 1024)]
    test_batch_size: usize,
    /// Training pairs sampled per epoch.
    #[arg(long, default_value_t = 500_000)]
    n_pairs: usize,
    #[arg(long, default_value_t = 500_000)]
    n_test_pairs: usize,
    /// Base learning rate.
    #[arg(long, default_value_t = 0.01)]
    lr: f64,
    /// Weight decay.
    #[arg(long, default_value_t = 1e-4)]
    wd: f64,
    #[arg(long)]
    no_cuda: bool,
    #[arg(long, default_value = "0")]
    gpu_id: String,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Batches between progress lines.
    #[arg(long, default_value_t = 10)]
    log_interval: usize,
    /// pixels, SIFT or HardNet.
    #[arg(long, default_value = "pixels")]
    descriptor: DescriptorKind,
    /// Pretrained HardNet record.
    #[arg(long, default_value = "HardNet++.mpk")]
    hardnet_weights: PathBuf,
    /// sum or mul.
    #[arg(long, default_value = "sum")]
    merge: MergeMode,
    #[arg(long, default_value_t = 1.0)]
    geom_loss_coef: f64,
    #[arg(long, default_value_t = 0.0)]
    descr_loss_coef: f64,
    /// Crop the orientation network sees.
    #[arg(long, default_value_t = 32)]
    patch_size: usize,
}

impl From<Args> for TrainConfig {
    fn from(a: Args) -> Self {
        TrainConfig {
            dataroot: a.dataroot,
            train_set: a.train_set,
            test_set: a.test_set,
            log_dir: a.log_dir,
            num_workers: a.num_workers,
            resume: a.resume,
            start_epoch: a.start_epoch,
            epochs: a.epochs,
            batch_size: a.batch_size,
            test_batch_size: a.test_batch_size,
            n_pairs: a.n_pairs,
            n_test_pairs: a.n_test_pairs,
            lr: a.lr,
            wd: a.wd,
            no_cuda: a.no_cuda,
            gpu_id: a.gpu_id,
            seed: a.seed,
            log_interval: a.log_interval,
            descriptor: a.descriptor,
            hardnet_weights: a.hardnet_weights,
            merge: a.merge,
            geom_loss_coef: a.geom_loss_coef,
            descr_loss_coef: a.descr_loss_coef,
            patch_size: a.patch_size,
        }
    }
}

fn run(cfg: TrainConfig) -> anyhow::Result<()> {
    info!(
        "Parsed options: {}",
        serde_json::to_string(&cfg).context("serializing options")?
    );
    train::run(&cfg).with_context(|| format!("training run {}", cfg.run_suffix()))?;
    Ok(())
}

fn main() -> ExitCode {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init_timed();

    let cfg = TrainConfig::from(Args::parse());
    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
