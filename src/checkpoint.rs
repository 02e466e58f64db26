//! Checkpoints: `{epoch, state_dict}` records, one file per epoch.
//!
//! The stored `epoch` is the index of the epoch that just finished plus one, and resuming sets
//! the start epoch to that stored value as-is.

use std::fs;
use std::path::{Path, PathBuf};

use burn_core as burn;

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::Backend;
use log::{info, warn};

use crate::model::{OrientationNet, OrientationNetRecord};
use crate::Result;

/// File format for checkpoints and pretrained weights (named MessagePack, full precision).
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

const EXTENSION: &str = "mpk";

/// What a checkpoint file holds.
#[derive(Record)]
pub struct CheckpointRecord<B: Backend> {
    pub epoch: usize,
    pub state_dict: OrientationNetRecord<B>,
}

/// A run directory that receives `checkpoint_<epoch>.mpk` files.
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    dir: PathBuf,
}

impl CheckpointDir {
    /// Use `dir`, creating it if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/checkpoint_<epoch>.mpk`
    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir
            .join(format!("checkpoint_{epoch}"))
            .with_extension(EXTENSION)
    }

    /// Persist `model` after finishing `epoch`; the record stores `epoch + 1`.
    pub fn save<B: Backend>(&self, model: &OrientationNet<B>, epoch: usize) -> Result<PathBuf> {
        let path = self.path_for(epoch);
        let record = CheckpointRecord::<B> {
            epoch: epoch + 1,
            state_dict: model.clone().into_record(),
        };
        Recorder::<B>::record(&CheckpointRecorder::new(), record, path.clone())?;
        Ok(path)
    }
}

/// Read a checkpoint file.
pub fn load_checkpoint<B: Backend>(path: &Path, device: &B::Device) -> Result<CheckpointRecord<B>> {
    let record = Recorder::<B>::load(&CheckpointRecorder::new(), path.to_path_buf(), device)?;
    Ok(record)
}

/// Restore `model` from `path` if it exists.
///
/// Returns the model and the stored epoch to start from; a missing file is a warning, not an
/// error, and leaves the model untouched.
pub fn resume<B: Backend>(
    path: &Path,
    model: OrientationNet<B>,
    device: &B::Device,
) -> Result<(OrientationNet<B>, Option<usize>)> {
    if !path.with_extension(EXTENSION).is_file() {
        warn!("=> no checkpoint found at {}", path.display());
        return Ok((model, None));
    }
    info!("=> loading checkpoint {}", path.display());
    let record = load_checkpoint::<B>(path, device)?;
    Ok((model.load_record(record.state_dict), Some(record.epoch)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrientationNetConfig;
    use burn::tensor::{Tensor, TensorData};
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn fixed_patches() -> Tensor<B, 4> {
        let device = Default::default();
        let data: Vec<f32> = (0..4 * 32 * 32).map(|i| ((i * 31) % 97) as f32 / 97.0).collect();
        Tensor::from_data(TensorData::new(data, [4, 1, 32, 32]), &device)
    }

    #[test]
    fn save_then_resume_restores_parameters_and_epoch() {
        let device = Default::default();
        let tmp = tempfile::tempdir().unwrap();
        let ckpt = CheckpointDir::create(tmp.path().join("run")).unwrap();

        let model = OrientationNetConfig::default().init::<B>(&device).unwrap();
        let path = ckpt.save(&model, 4).unwrap();
        assert_eq!(path, tmp.path().join("run").join("checkpoint_4.mpk"));

        let fresh = OrientationNetConfig::default().init::<B>(&device).unwrap();
        let (restored, start) = resume(&path, fresh, &device).unwrap();
        assert_eq!(start, Some(5));

        let a = model.forward(fixed_patches()).into_data().to_vec::<f32>().unwrap();
        let b = restored.forward(fixed_patches()).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_checkpoint_is_not_fatal() {
        let device = Default::default();
        let tmp = tempfile::tempdir().unwrap();
        let model = OrientationNetConfig::default().init::<B>(&device).unwrap();
        let before = model.forward(fixed_patches()).into_data().to_vec::<f32>().unwrap();

        let (model, start) = resume(&tmp.path().join("nope.mpk"), model, &device).unwrap();
        assert_eq!(start, None);
        let after = model.forward(fixed_patches()).into_data().to_vec::<f32>().unwrap();
        assert_eq!(before, after);
    }
}
